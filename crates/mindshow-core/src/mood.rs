//! Color mood mapping
//!
//! Turns attention and relaxation into one continuous scalar in `[0, 1]`
//! (0 warm / engaged, 1 cool / relaxed) in three steps:
//!
//! 1. weighted contributions around 0.5, scaled by an engagement-dependent
//!    intensity
//! 2. quadratic S-curve ease ([`s_curve`])
//! 3. exponential moving average ([`ExponentialSmoother`])

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::classifier::MetricNormalizer;
use crate::config::Tunables;
use crate::math::{clamp01, s_curve, ExponentialSmoother};
use crate::types::{FeatureSample, Metrics};

/// Number of smoothed values kept for diagnostics.
pub const MOOD_HISTORY_LEN: usize = 30;

/// Mood before any sample has arrived.
pub const INITIAL_MOOD: f64 = 0.5;

/// Mood mapping parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoodConfig {
    /// Ratio normalization shared with the classifier
    pub normalizer: MetricNormalizer,
    /// EMA factor in `(0, 1]`
    pub smoothing: f64,
    /// Intensity at zero engagement
    pub intensity_scale: f64,
    /// Warm pull of attention
    pub attention_weight: f64,
    /// Cool pull of relaxation
    pub relaxation_weight: f64,
}

impl Default for MoodConfig {
    fn default() -> Self {
        Self::from(&Tunables::default())
    }
}

impl From<&Tunables> for MoodConfig {
    fn from(t: &Tunables) -> Self {
        Self {
            normalizer: MetricNormalizer::from(t),
            smoothing: t.color_mood_smoothing,
            intensity_scale: t.color_mood_intensity_scale,
            attention_weight: t.color_mood_attention_weight,
            relaxation_weight: t.color_mood_relaxation_weight,
        }
    }
}

impl MoodConfig {
    /// Instantaneous mood before easing.
    #[must_use]
    pub fn raw_mood(&self, metrics: &Metrics) -> f64 {
        let attention_contribution = (metrics.attention - 0.5) * -self.attention_weight;
        let relaxation_contribution = (metrics.relaxation - 0.5) * self.relaxation_weight;
        let intensity = self.intensity_scale + metrics.engagement() * (1.0 - self.intensity_scale);
        clamp01(0.5 + (attention_contribution + relaxation_contribution) * intensity)
    }
}

/// Per-stage values of one mood update.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoodReading {
    /// Clamped linear mood
    pub raw: f64,
    /// After the S-curve
    pub eased: f64,
    /// After the EMA, the value sent to devices
    pub smoothed: f64,
}

/// Stateful mood mapper.
#[derive(Clone, Debug)]
pub struct MoodMapper {
    config: MoodConfig,
    smoother: ExponentialSmoother,
    history: VecDeque<f64>,
    last: MoodReading,
}

impl MoodMapper {
    /// Create a mapper resting at [`INITIAL_MOOD`].
    #[must_use]
    pub fn new(config: MoodConfig) -> Self {
        Self {
            smoother: ExponentialSmoother::new(config.smoothing, INITIAL_MOOD),
            config,
            history: VecDeque::with_capacity(MOOD_HISTORY_LEN),
            last: MoodReading {
                raw: INITIAL_MOOD,
                eased: INITIAL_MOOD,
                smoothed: INITIAL_MOOD,
            },
        }
    }

    /// Feed one sample and return the smoothed mood.
    pub fn update(&mut self, sample: &FeatureSample) -> f64 {
        let metrics = self.config.normalizer.metrics(sample);
        self.update_metrics(metrics).smoothed
    }

    /// Feed precomputed metrics and return every stage.
    pub fn update_metrics(&mut self, metrics: Metrics) -> MoodReading {
        let raw = self.config.raw_mood(&metrics);
        let eased = s_curve(raw);
        let smoothed = clamp01(self.smoother.update(eased));

        if self.history.len() == MOOD_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(smoothed);

        self.last = MoodReading { raw, eased, smoothed };
        tracing::trace!(raw, eased, smoothed, "mood update");
        self.last
    }

    /// Current smoothed mood
    #[must_use]
    pub fn value(&self) -> f64 {
        self.smoother.value()
    }

    /// Stages of the latest update
    #[must_use]
    pub fn last_reading(&self) -> MoodReading {
        self.last
    }

    /// Recent smoothed values, oldest first
    pub fn history(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> &MoodConfig {
        &self.config
    }

    /// Replace parameters; the running value is kept.
    pub fn set_config(&mut self, config: MoodConfig) {
        self.smoother.set_alpha(config.smoothing);
        self.config = config;
    }
}

impl Default for MoodMapper {
    fn default() -> Self {
        Self::new(MoodConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn warm_metrics() -> Metrics {
        Metrics::new(0.8, 0.2)
    }

    #[test]
    fn test_warm_bias_stages() {
        let config = MoodConfig::default();
        let raw = config.raw_mood(&warm_metrics());
        assert!((raw - 0.32).abs() < 1e-9);
        assert!((s_curve(raw) - 0.2048).abs() < 1e-9);
    }

    #[test]
    fn test_converges_without_overshoot() {
        let mut mapper = MoodMapper::default();
        let target = 0.2048;

        let mut prev = mapper.value();
        for _ in 0..100 {
            let reading = mapper.update_metrics(warm_metrics());
            assert!(reading.smoothed <= prev + 1e-12);
            assert!(reading.smoothed >= target - 1e-9);
            prev = reading.smoothed;
        }
        assert!((prev - target).abs() < 1e-6);
    }

    #[test]
    fn test_step_bounded_by_alpha() {
        let mut mapper = MoodMapper::default();
        let alpha = mapper.config().smoothing;
        let extremes = [Metrics::new(1.0, 0.0), Metrics::new(0.0, 1.0)];

        let mut prev = mapper.value();
        for i in 0..50 {
            let next = mapper.update_metrics(extremes[i % 2]).smoothed;
            assert!((next - prev).abs() <= alpha + 1e-12);
            assert!((0.0..=1.0).contains(&next));
            prev = next;
        }
    }

    #[test]
    fn test_bounded_for_any_finite_sample() {
        let mut mapper = MoodMapper::default();
        let samples = [
            FeatureSample::from_powers(0.0, 1e-300, 1e300, 1e300, 0.0),
            FeatureSample::from_powers(1.0, 1e300, 1e-300, 0.0, 1.0),
            FeatureSample::new(),
            FeatureSample::from_powers(5.0, 0.1, 9.0, 0.1, 2.0),
        ];
        for sample in samples.iter().cycle().take(40) {
            let mood = mapper.update(sample);
            assert!((0.0..=1.0).contains(&mood));
        }
    }

    #[test]
    fn test_silent_alpha_keeps_mood_neutral() {
        let mut mapper = MoodMapper::default();
        let mood = mapper.update(&FeatureSample::from_powers(1.0, 1.0, 0.0, 1.0, 1.0));
        assert!((mood - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_neutral_metrics_rest_at_half() {
        let mut mapper = MoodMapper::default();
        let mood = mapper.update(&FeatureSample::new());
        assert!((mood - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_history_capped() {
        let mut mapper = MoodMapper::default();
        for _ in 0..(MOOD_HISTORY_LEN + 12) {
            mapper.update_metrics(warm_metrics());
        }
        assert_eq!(mapper.history().count(), MOOD_HISTORY_LEN);
        assert_eq!(mapper.history().last(), Some(mapper.value()));
    }

    #[test]
    fn test_set_config_changes_rate_only() {
        let mut mapper = MoodMapper::default();
        mapper.update_metrics(warm_metrics());
        let before = mapper.value();

        let config = MoodConfig {
            smoothing: 1.0,
            ..*mapper.config()
        };
        mapper.set_config(config);
        assert_eq!(mapper.value(), before);
        let after = mapper.update_metrics(warm_metrics()).smoothed;
        assert!((after - 0.2048).abs() < 1e-9);
    }
}
