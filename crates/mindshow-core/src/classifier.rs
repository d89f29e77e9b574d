//! Debounced brain-state classification
//!
//! Band powers become two ratios, `beta/alpha` (attention) and
//! `alpha/theta` (relaxation), which are normalized into `[0, 1]` and
//! thresholded into a candidate [`BrainState`]. The candidate only becomes
//! the current state after it has disagreed with it for
//! `confidence_required` ticks and at least `min_dwell` has passed since the
//! previous transition.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::Tunables;
use crate::math::{band_ratio, LinearRange};
use crate::types::{BrainState, EegBand, FeatureSample, Metrics};

/// Neutral score substituted for an unusable ratio.
pub const NEUTRAL_METRIC: f64 = 0.5;

// ============================================================================
// Metric Normalization
// ============================================================================

/// Maps band powers onto normalized attention and relaxation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricNormalizer {
    /// Raw beta/alpha range
    pub attention_range: LinearRange,
    /// Raw alpha/theta range
    pub relaxation_range: LinearRange,
}

impl MetricNormalizer {
    /// Guard added to ratio denominators.
    pub const EPSILON: f64 = 1e-10;

    /// Create a normalizer over the given raw ranges.
    #[must_use]
    pub const fn new(attention_range: LinearRange, relaxation_range: LinearRange) -> Self {
        Self {
            attention_range,
            relaxation_range,
        }
    }

    /// Compute normalized metrics for one sample.
    ///
    /// Each ratio falls back to [`NEUTRAL_METRIC`] independently when its
    /// bands are unusable.
    #[must_use]
    pub fn metrics(&self, sample: &FeatureSample) -> Metrics {
        let alpha = sample.power(EegBand::Alpha);
        let attention = band_ratio(sample.power(EegBand::Beta), alpha, Self::EPSILON)
            .map_or(NEUTRAL_METRIC, |r| self.attention_range.normalize(r));
        let relaxation = band_ratio(alpha, sample.power(EegBand::Theta), Self::EPSILON)
            .map_or(NEUTRAL_METRIC, |r| self.relaxation_range.normalize(r));
        Metrics::new(attention, relaxation)
    }
}

impl Default for MetricNormalizer {
    fn default() -> Self {
        Self::from(&Tunables::default())
    }
}

impl From<&Tunables> for MetricNormalizer {
    fn from(t: &Tunables) -> Self {
        Self::new(t.attention_range, t.relaxation_range)
    }
}

// ============================================================================
// Classifier Configuration
// ============================================================================

/// Thresholds and debounce settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassifierConfig {
    /// Ratio normalization
    pub normalizer: MetricNormalizer,
    /// Attention score above which the candidate is Engaged
    pub attention_threshold: f64,
    /// Relaxation score above which the candidate is Relaxed
    pub relaxation_threshold: f64,
    /// Disagreeing ticks needed to commit
    pub confidence_required: u32,
    /// Minimum time between transitions
    pub min_dwell: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self::from(&Tunables::default())
    }
}

impl From<&Tunables> for ClassifierConfig {
    fn from(t: &Tunables) -> Self {
        Self {
            normalizer: MetricNormalizer::from(t),
            attention_threshold: t.attention_threshold,
            relaxation_threshold: t.relaxation_threshold,
            confidence_required: t.state_confidence_required,
            min_dwell: t.min_dwell(),
        }
    }
}

impl ClassifierConfig {
    /// Candidate state for a pair of metrics. Attention wins ties.
    #[must_use]
    pub fn candidate(&self, metrics: &Metrics) -> BrainState {
        if metrics.attention > self.attention_threshold {
            BrainState::Engaged
        } else if metrics.relaxation > self.relaxation_threshold {
            BrainState::Relaxed
        } else {
            BrainState::Neutral
        }
    }
}

// ============================================================================
// Classification Result
// ============================================================================

/// Outcome of one classifier tick.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// State after this tick
    pub state: BrainState,
    /// Undebounced candidate for this tick
    pub candidate: BrainState,
    /// Whether this tick committed a transition
    pub changed: bool,
    /// Disagreement counter after this tick
    pub confidence: u32,
    /// Normalized metrics for this tick
    pub metrics: Metrics,
}

// ============================================================================
// State Classifier
// ============================================================================

/// Hysteresis classifier. Starts in [`BrainState::Neutral`].
#[derive(Clone, Debug)]
pub struct StateClassifier {
    config: ClassifierConfig,
    current: BrainState,
    pending: BrainState,
    confidence: u32,
    last_transition: Option<Instant>,
    last_metrics: Metrics,
}

impl StateClassifier {
    /// Create a classifier with the given configuration.
    #[must_use]
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            current: BrainState::Neutral,
            pending: BrainState::Neutral,
            confidence: 0,
            last_transition: None,
            last_metrics: Metrics::NEUTRAL,
        }
    }

    /// Feed one sample and return the debounced state.
    pub fn update(&mut self, sample: &FeatureSample, now: Instant) -> BrainState {
        self.classify(sample, now).state
    }

    /// Feed one sample and return the full tick outcome.
    pub fn classify(&mut self, sample: &FeatureSample, now: Instant) -> Classification {
        let metrics = self.config.normalizer.metrics(sample);
        self.classify_metrics(metrics, now)
    }

    /// Feed precomputed metrics.
    pub fn classify_metrics(&mut self, metrics: Metrics, now: Instant) -> Classification {
        self.last_metrics = metrics;
        let candidate = self.config.candidate(&metrics);
        self.pending = candidate;

        if candidate != self.current {
            self.confidence = self.confidence.saturating_add(1);
        } else {
            self.confidence = self.confidence.saturating_sub(1);
        }

        let dwell_elapsed = self
            .last_transition
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.min_dwell);

        let mut changed = false;
        if self.confidence >= self.config.confidence_required && dwell_elapsed {
            if candidate != self.current {
                tracing::debug!(
                    from = %self.current,
                    to = %candidate,
                    attention = metrics.attention,
                    relaxation = metrics.relaxation,
                    "brain state transition"
                );
                self.current = candidate;
                self.last_transition = Some(now);
                changed = true;
            }
            self.confidence = 0;
        }

        Classification {
            state: self.current,
            candidate,
            changed,
            confidence: self.confidence,
            metrics,
        }
    }

    /// Current debounced state
    #[must_use]
    pub fn state(&self) -> BrainState {
        self.current
    }

    /// Most recent undebounced candidate
    #[must_use]
    pub fn pending(&self) -> BrainState {
        self.pending
    }

    /// Disagreement counter
    #[must_use]
    pub fn confidence(&self) -> u32 {
        self.confidence
    }

    /// Metrics from the latest tick
    #[must_use]
    pub fn last_metrics(&self) -> Metrics {
        self.last_metrics
    }

    /// Time of the last committed transition, if any
    #[must_use]
    pub fn last_transition(&self) -> Option<Instant> {
        self.last_transition
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Replace thresholds without resetting state.
    pub fn set_config(&mut self, config: ClassifierConfig) {
        self.config = config;
    }
}

impl Default for StateClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
