//! Runtime tunables
//!
//! Every numeric knob of the pipeline lives in [`Tunables`]. Values can be
//! changed while the tick loop runs through [`Tunables::set`], which validates
//! the new value and leaves the old one untouched on rejection.
//!
//! # Example
//!
//! ```rust
//! use mindshow_core::config::Tunables;
//!
//! let mut tunables = Tunables::default();
//! tunables.set("attention_threshold", 0.6).unwrap();
//! assert!(tunables.set("attention_threshold", 1.5).is_err());
//! assert!((tunables.attention_threshold - 0.6).abs() < 1e-12);
//! ```

use core::fmt;
use core::str::FromStr;
use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::math::LinearRange;

/// Default WebSocket control port of the LED controllers.
pub const DEFAULT_DEVICE_PORT: u16 = 81;

// ============================================================================
// Tunables
// ============================================================================

/// Largest accepted bound of a ratio normalization range.
pub const RATIO_BOUND_MAX: f64 = 1000.0;

/// All runtime-adjustable parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    // --- classifier ---
    /// Normalized attention above which the candidate state is Engaged
    pub attention_threshold: f64,
    /// Normalized relaxation above which the candidate state is Relaxed
    pub relaxation_threshold: f64,
    /// Raw beta/alpha ratio range mapped onto `[0, 1]`.
    ///
    /// Both bounds lie in `[0, RATIO_BOUND_MAX]`: a ratio of band powers is
    /// never negative, so a negative minimum is rejected.
    pub attention_range: LinearRange,
    /// Raw alpha/theta ratio range mapped onto `[0, 1]`, bounded like
    /// `attention_range`.
    pub relaxation_range: LinearRange,
    /// Disagreeing ticks needed before a state change commits
    pub state_confidence_required: u32,
    /// Minimum seconds between committed state changes
    pub min_state_duration_s: f64,

    // --- mood ---
    /// EMA blend factor for the color mood, in `(0, 1]`
    pub color_mood_smoothing: f64,
    /// Base intensity of color shifts at zero engagement
    pub color_mood_intensity_scale: f64,
    /// How strongly attention pulls the mood warm
    pub color_mood_attention_weight: f64,
    /// How strongly relaxation pulls the mood cool
    pub color_mood_relaxation_weight: f64,

    // --- devices ---
    /// Control port probed and connected on every host
    pub device_port: u16,
    /// Overall bound on one subnet discovery pass (seconds)
    pub discovery_timeout_s: f64,
    /// Per-host handshake bound during discovery (seconds)
    pub probe_timeout_s: f64,
    /// Bound on connecting and on each awaited reply (seconds)
    pub connection_timeout_s: f64,
    /// Maximum number of controllers connected after discovery
    pub max_controllers: usize,
    /// Connection attempts before a host is given up
    pub connection_retry_attempts: u32,
    /// Base delay of the exponential reconnect backoff (seconds)
    pub connection_retry_backoff_s: f64,
    /// Upper bound on a single backoff delay (seconds)
    pub connection_retry_backoff_cap_s: f64,
    /// Period of the per-link health probe (seconds)
    pub health_check_interval_s: f64,
    /// Failed recoveries before a degraded link is dropped to disconnected
    pub degraded_failure_limit: u32,

    // --- tick loop ---
    /// Tick rate of the pipeline (Hz)
    pub update_rate_hz: f64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            attention_threshold: 0.75,
            relaxation_threshold: 0.65,
            attention_range: LinearRange::new(0.0, 10.0),
            relaxation_range: LinearRange::new(0.0, 5.0),
            state_confidence_required: 3,
            min_state_duration_s: 2.0,

            color_mood_smoothing: 0.3,
            color_mood_intensity_scale: 0.5,
            color_mood_attention_weight: 0.4,
            color_mood_relaxation_weight: 0.4,

            device_port: DEFAULT_DEVICE_PORT,
            discovery_timeout_s: 10.0,
            probe_timeout_s: 1.0,
            connection_timeout_s: 10.0,
            max_controllers: 4,
            connection_retry_attempts: 3,
            connection_retry_backoff_s: 1.0,
            connection_retry_backoff_cap_s: 30.0,
            health_check_interval_s: 30.0,
            degraded_failure_limit: 3,

            update_rate_hz: 10.0,
        }
    }
}

impl Tunables {
    /// Set a tunable by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unknown names and invalid values. The
    /// previous value is retained in that case.
    pub fn set(&mut self, name: &str, value: f64) -> ConfigResult<()> {
        let tunable: Tunable = name.parse()?;
        self.apply(tunable, value)
    }

    /// Apply a `name=value` assignment, as given on the command line.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedAssignment`] if the string is not of
    /// the form `name=value`, otherwise whatever [`Tunables::set`] returns.
    pub fn apply_assignment(&mut self, assignment: &str) -> ConfigResult<Tunable> {
        let (tunable, value) = Self::parse_assignment(assignment)?;
        self.apply(tunable, value)?;
        Ok(tunable)
    }

    /// Split a `name=value` assignment into its key and value.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MalformedAssignment`] for anything not of the form
    /// `name=value`, [`ConfigError::UnknownTunable`] for an unknown name.
    pub fn parse_assignment(assignment: &str) -> ConfigResult<(Tunable, f64)> {
        let (name, value) = assignment
            .split_once('=')
            .ok_or_else(|| ConfigError::MalformedAssignment(assignment.to_string()))?;
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::MalformedAssignment(assignment.to_string()))?;
        let tunable: Tunable = name.trim().parse()?;
        Ok((tunable, value))
    }

    /// Set a tunable identified by its typed key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the value is rejected.
    pub fn apply(&mut self, tunable: Tunable, value: f64) -> ConfigResult<()> {
        let name = tunable.name();
        if !value.is_finite() {
            return Err(ConfigError::NotFinite { name, value });
        }

        match tunable {
            Tunable::AttentionThreshold => {
                self.attention_threshold = in_range(name, value, 0.0, 1.0)?;
            }
            Tunable::RelaxationThreshold => {
                self.relaxation_threshold = in_range(name, value, 0.0, 1.0)?;
            }
            Tunable::AttentionMin => {
                let min = in_range(name, value, 0.0, RATIO_BOUND_MAX)?;
                self.attention_range = ordered("attention_range", min, self.attention_range.max)?;
            }
            Tunable::AttentionMax => {
                let max = in_range(name, value, 0.0, RATIO_BOUND_MAX)?;
                self.attention_range = ordered("attention_range", self.attention_range.min, max)?;
            }
            Tunable::RelaxationMin => {
                let min = in_range(name, value, 0.0, RATIO_BOUND_MAX)?;
                self.relaxation_range =
                    ordered("relaxation_range", min, self.relaxation_range.max)?;
            }
            Tunable::RelaxationMax => {
                let max = in_range(name, value, 0.0, RATIO_BOUND_MAX)?;
                self.relaxation_range =
                    ordered("relaxation_range", self.relaxation_range.min, max)?;
            }
            Tunable::StateConfidenceRequired => {
                self.state_confidence_required = whole(name, value, 1.0, 1000.0)? as u32;
            }
            Tunable::MinStateDuration => {
                self.min_state_duration_s = in_range(name, value, 0.0, 3600.0)?;
            }
            Tunable::ColorMoodSmoothing => {
                self.color_mood_smoothing = in_range(name, value, 0.01, 1.0)?;
            }
            Tunable::ColorMoodIntensityScale => {
                self.color_mood_intensity_scale = in_range(name, value, 0.0, 1.0)?;
            }
            Tunable::ColorMoodAttentionWeight => {
                self.color_mood_attention_weight = in_range(name, value, 0.0, 1.0)?;
            }
            Tunable::ColorMoodRelaxationWeight => {
                self.color_mood_relaxation_weight = in_range(name, value, 0.0, 1.0)?;
            }
            Tunable::DevicePort => {
                self.device_port = whole(name, value, 1.0, 65535.0)? as u16;
            }
            Tunable::DiscoveryTimeout => {
                self.discovery_timeout_s = in_range(name, value, 0.1, 120.0)?;
            }
            Tunable::ProbeTimeout => {
                self.probe_timeout_s = in_range(name, value, 0.05, 30.0)?;
            }
            Tunable::ConnectionTimeout => {
                self.connection_timeout_s = in_range(name, value, 0.1, 120.0)?;
            }
            Tunable::MaxControllers => {
                self.max_controllers = whole(name, value, 1.0, 254.0)? as usize;
            }
            Tunable::ConnectionRetryAttempts => {
                self.connection_retry_attempts = whole(name, value, 1.0, 20.0)? as u32;
            }
            Tunable::ConnectionRetryBackoff => {
                self.connection_retry_backoff_s = in_range(name, value, 0.01, 60.0)?;
            }
            Tunable::ConnectionRetryBackoffCap => {
                self.connection_retry_backoff_cap_s = in_range(name, value, 0.01, 600.0)?;
            }
            Tunable::HealthCheckInterval => {
                self.health_check_interval_s = in_range(name, value, 0.5, 3600.0)?;
            }
            Tunable::DegradedFailureLimit => {
                self.degraded_failure_limit = whole(name, value, 1.0, 100.0)? as u32;
            }
            Tunable::UpdateRate => {
                self.update_rate_hz = in_range(name, value, 0.5, 100.0)?;
            }
        }
        Ok(())
    }

    /// Read a tunable as a float, for status reporting.
    #[must_use]
    pub fn get(&self, tunable: Tunable) -> f64 {
        match tunable {
            Tunable::AttentionThreshold => self.attention_threshold,
            Tunable::RelaxationThreshold => self.relaxation_threshold,
            Tunable::AttentionMin => self.attention_range.min,
            Tunable::AttentionMax => self.attention_range.max,
            Tunable::RelaxationMin => self.relaxation_range.min,
            Tunable::RelaxationMax => self.relaxation_range.max,
            Tunable::StateConfidenceRequired => f64::from(self.state_confidence_required),
            Tunable::MinStateDuration => self.min_state_duration_s,
            Tunable::ColorMoodSmoothing => self.color_mood_smoothing,
            Tunable::ColorMoodIntensityScale => self.color_mood_intensity_scale,
            Tunable::ColorMoodAttentionWeight => self.color_mood_attention_weight,
            Tunable::ColorMoodRelaxationWeight => self.color_mood_relaxation_weight,
            Tunable::DevicePort => f64::from(self.device_port),
            Tunable::DiscoveryTimeout => self.discovery_timeout_s,
            Tunable::ProbeTimeout => self.probe_timeout_s,
            Tunable::ConnectionTimeout => self.connection_timeout_s,
            #[allow(clippy::cast_precision_loss)]
            Tunable::MaxControllers => self.max_controllers as f64,
            Tunable::ConnectionRetryAttempts => f64::from(self.connection_retry_attempts),
            Tunable::ConnectionRetryBackoff => self.connection_retry_backoff_s,
            Tunable::ConnectionRetryBackoffCap => self.connection_retry_backoff_cap_s,
            Tunable::HealthCheckInterval => self.health_check_interval_s,
            Tunable::DegradedFailureLimit => f64::from(self.degraded_failure_limit),
            Tunable::UpdateRate => self.update_rate_hz,
        }
    }

    /// Minimum dwell time between state transitions.
    #[must_use]
    pub fn min_dwell(&self) -> Duration {
        Duration::from_secs_f64(self.min_state_duration_s)
    }

    /// Overall discovery bound.
    #[must_use]
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.discovery_timeout_s)
    }

    /// Per-host probe bound.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.probe_timeout_s)
    }

    /// Connect and reply bound.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout_s)
    }

    /// Health probe period.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.health_check_interval_s)
    }

    /// Base reconnect backoff.
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.connection_retry_backoff_s)
    }

    /// Cap on a single reconnect backoff.
    #[must_use]
    pub fn retry_backoff_cap(&self) -> Duration {
        Duration::from_secs_f64(self.connection_retry_backoff_cap_s)
    }

    /// Tick period derived from the update rate.
    #[must_use]
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.update_rate_hz)
    }
}

fn in_range(name: &'static str, value: f64, min: f64, max: f64) -> ConfigResult<f64> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn whole(name: &'static str, value: f64, min: f64, max: f64) -> ConfigResult<f64> {
    if value.fract() != 0.0 {
        return Err(ConfigError::NotInteger { name, value });
    }
    in_range(name, value, min, max)
}

fn ordered(name: &'static str, min: f64, max: f64) -> ConfigResult<LinearRange> {
    if min >= max {
        return Err(ConfigError::EmptyRange { name, min, max });
    }
    Ok(LinearRange::new(min, max))
}

// ============================================================================
// Tunable Keys
// ============================================================================

/// Typed name of a runtime tunable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tunable {
    /// `attention_threshold`
    AttentionThreshold,
    /// `relaxation_threshold`
    RelaxationThreshold,
    /// `attention_min`
    AttentionMin,
    /// `attention_max`
    AttentionMax,
    /// `relaxation_min`
    RelaxationMin,
    /// `relaxation_max`
    RelaxationMax,
    /// `state_confidence_required`
    StateConfidenceRequired,
    /// `min_state_duration` (seconds)
    MinStateDuration,
    /// `color_mood_smoothing`
    ColorMoodSmoothing,
    /// `color_mood_intensity_scale`
    ColorMoodIntensityScale,
    /// `color_mood_attention_weight`
    ColorMoodAttentionWeight,
    /// `color_mood_relaxation_weight`
    ColorMoodRelaxationWeight,
    /// `device_port`
    DevicePort,
    /// `discovery_timeout` (seconds)
    DiscoveryTimeout,
    /// `probe_timeout` (seconds)
    ProbeTimeout,
    /// `connection_timeout` (seconds)
    ConnectionTimeout,
    /// `max_controllers`
    MaxControllers,
    /// `connection_retry_attempts`
    ConnectionRetryAttempts,
    /// `connection_retry_backoff` (seconds)
    ConnectionRetryBackoff,
    /// `connection_retry_backoff_cap` (seconds)
    ConnectionRetryBackoffCap,
    /// `health_check_interval` (seconds)
    HealthCheckInterval,
    /// `degraded_failure_limit`
    DegradedFailureLimit,
    /// `update_rate` (Hz)
    UpdateRate,
}

impl Tunable {
    /// Every tunable, in display order.
    pub const ALL: [Self; 23] = [
        Self::AttentionThreshold,
        Self::RelaxationThreshold,
        Self::AttentionMin,
        Self::AttentionMax,
        Self::RelaxationMin,
        Self::RelaxationMax,
        Self::StateConfidenceRequired,
        Self::MinStateDuration,
        Self::ColorMoodSmoothing,
        Self::ColorMoodIntensityScale,
        Self::ColorMoodAttentionWeight,
        Self::ColorMoodRelaxationWeight,
        Self::DevicePort,
        Self::DiscoveryTimeout,
        Self::ProbeTimeout,
        Self::ConnectionTimeout,
        Self::MaxControllers,
        Self::ConnectionRetryAttempts,
        Self::ConnectionRetryBackoff,
        Self::ConnectionRetryBackoffCap,
        Self::HealthCheckInterval,
        Self::DegradedFailureLimit,
        Self::UpdateRate,
    ];

    /// snake_case name used on the command line and in logs
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AttentionThreshold => "attention_threshold",
            Self::RelaxationThreshold => "relaxation_threshold",
            Self::AttentionMin => "attention_min",
            Self::AttentionMax => "attention_max",
            Self::RelaxationMin => "relaxation_min",
            Self::RelaxationMax => "relaxation_max",
            Self::StateConfidenceRequired => "state_confidence_required",
            Self::MinStateDuration => "min_state_duration",
            Self::ColorMoodSmoothing => "color_mood_smoothing",
            Self::ColorMoodIntensityScale => "color_mood_intensity_scale",
            Self::ColorMoodAttentionWeight => "color_mood_attention_weight",
            Self::ColorMoodRelaxationWeight => "color_mood_relaxation_weight",
            Self::DevicePort => "device_port",
            Self::DiscoveryTimeout => "discovery_timeout",
            Self::ProbeTimeout => "probe_timeout",
            Self::ConnectionTimeout => "connection_timeout",
            Self::MaxControllers => "max_controllers",
            Self::ConnectionRetryAttempts => "connection_retry_attempts",
            Self::ConnectionRetryBackoff => "connection_retry_backoff",
            Self::ConnectionRetryBackoffCap => "connection_retry_backoff_cap",
            Self::HealthCheckInterval => "health_check_interval",
            Self::DegradedFailureLimit => "degraded_failure_limit",
            Self::UpdateRate => "update_rate",
        }
    }
}

impl fmt::Display for Tunable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tunable {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| ConfigError::UnknownTunable(s.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tunable_rejected() {
        let mut t = Tunables::default();
        let err = t.set("attention_treshold", 0.5).unwrap_err();
        assert_eq!(err, ConfigError::UnknownTunable("attention_treshold".into()));
        assert_eq!(t, Tunables::default());
    }

    #[test]
    fn test_out_of_range_retains_previous() {
        let mut t = Tunables::default();
        t.set("color_mood_smoothing", 0.5).unwrap();
        assert!(t.set("color_mood_smoothing", 1.5).is_err());
        assert!(t.set("color_mood_smoothing", 0.0).is_err());
        assert!((t.color_mood_smoothing - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut t = Tunables::default();
        assert!(matches!(
            t.set("relaxation_threshold", f64::NAN),
            Err(ConfigError::NotFinite { .. })
        ));
    }

    #[test]
    fn test_range_bounds_stay_ordered() {
        let mut t = Tunables::default();
        assert!(matches!(
            t.set("attention_min", 10.0),
            Err(ConfigError::EmptyRange { .. })
        ));
        t.set("attention_max", 4.0).unwrap();
        t.set("attention_min", 1.0).unwrap();
        assert_eq!(t.attention_range, LinearRange::new(1.0, 4.0));
    }

    #[test]
    fn test_ratio_bounds_not_negative() {
        let mut t = Tunables::default();
        assert!(matches!(
            t.set("relaxation_min", -0.5),
            Err(ConfigError::OutOfRange { min, max, .. }) if min == 0.0 && max == RATIO_BOUND_MAX
        ));
        assert!(t.set("attention_max", RATIO_BOUND_MAX + 1.0).is_err());
        t.set("relaxation_min", 0.0).unwrap();
        assert_eq!(t, Tunables::default());
    }

    #[test]
    fn test_counts_must_be_whole() {
        let mut t = Tunables::default();
        assert!(matches!(
            t.set("state_confidence_required", 2.5),
            Err(ConfigError::NotInteger { .. })
        ));
        t.set("state_confidence_required", 5.0).unwrap();
        assert_eq!(t.state_confidence_required, 5);
    }

    #[test]
    fn test_assignment_parsing() {
        let mut t = Tunables::default();
        let key = t.apply_assignment("max_controllers = 8").unwrap();
        assert_eq!(key, Tunable::MaxControllers);
        assert_eq!(t.max_controllers, 8);

        assert!(matches!(
            t.apply_assignment("max_controllers"),
            Err(ConfigError::MalformedAssignment(_))
        ));
        assert!(matches!(
            t.apply_assignment("max_controllers=lots"),
            Err(ConfigError::MalformedAssignment(_))
        ));
    }

    #[test]
    fn test_names_round_trip() {
        for tunable in Tunable::ALL {
            assert_eq!(tunable.name().parse::<Tunable>(), Ok(tunable));
        }
    }

    #[test]
    fn test_tick_period() {
        let t = Tunables::default();
        assert_eq!(t.tick_period(), Duration::from_millis(100));
    }
}
