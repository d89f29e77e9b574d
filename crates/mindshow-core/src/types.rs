//! Core data types for MindShow
//!
//! This module defines the fundamental data types used throughout the
//! pipeline:
//!
//! - [`EegBand`]: The fixed set of EEG frequency bands
//! - [`FeatureSample`]: One sensor tick of band powers
//! - [`BrainState`]: Debounced categorical classifier output
//! - [`Metrics`]: Normalized attention/relaxation pair derived from a sample

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// EEG Frequency Bands
// ============================================================================

/// EEG frequency bands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EegBand {
    /// Delta: 0.5-4 Hz (deep sleep)
    Delta,
    /// Theta: 4-8 Hz (drowsiness, memory)
    Theta,
    /// Alpha: 8-13 Hz (relaxed, eyes closed)
    Alpha,
    /// Beta: 13-30 Hz (active thinking)
    Beta,
    /// Gamma: 30-100 Hz (cognitive processing)
    Gamma,
}

impl EegBand {
    /// All bands in ascending frequency order.
    pub const ALL: [Self; 5] = [Self::Delta, Self::Theta, Self::Alpha, Self::Beta, Self::Gamma];

    /// Get the frequency range for this band (low, high) in Hz
    #[inline]
    #[must_use]
    pub const fn range_hz(self) -> (f32, f32) {
        match self {
            Self::Delta => (0.5, 4.0),
            Self::Theta => (4.0, 8.0),
            Self::Alpha => (8.0, 13.0),
            Self::Beta => (13.0, 30.0),
            Self::Gamma => (30.0, 100.0),
        }
    }

    /// Get the lowercase band name as used on feeds and in logs
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Delta => "delta",
            Self::Theta => "theta",
            Self::Alpha => "alpha",
            Self::Beta => "beta",
            Self::Gamma => "gamma",
        }
    }

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EegBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EegBand {
    type Err = UnknownBand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|band| band.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownBand(s.to_string()))
    }
}

/// Band name that is not one of delta/theta/alpha/beta/gamma.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown EEG band: {0}")]
pub struct UnknownBand(pub String);

// ============================================================================
// Feature Sample
// ============================================================================

/// One sensor tick: absolute power per EEG band.
///
/// Samples are immutable once built. Missing bands read as `0.0`, which the
/// metric normalizer treats as sensor dropout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSample {
    powers: [f64; 5],
}

impl FeatureSample {
    /// Create a sample with every band at zero power.
    #[must_use]
    pub const fn new() -> Self {
        Self { powers: [0.0; 5] }
    }

    /// Create a sample from all five band powers.
    #[must_use]
    pub const fn from_powers(delta: f64, theta: f64, alpha: f64, beta: f64, gamma: f64) -> Self {
        Self {
            powers: [delta, theta, alpha, beta, gamma],
        }
    }

    /// Return a copy of this sample with one band replaced.
    #[must_use]
    pub fn with_band(mut self, band: EegBand, power: f64) -> Self {
        self.powers[band.index()] = power;
        self
    }

    /// Power in the given band.
    #[inline]
    #[must_use]
    pub const fn power(&self, band: EegBand) -> f64 {
        self.powers[band.index()]
    }

    /// Iterate over `(band, power)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (EegBand, f64)> + '_ {
        EegBand::ALL.into_iter().map(|band| (band, self.power(band)))
    }

    /// Whether every band holds a finite, non-negative power.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.powers.iter().all(|p| p.is_finite() && *p >= 0.0)
    }
}

// ============================================================================
// Brain State
// ============================================================================

/// Debounced categorical brain state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrainState {
    /// Neither engaged nor relaxed
    #[default]
    Neutral,
    /// High beta/alpha ratio (focused attention)
    Engaged,
    /// High alpha/theta ratio (calm, eyes-closed relaxation)
    Relaxed,
}

impl BrainState {
    /// Lowercase state name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Engaged => "engaged",
            Self::Relaxed => "relaxed",
        }
    }
}

impl fmt::Display for BrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Normalized attention and relaxation scores, each in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Beta/alpha ratio mapped into `[0, 1]`
    pub attention: f64,
    /// Alpha/theta ratio mapped into `[0, 1]`
    pub relaxation: f64,
}

impl Metrics {
    /// Neutral metrics used when nothing better is known.
    pub const NEUTRAL: Self = Self {
        attention: 0.5,
        relaxation: 0.5,
    };

    /// Create metrics, clamping both scores into `[0, 1]`.
    #[must_use]
    pub fn new(attention: f64, relaxation: f64) -> Self {
        Self {
            attention: crate::math::clamp01(attention),
            relaxation: crate::math::clamp01(relaxation),
        }
    }

    /// Overall engagement: mean of attention and relaxation.
    #[inline]
    #[must_use]
    pub fn engagement(&self) -> f64 {
        (self.attention + self.relaxation) / 2.0
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

// ============================================================================
// Tests
// ============================================================================
