//! Numeric helpers for the classification and mood paths
//!
//! - [`LinearRange`]: clamp-normalize a raw ratio into `[0, 1]`
//! - [`band_ratio`]: guarded band-power ratio with dropout detection
//! - [`s_curve`]: symmetric quadratic ease around 0.5
//! - [`ExponentialSmoother`]: first-order EMA

use serde::{Deserialize, Serialize};

/// Clamp a value into `[0, 1]`. NaN maps to 0.
#[inline]
#[must_use]
pub fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Round to a fixed number of decimal places.
#[inline]
#[must_use]
pub fn round_to(x: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (x * scale).round() / scale
}

// ============================================================================
// Linear Normalization
// ============================================================================

/// Linear `[min, max]` range used to map a raw ratio into `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearRange {
    /// Raw value that maps to 0
    pub min: f64,
    /// Raw value that maps to 1
    pub max: f64,
}

impl LinearRange {
    /// Create a new range. Callers guarantee `min < max`.
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Map `x` into `[0, 1]`, clamping outside the range.
    #[must_use]
    pub fn normalize(&self, x: f64) -> f64 {
        let span = self.max - self.min;
        if span <= 0.0 || !span.is_finite() {
            return 0.5;
        }
        clamp01((x - self.min) / span)
    }
}

// ============================================================================
// Band Ratios
// ============================================================================

/// Compute `numerator / (denominator + epsilon)`.
///
/// Returns `None` when either input is non-finite, or when either band
/// carries no power at all. Those cases are sensor dropout and
/// the caller substitutes a neutral score.
#[inline]
#[must_use]
pub fn band_ratio(numerator: f64, denominator: f64, epsilon: f64) -> Option<f64> {
    if !numerator.is_finite() || !denominator.is_finite() {
        return None;
    }
    if numerator <= 0.0 || denominator <= 0.0 {
        return None;
    }
    let ratio = numerator / (denominator + epsilon);
    ratio.is_finite().then_some(ratio)
}

// ============================================================================
// Easing
// ============================================================================

/// Symmetric quadratic S-curve around 0.5.
///
/// ```text
/// x < 0.5:  0.5 * (2x)^2
/// x >= 0.5: 1 - 0.5 * (2(1-x))^2
/// ```
///
/// Input is clamped to `[0, 1]` first; the curve is monotonic and fixes
/// 0, 0.5 and 1.
#[inline]
#[must_use]
pub fn s_curve(x: f64) -> f64 {
    let x = clamp01(x);
    if x < 0.5 {
        let t = 2.0 * x;
        0.5 * t * t
    } else {
        let t = 2.0 * (1.0 - x);
        1.0 - 0.5 * t * t
    }
}

// ============================================================================
// Exponential Moving Average
// ============================================================================

/// First-order exponential moving average.
///
/// `value = alpha * input + (1 - alpha) * value`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExponentialSmoother {
    alpha: f64,
    value: f64,
}

impl ExponentialSmoother {
    /// Create a smoother starting at `initial`. `alpha` is clamped to `(0, 1]`.
    #[must_use]
    pub fn new(alpha: f64, initial: f64) -> Self {
        Self {
            alpha: Self::sanitize_alpha(alpha),
            value: initial,
        }
    }

    fn sanitize_alpha(alpha: f64) -> f64 {
        if alpha.is_finite() && alpha > 0.0 {
            alpha.min(1.0)
        } else {
            1.0
        }
    }

    /// Blend a new input into the running value and return it.
    #[inline]
    pub fn update(&mut self, input: f64) -> f64 {
        self.value = self.alpha * input + (1.0 - self.alpha) * self.value;
        self.value
    }

    /// Current smoothed value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Current blend factor.
    #[inline]
    #[must_use]
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Change the blend factor without disturbing the running value.
    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = Self::sanitize_alpha(alpha);
    }

    /// Reset the running value.
    pub fn reset(&mut self, value: f64) {
        self.value = value;
    }
}

// ============================================================================
// Tests
// ============================================================================
