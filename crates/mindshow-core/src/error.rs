//! Error types for MindShow core
//!
//! Only two failure classes surface from the synchronous core:
//!
//! - [`ConfigError`]: a rejected runtime tunable update
//! - [`ProtocolError`]: a device frame that could not be decoded
//!
//! Sensor anomalies never produce errors; the classifier and mood mapper
//! absorb them with neutral fallbacks.

use thiserror::Error;

// ============================================================================
// Configuration Errors
// ============================================================================

/// Errors from updating a runtime tunable.
///
/// A rejected update leaves the previous value in place.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Tunable name is not recognized
    #[error("unknown tunable: {0}")]
    UnknownTunable(String),

    /// Value is NaN or infinite
    #[error("{name} must be finite, got {value}")]
    NotFinite {
        /// Tunable name
        name: &'static str,
        /// Rejected value
        value: f64,
    },

    /// Value lies outside the accepted range
    #[error("{name} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        /// Tunable name
        name: &'static str,
        /// Rejected value
        value: f64,
        /// Lowest accepted value
        min: f64,
        /// Highest accepted value
        max: f64,
    },

    /// Count-valued tunable was given a fractional value
    #[error("{name} must be a whole number, got {value}")]
    NotInteger {
        /// Tunable name
        name: &'static str,
        /// Rejected value
        value: f64,
    },

    /// Normalization range would become empty or inverted
    #[error("{name}: minimum {min} must be below maximum {max}")]
    EmptyRange {
        /// Range name
        name: &'static str,
        /// Resulting minimum
        min: f64,
        /// Resulting maximum
        max: f64,
    },

    /// Assignment string is not `name=value`
    #[error("malformed assignment '{0}', expected name=value")]
    MalformedAssignment(String),
}

/// Result type for configuration updates.
pub type ConfigResult<T> = Result<T, ConfigError>;

// ============================================================================
// Protocol Errors
// ============================================================================

/// Errors decoding frames received from an LED controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame looked like JSON but did not parse
    #[error("invalid JSON frame: {0}")]
    InvalidJson(String),

    /// JSON frame was not an object
    #[error("expected a JSON object, got: {0}")]
    NotAnObject(String),

    /// A recognized document had a field of the wrong shape
    #[error("malformed '{field}' field: {detail}")]
    MalformedField {
        /// Offending field
        field: &'static str,
        /// What was wrong with it
        detail: String,
    },

    /// Pattern list ended without any usable record
    #[error("pattern list contained no id/name records")]
    EmptyCatalog,

    /// Pattern list kept growing without an end-of-list marker
    #[error("pattern list exceeded {0} bytes without terminating")]
    CatalogTooLarge(usize),
}

/// Result type for protocol decoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
