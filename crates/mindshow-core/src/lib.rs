//! MindShow Core - brain-state classification and LED controller protocol
//!
//! This crate holds the synchronous half of the MindShow pipeline: everything
//! that runs once per tick without touching the network.
//!
//! # Modules
//!
//! - [`types`]: EEG bands, feature samples, brain states, metrics
//! - [`math`]: Ratio normalization, S-curve easing, exponential smoothing
//! - [`classifier`]: Debounced [`StateClassifier`]
//! - [`mood`]: Smoothed color mood via [`MoodMapper`]
//! - [`command`]: Per-tick [`Command`] construction
//! - [`protocol`]: Controller wire messages and pattern catalogs
//! - [`config`]: Runtime [`Tunables`]
//! - [`error`]: Error types for configuration and protocol decoding
//!
//! # Example
//!
//! ```rust
//! use std::time::Instant;
//! use mindshow_core::{BrainState, Command, FeatureSample, MoodMapper, StateClassifier};
//!
//! let mut classifier = StateClassifier::default();
//! let mut mapper = MoodMapper::default();
//!
//! let sample = FeatureSample::from_powers(1.0, 1.0, 1.0, 9.0, 0.5);
//! let result = classifier.classify(&sample, Instant::now());
//! let mood = mapper.update(&sample);
//!
//! let command = Command::for_tick(result.state, mood, result.changed);
//! assert_eq!(result.state, BrainState::Neutral);
//! assert!(command.target_pattern.is_none());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

pub mod classifier;
pub mod command;
pub mod config;
pub mod error;
pub mod math;
pub mod mood;
pub mod protocol;
pub mod types;

// Re-export commonly used types at crate root
pub use classifier::{Classification, ClassifierConfig, MetricNormalizer, StateClassifier};
pub use command::{Command, StateProfile};
pub use config::{Tunable, Tunables};
pub use error::{ConfigError, ProtocolError};
pub use mood::{MoodConfig, MoodMapper, MoodReading};
pub use protocol::{ControlMessage, InboundFrame, PatternCatalog, PatternEntry, Request};
pub use types::{BrainState, EegBand, FeatureSample, Metrics};
