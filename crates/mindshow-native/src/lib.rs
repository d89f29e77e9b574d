//! MindShow Native - controller networking and the tick loop
//!
//! This crate runs the host side of MindShow on tokio:
//! - WebSocket links to LED controllers with reconnect and health checks
//! - Subnet discovery and the controller registry
//! - Concurrent per-tick command fan-out
//! - Feature sources (simulated, OSC)
//!
//! # Modules
//!
//! - [`bridge`]: Controller transports, links and registry
//! - [`dispatch`]: Command fan-out
//! - [`pipeline`]: Fixed-rate tick loop
//! - [`source`]: Band-power sample sources
//! - [`events`]: Live event feed
//! - [`config`]: Shared runtime tunables

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod pipeline;
pub mod source;

// Re-export key types
pub use bridge::{
    ConnectionState, DeviceLink, DeviceRegistry, LinkError, RegistryError, RegistryStatus,
    WebSocketConnector,
};
pub use config::ConfigHandle;
pub use dispatch::{CommandDispatcher, DispatchError, DispatchReport, LinkOutcome};
pub use events::{EventBus, MindshowEvent};
pub use pipeline::{Pipeline, PipelineStats, TickReport};
pub use source::{FeatureSource, SimulatedSource, SourceError};

#[cfg(feature = "osc")]
pub use source::OscFeatureSource;
