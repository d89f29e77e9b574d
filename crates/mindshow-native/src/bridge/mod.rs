//! Controller connections.
//!
//! - [`transport`]: text-frame transport trait and its WebSocket implementation
//! - [`framing`]: splits inbound frames into control and pattern list streams
//! - [`link`]: per-controller connection task and its state machine
//! - [`registry`]: owner of all links, subnet discovery
//!
//! # Multi-Device Support
//!
//! [`DeviceRegistry`] holds any number of [`DeviceLink`]s. Each link runs on
//! its own task and is the only writer to its transport; everything else
//! talks to it through a cloneable handle.
//!
//! ```rust,ignore
//! use mindshow_native::bridge::{DeviceRegistry, WebSocketConnector};
//!
//! let registry = DeviceRegistry::new(Arc::new(WebSocketConnector), config, events);
//! registry.discover(Duration::from_secs(10)).await?;
//!
//! for link in registry.connected_links() {
//!     link.switch_pattern("rainbow").await?;
//! }
//! ```

pub mod framing;
pub mod link;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

// Re-export key types
pub use link::{
    ConnectionState, DeviceLink, LinkConfig, LinkError, LinkResult, LinkSnapshot, PatternSwitch,
};
pub use registry::{DeviceRegistry, DeviceSummary, RegistryError, RegistryResult, RegistryStatus};
pub use transport::{
    Connector, Transport, TransportError, TransportResult, WebSocketConnector, WebSocketTransport,
};
