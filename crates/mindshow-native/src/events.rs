//! Live event feed.
//!
//! Presentation layers subscribe to [`EventBus`] for a read-only stream of
//! what the pipeline and device links are doing. Slow subscribers lag and
//! skip events; publishers never block.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use mindshow_core::BrainState;

use crate::bridge::ConnectionState;
use crate::dispatch::DispatchReport;
use crate::pipeline::TickReport;

/// Default number of buffered events per subscriber.
pub const EVENT_CAPACITY: usize = 256;

/// Events published by MindShow components.
#[derive(Clone, Debug)]
pub enum MindshowEvent {
    /// A device link changed connection state
    LinkState {
        /// Controller address
        address: SocketAddr,
        /// New state
        state: ConnectionState,
    },

    /// A pattern switch found no matching catalog entry
    PatternMiss {
        /// Controller address
        address: SocketAddr,
        /// Requested name substring
        requested: String,
    },

    /// A subnet discovery pass finished
    DiscoveryFinished {
        /// Hosts probed
        probed: usize,
        /// Hosts that answered the handshake
        responded: usize,
        /// Links added by this pass
        connected: usize,
        /// Wall time of the pass
        elapsed: Duration,
    },

    /// The classifier committed a new brain state
    StateTransition {
        /// Previous state
        from: BrainState,
        /// New state
        to: BrainState,
    },

    /// Metrics and mood for one processed tick
    Tick(TickReport),

    /// Per-link results of one command fan-out
    Dispatch(Arc<DispatchReport>),
}

/// Cloneable publisher handle for [`MindshowEvent`]s.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<MindshowEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MindshowEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: MindshowEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(MindshowEvent::StateTransition {
            from: BrainState::Neutral,
            to: BrainState::Engaged,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let address: SocketAddr = "10.0.0.2:81".parse().unwrap();

        bus.emit(MindshowEvent::LinkState {
            address,
            state: ConnectionState::Connecting,
        });
        bus.emit(MindshowEvent::LinkState {
            address,
            state: ConnectionState::Connected,
        });

        for expected in [ConnectionState::Connecting, ConnectionState::Connected] {
            match rx.recv().await.unwrap() {
                MindshowEvent::LinkState { state, .. } => assert_eq!(state, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
