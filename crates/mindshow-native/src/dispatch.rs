//! Per-tick command fan-out.
//!
//! [`CommandDispatcher`] turns the classifier and mood outputs into one
//! [`Command`] and sends it to every connected link at once. Each link gets
//! the same tick budget; a slow or failing controller shows up in the
//! [`DispatchReport`] and nowhere else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use mindshow_core::{BrainState, Command};

use crate::bridge::{DeviceLink, DeviceRegistry, LinkError, PatternSwitch};
use crate::config::ConfigHandle;
use crate::events::{EventBus, MindshowEvent};

// ============================================================================
// Error Types
// ============================================================================

/// Errors from manual overrides.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// Override value outside `[0, 1]`
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfRange {
        /// Which value
        name: &'static str,
        /// Rejected value
        value: f64,
    },
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

// ============================================================================
// Reports
// ============================================================================

/// What happened on one link during a fan-out.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkOutcome {
    /// Variables sent; carries the pattern switch result
    Applied(PatternSwitch),
    /// The link rejected or failed the command
    Failed(LinkError),
    /// No answer within the tick budget
    TimedOut,
}

impl LinkOutcome {
    /// Whether the command reached the controller
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// One link's line in a [`DispatchReport`].
#[derive(Clone, Debug, PartialEq)]
pub struct LinkReport {
    /// Controller address
    pub address: SocketAddr,
    /// Outcome
    pub outcome: LinkOutcome,
}

/// Result of one fan-out.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchReport {
    /// The command that was sent
    pub command: Arc<Command>,
    /// Per-link outcomes, ordered by address
    pub links: Vec<LinkReport>,
    /// Wall time of the fan-out
    pub elapsed: Duration,
}

impl DispatchReport {
    /// Links that applied the command
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.links.iter().filter(|l| l.outcome.is_applied()).count()
    }

    /// Links that failed or timed out
    #[must_use]
    pub fn failed(&self) -> usize {
        self.links.len() - self.delivered()
    }

    /// True when no link was connected ("no LED output" mode).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Outcome for one address
    #[must_use]
    pub fn outcome(&self, address: SocketAddr) -> Option<&LinkOutcome> {
        self.links
            .iter()
            .find(|l| l.address == address)
            .map(|l| &l.outcome)
    }
}

/// Short form of a [`DispatchReport`] for logs and status output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Links that applied the command
    pub delivered: usize,
    /// Links that failed or timed out
    pub failed: usize,
}

impl From<&DispatchReport> for DispatchSummary {
    fn from(report: &DispatchReport) -> Self {
        Self {
            delivered: report.delivered(),
            failed: report.failed(),
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Builds tick commands and fans them out across the registry.
#[derive(Clone, Debug)]
pub struct CommandDispatcher {
    registry: DeviceRegistry,
    config: ConfigHandle,
    events: EventBus,
}

impl CommandDispatcher {
    /// Create a dispatcher over `registry`.
    #[must_use]
    pub fn new(registry: DeviceRegistry, config: ConfigHandle, events: EventBus) -> Self {
        Self {
            registry,
            config,
            events,
        }
    }

    /// The registry this dispatcher sends to
    #[must_use]
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Build the tick command and send it to every connected link.
    ///
    /// The pattern switch is included only when `state_changed`.
    pub async fn dispatch(
        &self,
        state: BrainState,
        mood: f64,
        state_changed: bool,
    ) -> Arc<DispatchReport> {
        self.send(Command::for_tick(state, mood, state_changed)).await
    }

    /// Override the mood and intensity on every link. No pattern switch.
    ///
    /// # Errors
    ///
    /// [`DispatchError::OutOfRange`] if either value is outside `[0, 1]`.
    pub async fn send_manual_mood(
        &self,
        mood: f64,
        intensity: f64,
    ) -> DispatchResult<Arc<DispatchReport>> {
        unit_interval("mood", mood)?;
        unit_interval("intensity", intensity)?;
        Ok(self.send(Command::manual_mood(mood, intensity)).await)
    }

    /// Override only the intensity on every link.
    ///
    /// # Errors
    ///
    /// [`DispatchError::OutOfRange`] if `intensity` is outside `[0, 1]`.
    pub async fn send_intensity_only(&self, intensity: f64) -> DispatchResult<Arc<DispatchReport>> {
        unit_interval("intensity", intensity)?;
        Ok(self.send(Command::intensity_only(intensity)).await)
    }

    /// Send a prepared command to every connected link concurrently.
    pub async fn send(&self, command: Command) -> Arc<DispatchReport> {
        let budget = self.config.current().tick_period();
        let command = Arc::new(command);
        let started = Instant::now();

        let links = self.registry.connected_links();
        let sends = links
            .iter()
            .map(|link| apply_within(link, Arc::clone(&command), budget));
        let links = join_all(sends).await;

        let report = Arc::new(DispatchReport {
            command,
            links,
            elapsed: started.elapsed(),
        });
        if report.failed() > 0 {
            warn!(
                delivered = report.delivered(),
                failed = report.failed(),
                "command not delivered everywhere"
            );
        } else {
            debug!(delivered = report.delivered(), elapsed = ?report.elapsed, "command sent");
        }
        self.events.emit(MindshowEvent::Dispatch(Arc::clone(&report)));
        report
    }
}

async fn apply_within(link: &DeviceLink, command: Arc<Command>, budget: Duration) -> LinkReport {
    let address = link.address();
    let outcome = match tokio::time::timeout(budget, link.apply(command)).await {
        Ok(Ok(switch)) => LinkOutcome::Applied(switch),
        Ok(Err(e)) => {
            debug!(address = %address, error = %e, "send failed");
            LinkOutcome::Failed(e)
        }
        Err(_) => {
            debug!(address = %address, ?budget, "send timed out");
            LinkOutcome::TimedOut
        }
    };
    LinkReport { address, outcome }
}

fn unit_interval(name: &'static str, value: f64) -> DispatchResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(DispatchError::OutOfRange { name, value })
    }
}

// ============================================================================
// Tests
// ============================================================================
