//! Per-controller connection state machine.
//!
//! Each [`DeviceLink`] is a cheap handle to a task that exclusively owns the
//! controller's transport, connection state, pattern catalog and variable
//! cache. Handles talk to the task over an mpsc command channel with a
//! oneshot reply per command, and read a snapshot the task republishes after
//! every change.
//!
//! ```text
//! Disconnected --connect--> Connecting --ack--> Connected
//!      ^                        |                   |
//!      |<------- retries -------+        send/recv error
//!      |                                            v
//!      +------ failure limit reached ---------- Degraded --probe ok--> Connected
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use mindshow_core::config::Tunables;
use mindshow_core::error::ProtocolError;
use mindshow_core::protocol::{PatternCatalog, PatternEntry, Request};
use mindshow_core::Command;

use super::framing::FramedTransport;
use super::transport::{Connector, TransportError};
use crate::events::{EventBus, MindshowEvent};

/// Commands queued per link before dispatch reports it busy.
const LINK_QUEUE_DEPTH: usize = 32;

// ============================================================================
// Error Types
// ============================================================================

/// Errors from a device link.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Undecodable reply
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A reply did not arrive in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Request or phase that timed out
        operation: &'static str,
        /// Bound that was exceeded
        after: Duration,
    },

    /// Operation needs a connected link
    #[error("Link is {0}")]
    NotConnected(ConnectionState),

    /// Every connection attempt failed
    #[error("Connecting to {address} failed after {attempts} attempts: {last}")]
    ConnectFailed {
        /// Controller address
        address: SocketAddr,
        /// Attempts made
        attempts: u32,
        /// Last failure
        last: String,
    },

    /// Command queue is full
    #[error("Link is busy")]
    Busy,

    /// Link task has stopped
    #[error("Link task has stopped")]
    Closed,

    /// Pattern id not in the catalog
    #[error("Unknown pattern id: {0}")]
    UnknownPattern(String),
}

impl LinkError {
    /// Whether this error means the connection itself is unusable.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

// ============================================================================
// Link State
// ============================================================================

/// Connection state of one controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport
    #[default]
    Disconnected,
    /// Opening a transport and handshaking
    Connecting,
    /// Ready for commands
    Connected,
    /// Last send or probe failed; recovery in progress
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        })
    }
}

/// Read-only view of a link, republished by its task after every change.
#[derive(Clone, Debug)]
pub struct LinkSnapshot {
    /// Controller address
    pub address: SocketAddr,
    /// Connection state
    pub state: ConnectionState,
    /// Pattern catalog from the last successful listing
    pub catalog: PatternCatalog,
    /// Last pattern id activated through this link
    pub active_pattern_id: Option<String>,
    /// Variables to restore after a reconnect
    pub last_known_variables: BTreeMap<String, f64>,
    /// Frame rate from the last status report
    pub last_fps: Option<f64>,
    /// Failed recoveries since the link was last healthy
    pub failures: u32,
    /// When the current session was established
    pub connected_at: Option<Instant>,
}

impl LinkSnapshot {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            state: ConnectionState::Disconnected,
            catalog: PatternCatalog::new(),
            active_pattern_id: None,
            last_known_variables: BTreeMap::new(),
            last_fps: None,
            failures: 0,
            connected_at: None,
        }
    }

    /// Whether commands can be sent.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// What happened to the pattern part of an applied command.
#[derive(Clone, Debug, PartialEq)]
pub enum PatternSwitch {
    /// Command carried no pattern
    NotRequested,
    /// Pattern activated
    Switched(PatternEntry),
    /// No catalog entry matched; variables were still sent
    Missing(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Timing and retry settings for a link.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinkConfig {
    /// Bound on connecting and on each awaited reply
    pub connection_timeout: Duration,
    /// Attempts per connect cycle
    pub retry_attempts: u32,
    /// Backoff base
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_cap: Duration,
    /// Period of the liveness probe while connected
    pub health_check_interval: Duration,
    /// Failed recoveries before a degraded link drops to disconnected
    pub degraded_failure_limit: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::from(&Tunables::default())
    }
}

impl From<&Tunables> for LinkConfig {
    fn from(t: &Tunables) -> Self {
        Self {
            connection_timeout: t.connection_timeout(),
            retry_attempts: t.connection_retry_attempts,
            backoff_base: t.retry_backoff(),
            backoff_cap: t.retry_backoff_cap(),
            health_check_interval: t.health_check_interval(),
            degraded_failure_limit: t.degraded_failure_limit,
        }
    }
}

impl LinkConfig {
    /// Delay after failed attempt `attempt` (0-based): `base * 2^attempt`,
    /// capped.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(1u32 << attempt.min(20))
            .min(self.backoff_cap)
    }
}

// ============================================================================
// Link Handle
// ============================================================================

enum LinkCommand {
    Apply {
        command: Arc<Command>,
        reply: oneshot::Sender<LinkResult<PatternSwitch>>,
    },
    SwitchPattern {
        needle: String,
        reply: oneshot::Sender<LinkResult<Option<PatternEntry>>>,
    },
    ActivatePattern {
        id: String,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    SetVariables {
        variables: BTreeMap<String, f64>,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Restore {
        reply: oneshot::Sender<LinkResult<bool>>,
    },
    RefreshCatalog {
        reply: oneshot::Sender<LinkResult<PatternCatalog>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one controller's connection task.
#[derive(Clone, Debug)]
pub struct DeviceLink {
    address: SocketAddr,
    commands: mpsc::Sender<LinkCommand>,
    snapshot: Arc<RwLock<LinkSnapshot>>,
}

impl fmt::Debug for LinkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Apply { .. } => "Apply",
            Self::SwitchPattern { .. } => "SwitchPattern",
            Self::ActivatePattern { .. } => "ActivatePattern",
            Self::SetVariables { .. } => "SetVariables",
            Self::Restore { .. } => "Restore",
            Self::RefreshCatalog { .. } => "RefreshCatalog",
            Self::Shutdown { .. } => "Shutdown",
        })
    }
}

impl DeviceLink {
    /// Connect to a controller and start its task.
    ///
    /// Runs one connect cycle (handshake, catalog load, variable read) with
    /// exponential backoff between attempts.
    ///
    /// # Errors
    ///
    /// [`LinkError::ConnectFailed`] once every attempt failed,
    /// [`LinkError::Closed`] if `shutdown` fires first.
    pub async fn establish(
        address: SocketAddr,
        connector: Arc<dyn Connector>,
        config: LinkConfig,
        events: EventBus,
        mut shutdown: watch::Receiver<bool>,
    ) -> LinkResult<Self> {
        let snapshot = Arc::new(RwLock::new(LinkSnapshot::new(address)));
        let mut actor = LinkActor {
            address,
            connector,
            config,
            transport: None,
            state: ConnectionState::Disconnected,
            catalog: PatternCatalog::new(),
            active_pattern_id: None,
            variables: BTreeMap::new(),
            last_fps: None,
            failures: 0,
            connected_at: None,
            ever_connected: false,
            next_recovery: None,
            snapshot: Arc::clone(&snapshot),
            events,
        };

        tokio::select! {
            result = actor.connect_with_retry() => result?,
            () = shutdown_signalled(&mut shutdown) => return Err(LinkError::Closed),
        }

        let (commands, rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        tokio::spawn(actor.run(rx, shutdown));

        Ok(Self {
            address,
            commands,
            snapshot,
        })
    }

    /// Controller address
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> LinkSnapshot {
        match self.snapshot.read() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.snapshot().state
    }

    /// Whether the link is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Cached pattern catalog
    #[must_use]
    pub fn patterns(&self) -> PatternCatalog {
        self.snapshot().catalog
    }

    /// Apply a tick command: optional pattern switch, then variables.
    ///
    /// Never waits for queue space; a link with a backlog reports
    /// [`LinkError::Busy`] so one slow controller cannot hold up a tick.
    pub async fn apply(&self, command: Arc<Command>) -> LinkResult<PatternSwitch> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .try_send(LinkCommand::Apply { command, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => LinkError::Busy,
                mpsc::error::TrySendError::Closed(_) => LinkError::Closed,
            })?;
        rx.await.map_err(|_| LinkError::Closed)?
    }

    /// Activate the first pattern whose name contains `needle`, ignoring
    /// case. `Ok(None)` if nothing matched.
    pub async fn switch_pattern(&self, needle: &str) -> LinkResult<Option<PatternEntry>> {
        let needle = needle.to_string();
        self.request(|reply| LinkCommand::SwitchPattern { needle, reply })
            .await
    }

    /// Activate a pattern by exact catalog id.
    pub async fn activate_pattern(&self, id: &str) -> LinkResult<()> {
        let id = id.to_string();
        self.request(|reply| LinkCommand::ActivatePattern { id, reply })
            .await
    }

    /// Send variables and merge them into the restore cache.
    pub async fn set_variables(&self, variables: BTreeMap<String, f64>) -> LinkResult<()> {
        self.request(|reply| LinkCommand::SetVariables { variables, reply })
            .await
    }

    /// Re-send every cached variable. `Ok(false)` if nothing is cached.
    pub async fn restore_last_known_state(&self) -> LinkResult<bool> {
        self.request(|reply| LinkCommand::Restore { reply }).await
    }

    /// Reload the pattern catalog from the controller.
    pub async fn refresh_catalog(&self) -> LinkResult<PatternCatalog> {
        self.request(|reply| LinkCommand::RefreshCatalog { reply })
            .await
    }

    /// Close the transport and stop the task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(LinkCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<LinkResult<T>>) -> LinkCommand,
    ) -> LinkResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| LinkError::Closed)?;
        rx.await.map_err(|_| LinkError::Closed)?
    }
}

/// Resolves once `true` is published. Never resolves if the sender is gone.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Link Task
// ============================================================================

struct LinkActor {
    address: SocketAddr,
    connector: Arc<dyn Connector>,
    config: LinkConfig,
    transport: Option<FramedTransport>,
    state: ConnectionState,
    catalog: PatternCatalog,
    active_pattern_id: Option<String>,
    variables: BTreeMap<String, f64>,
    last_fps: Option<f64>,
    failures: u32,
    connected_at: Option<Instant>,
    ever_connected: bool,
    next_recovery: Option<Instant>,
    snapshot: Arc<RwLock<LinkSnapshot>>,
    events: EventBus,
}

impl LinkActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<LinkCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = self.config.health_check_interval;
        let mut health = tokio::time::interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown_signalled(&mut shutdown) => break,
                command = commands.recv() => match command {
                    Some(LinkCommand::Shutdown { reply }) => {
                        self.close().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = health.tick() => self.health_check().await,
                () = sleep_until_opt(self.next_recovery) => {
                    tokio::select! {
                        () = self.recover() => {}
                        () = shutdown_signalled(&mut shutdown) => break,
                    }
                }
                result = next_inbound(&mut self.transport) => self.on_inbound(result),
            }
        }

        self.close().await;
    }

    async fn handle(&mut self, command: LinkCommand) {
        debug!(address = %self.address, ?command, "link command");
        match command {
            LinkCommand::Apply { command, reply } => {
                // Dispatcher already gave up on this tick
                if reply.is_closed() {
                    return;
                }
                let _ = reply.send(self.apply(&command).await);
            }
            LinkCommand::SwitchPattern { needle, reply } => {
                let _ = reply.send(self.switch_pattern(&needle).await);
            }
            LinkCommand::ActivatePattern { id, reply } => {
                let _ = reply.send(self.activate_pattern(&id).await);
            }
            LinkCommand::SetVariables { variables, reply } => {
                let _ = reply.send(self.set_variables(variables).await);
            }
            LinkCommand::Restore { reply } => {
                let _ = reply.send(self.restore().await);
            }
            LinkCommand::RefreshCatalog { reply } => {
                let _ = reply.send(self.refresh_catalog().await);
            }
            LinkCommand::Shutdown { reply } => {
                self.close().await;
                let _ = reply.send(());
            }
        }
        self.publish();
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    async fn apply(&mut self, command: &Command) -> LinkResult<PatternSwitch> {
        let pattern = match &command.target_pattern {
            Some(name) => match self.switch_pattern(name).await? {
                Some(entry) => PatternSwitch::Switched(entry),
                None => PatternSwitch::Missing(name.clone()),
            },
            None => PatternSwitch::NotRequested,
        };
        self.set_variables(command.variables.clone()).await?;
        Ok(pattern)
    }

    async fn switch_pattern(&mut self, needle: &str) -> LinkResult<Option<PatternEntry>> {
        let Some(entry) = self.catalog.find_by_substring(needle).cloned() else {
            warn!(address = %self.address, pattern = needle, "no matching pattern, skipping switch");
            self.events.emit(MindshowEvent::PatternMiss {
                address: self.address,
                requested: needle.to_string(),
            });
            return Ok(None);
        };

        self.send(&Request::ActivateProgram {
            id: entry.id.clone(),
        })
        .await?;
        info!(address = %self.address, id = %entry.id, name = %entry.name, "pattern switched");
        self.active_pattern_id = Some(entry.id.clone());
        Ok(Some(entry))
    }

    async fn activate_pattern(&mut self, id: &str) -> LinkResult<()> {
        if !self.catalog.contains_id(id) {
            return Err(LinkError::UnknownPattern(id.to_string()));
        }
        self.send(&Request::ActivateProgram { id: id.to_string() })
            .await?;
        self.active_pattern_id = Some(id.to_string());
        Ok(())
    }

    async fn set_variables(&mut self, variables: BTreeMap<String, f64>) -> LinkResult<()> {
        self.send(&Request::SetVars(variables.clone())).await?;
        self.variables.extend(variables);
        Ok(())
    }

    async fn restore(&mut self) -> LinkResult<bool> {
        if self.variables.is_empty() {
            warn!(address = %self.address, "no last known state to restore");
            return Ok(false);
        }
        info!(address = %self.address, count = self.variables.len(), "restoring last known state");
        self.send(&Request::SetVars(self.variables.clone())).await?;
        Ok(true)
    }

    async fn refresh_catalog(&mut self) -> LinkResult<PatternCatalog> {
        let timeout = self.config.connection_timeout;
        let result = match self.connected_transport() {
            Ok(transport) => transport.fetch_catalog(timeout).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(catalog) => {
                self.catalog = catalog.clone();
                Ok(catalog)
            }
            Err(e) => {
                self.on_failure(&e);
                Err(e)
            }
        }
    }

    async fn send(&mut self, request: &Request) -> LinkResult<()> {
        let after = self.config.connection_timeout;
        let result = match self.connected_transport() {
            Ok(transport) => tokio::time::timeout(after, transport.send(request))
                .await
                .unwrap_or(Err(LinkError::Timeout {
                    operation: request.kind(),
                    after,
                })),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.on_failure(e);
        }
        result
    }

    fn connected_transport(&mut self) -> LinkResult<&mut FramedTransport> {
        if self.state != ConnectionState::Connected {
            return Err(LinkError::NotConnected(self.state));
        }
        self.transport
            .as_mut()
            .ok_or(LinkError::NotConnected(self.state))
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn connect_with_retry(&mut self) -> LinkResult<()> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.backoff_delay(attempt - 1);
                debug!(address = %self.address, ?delay, "waiting before retry");
                tokio::time::sleep(delay).await;
            }

            self.set_state(ConnectionState::Connecting);
            info!(address = %self.address, attempt = attempt + 1, attempts, "connecting");

            match self.open_session().await {
                Ok(()) => {
                    self.failures = 0;
                    self.next_recovery = None;
                    self.set_state(ConnectionState::Connected);
                    info!(
                        address = %self.address,
                        patterns = self.catalog.len(),
                        "controller connected"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(address = %self.address, attempt = attempt + 1, error = %e, "connection attempt failed");
                    last = e.to_string();
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        Err(LinkError::ConnectFailed {
            address: self.address,
            attempts,
            last,
        })
    }

    /// Open a fresh transport, handshake, load catalog and variables, and
    /// restore cached variables on a reconnect.
    async fn open_session(&mut self) -> LinkResult<()> {
        if let Some(mut old) = self.transport.take() {
            old.close().await;
        }

        let timeout = self.config.connection_timeout;
        let inner = tokio::time::timeout(timeout, self.connector.connect(self.address))
            .await
            .map_err(|_| LinkError::Timeout {
                operation: "connect",
                after: timeout,
            })??;
        let mut framed = FramedTransport::new(inner);
        framed.handshake(timeout).await?;

        match framed.fetch_catalog(timeout).await {
            Ok(catalog) => self.catalog = catalog,
            Err(e @ LinkError::Transport(_)) => return Err(e),
            Err(e) => {
                warn!(address = %self.address, error = %e, "pattern list unavailable, keeping previous catalog");
            }
        }

        match framed.fetch_vars(timeout).await {
            Ok(vars) => {
                for (name, value) in vars {
                    self.variables.entry(name).or_insert(value);
                }
            }
            Err(e @ LinkError::Transport(_)) => return Err(e),
            Err(e) => warn!(address = %self.address, error = %e, "variables unavailable"),
        }

        if self.ever_connected && !self.variables.is_empty() {
            info!(address = %self.address, count = self.variables.len(), "restoring last known state");
            let restore = Request::SetVars(self.variables.clone());
            tokio::time::timeout(timeout, framed.send(&restore))
                .await
                .map_err(|_| LinkError::Timeout {
                    operation: restore.kind(),
                    after: timeout,
                })??;
        }

        if let Some(fps) = framed.last_fps() {
            self.last_fps = Some(fps);
        }
        framed.discard_pending();
        self.transport = Some(framed);
        self.ever_connected = true;
        self.connected_at = Some(Instant::now());
        Ok(())
    }

    async fn health_check(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let timeout = self.config.connection_timeout;
        let result = match self.transport.as_mut() {
            Some(transport) => transport.handshake(timeout).await,
            None => Err(LinkError::NotConnected(self.state)),
        };
        match result {
            Ok(()) => {
                if let Some(fps) = self.transport.as_ref().and_then(FramedTransport::last_fps) {
                    self.last_fps = Some(fps);
                }
                debug!(address = %self.address, fps = ?self.last_fps, "health check ok");
                self.publish();
            }
            Err(e) => self.on_failure(&e),
        }
    }

    async fn recover(&mut self) {
        self.next_recovery = None;
        let timeout = self.config.connection_timeout;

        if self.state == ConnectionState::Degraded {
            // Silent recovery over the existing transport first
            if let Some(transport) = self.transport.as_mut() {
                if transport.handshake(timeout).await.is_ok() {
                    self.failures = 0;
                    self.set_state(ConnectionState::Connected);
                    info!(address = %self.address, "link recovered");
                    return;
                }
            }

            match self.open_session().await {
                Ok(()) => {
                    self.failures = 0;
                    self.set_state(ConnectionState::Connected);
                    info!(address = %self.address, "link reconnected");
                    return;
                }
                Err(e) => {
                    self.failures += 1;
                    warn!(address = %self.address, failures = self.failures, error = %e, "recovery failed");
                }
            }

            if self.failures < self.config.degraded_failure_limit {
                self.schedule_recovery(self.config.backoff_delay(self.failures));
                self.publish();
                return;
            }

            warn!(address = %self.address, "giving up on degraded link, reconnecting");
            if let Some(mut transport) = self.transport.take() {
                transport.close().await;
            }
            self.set_state(ConnectionState::Disconnected);
        }

        if self.connect_with_retry().await.is_err() {
            self.schedule_recovery(self.config.health_check_interval);
        }
    }

    fn on_failure(&mut self, error: &LinkError) {
        if !error.is_connection_failure() || self.state != ConnectionState::Connected {
            return;
        }
        warn!(address = %self.address, error = %error, "link degraded");
        self.set_state(ConnectionState::Degraded);
        self.schedule_recovery(self.config.backoff_delay(self.failures));
    }

    fn on_inbound(&mut self, result: LinkResult<()>) {
        match result {
            Ok(()) => {
                let Some(transport) = self.transport.as_mut() else {
                    return;
                };
                let fps = transport.last_fps();
                transport.discard_pending();
                if fps.is_some() && fps != self.last_fps {
                    self.last_fps = fps;
                    self.publish();
                }
            }
            Err(e) => {
                self.transport = None;
                if self.state == ConnectionState::Connected {
                    self.on_failure(&e);
                } else if self.state == ConnectionState::Degraded && self.next_recovery.is_none() {
                    self.schedule_recovery(self.config.backoff_delay(self.failures));
                }
            }
        }
    }

    fn schedule_recovery(&mut self, delay: Duration) {
        self.next_recovery = Some(Instant::now() + delay);
    }

    async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.next_recovery = None;
        self.set_state(ConnectionState::Disconnected);
        debug!(address = %self.address, "link closed");
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        if state != ConnectionState::Connected {
            self.connected_at = None;
        }
        self.publish();
        self.events.emit(MindshowEvent::LinkState {
            address: self.address,
            state,
        });
    }

    fn publish(&self) {
        let snapshot = LinkSnapshot {
            address: self.address,
            state: self.state,
            catalog: self.catalog.clone(),
            active_pattern_id: self.active_pattern_id.clone(),
            last_known_variables: self.variables.clone(),
            last_fps: self.last_fps,
            failures: self.failures,
            connected_at: self.connected_at,
        };
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

async fn next_inbound(transport: &mut Option<FramedTransport>) -> LinkResult<()> {
    match transport {
        Some(transport) => transport.pump().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::{FakeConnector, FakeDevice};

    const LISTING: &str = "AB12CD34\tsparkfire\nEF56GH78\trainbow\n";

    fn addr() -> SocketAddr {
        "10.0.0.7:81".parse().unwrap()
    }

    fn test_config() -> LinkConfig {
        LinkConfig {
            connection_timeout: Duration::from_secs(1),
            retry_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            degraded_failure_limit: 2,
        }
    }

    async fn connect(device: &FakeDevice) -> (DeviceLink, watch::Sender<bool>) {
        let connector = FakeConnector::new().with_device(addr(), device.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = DeviceLink::establish(
            addr(),
            Arc::new(connector),
            test_config(),
            EventBus::default(),
            shutdown_rx,
        )
        .await
        .unwrap();
        (link, shutdown_tx)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = LinkConfig {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(5),
            ..test_config()
        };
        assert_eq!(config.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(5));
        assert_eq!(config.backoff_delay(40), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_loads_catalog_and_vars() {
        let device = FakeDevice::new(LISTING);
        device.set_vars(&[("hue", 0.4)]);
        let (link, _shutdown) = connect(&device).await;

        let snapshot = link.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.catalog, PatternCatalog::parse(LISTING));
        assert_eq!(snapshot.last_known_variables.get("hue"), Some(&0.4));
        assert!(snapshot.connected_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_pattern_by_substring() {
        let device = FakeDevice::new(LISTING);
        let (link, _shutdown) = connect(&device).await;

        let entry = link.switch_pattern("FIRE").await.unwrap().unwrap();
        assert_eq!(entry.id, "AB12CD34");
        assert_eq!(device.active_program().as_deref(), Some("AB12CD34"));
        assert_eq!(link.snapshot().active_pattern_id.as_deref(), Some("AB12CD34"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_pattern_miss_is_noop() {
        let device = FakeDevice::new(LISTING);
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let connector = FakeConnector::new().with_device(addr(), device.clone());
        let (_tx, shutdown_rx) = watch::channel(false);
        let link = DeviceLink::establish(addr(), Arc::new(connector), test_config(), events, shutdown_rx)
            .await
            .unwrap();

        let sent_before = device.received().len();
        assert_eq!(link.switch_pattern("nonexistent").await, Ok(None));
        assert_eq!(device.received().len(), sent_before);
        assert!(link.is_connected());

        let mut saw_miss = false;
        while let Ok(event) = rx.try_recv() {
            if let MindshowEvent::PatternMiss { requested, .. } = event {
                assert_eq!(requested, "nonexistent");
                saw_miss = true;
            }
        }
        assert!(saw_miss);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_variables_merges_after_send() {
        let device = FakeDevice::new(LISTING);
        let (link, _shutdown) = connect(&device).await;

        let vars: BTreeMap<String, f64> = [("speed".to_string(), 0.8)].into_iter().collect();
        link.set_variables(vars).await.unwrap();
        assert_eq!(device.vars().get("speed"), Some(&0.8));
        assert_eq!(link.snapshot().last_known_variables.get("speed"), Some(&0.8));

        device.set_fail_sends(true);
        let vars: BTreeMap<String, f64> = [("speed".to_string(), 0.1)].into_iter().collect();
        assert!(link.set_variables(vars).await.is_err());
        assert_eq!(link.snapshot().last_known_variables.get("speed"), Some(&0.8));
        assert_eq!(link.state(), ConnectionState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_unknown_id_rejected() {
        let device = FakeDevice::new(LISTING);
        let (link, _shutdown) = connect(&device).await;
        assert_eq!(
            link.activate_pattern("ZZZZ").await,
            Err(LinkError::UnknownPattern("ZZZZ".into()))
        );
        link.activate_pattern("EF56GH78").await.unwrap();
        assert_eq!(device.active_program().as_deref(), Some("EF56GH78"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_link_recovers_and_restores() {
        let device = FakeDevice::new(LISTING);
        let (link, _shutdown) = connect(&device).await;

        let vars: BTreeMap<String, f64> = [("brightness".to_string(), 0.9)].into_iter().collect();
        link.set_variables(vars).await.unwrap();

        device.drop_connection();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.state(), ConnectionState::Degraded);

        device.set_vars(&[("brightness", 0.1)]);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(device.connections(), 2);
        // Cached value re-applied over the device's reset state
        assert_eq!(device.vars().get("brightness"), Some(&0.9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_link_escalates_to_disconnected() {
        let device = FakeDevice::new(LISTING);
        let (link, _shutdown) = connect(&device).await;

        device.set_refuse(true);
        device.drop_connection();
        // Two failed recoveries, then a full connect cycle that also fails
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(link.state(), ConnectionState::Disconnected);

        device.set_refuse(false);
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_retries_with_backoff_then_fails() {
        let device = FakeDevice::new(LISTING);
        device.set_refuse(true);
        let connector = FakeConnector::new().with_device(addr(), device.clone());
        let (_tx, shutdown_rx) = watch::channel(false);

        let start = Instant::now();
        let err = DeviceLink::establish(
            addr(),
            Arc::new(connector),
            test_config(),
            EventBus::default(),
            shutdown_rx,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, LinkError::ConnectFailed { attempts: 3, .. }));
        assert_eq!(device.connect_attempts(), 3);
        // 1 s + 2 s between the three attempts
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_records_fps() {
        let device = FakeDevice::new(LISTING);
        let (link, _shutdown) = connect(&device).await;
        device.set_status_reply(true);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(link.snapshot().last_fps, Some(60.0));
        assert!(link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_health_check_degrades_then_recovers() {
        let device = FakeDevice::new(LISTING);
        let (link, _shutdown) = connect(&device).await;
        device.set_muted(true);

        // Ping goes out at 30 s and times out one second later
        tokio::time::sleep(Duration::from_millis(31_500)).await;
        assert_eq!(link.state(), ConnectionState::Degraded);

        device.set_muted(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_transport() {
        let device = FakeDevice::new(LISTING);
        let (link, _shutdown) = connect(&device).await;
        link.shutdown().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(device.closed());
        assert_eq!(link.set_variables(BTreeMap::new()).await, Err(LinkError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_without_state() {
        let device = FakeDevice::new(LISTING);
        let (link, _shutdown) = connect(&device).await;
        assert_eq!(link.restore_last_known_state().await, Ok(false));

        let vars: BTreeMap<String, f64> = [("hue".to_string(), 0.5)].into_iter().collect();
        link.set_variables(vars).await.unwrap();
        assert_eq!(link.restore_last_known_state().await, Ok(true));
    }
}
