//! Controller registry and subnet discovery.
//!
//! The registry owns every [`DeviceLink`] in the process. Its only shared
//! state is the address index, locked for add and remove; readers take a
//! snapshot of the link handles and work on that.
//!
//! # Discovery
//!
//! ```rust,ignore
//! use mindshow_native::bridge::{DeviceRegistry, WebSocketConnector};
//!
//! let registry = DeviceRegistry::new(Arc::new(WebSocketConnector), config, events);
//! let found = registry.discover(Duration::from_secs(10)).await?;
//! println!("{}", registry.status().connected);
//! ```
//!
//! Every host of the local /24 is probed at once, each with its own short
//! handshake timeout, and the whole pass is bounded by the caller's timeout.
//! Connecting the responders shares that budget but always gets at least
//! one connection timeout.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use mindshow_core::config::Tunables;
use mindshow_core::protocol::PatternCatalog;

use super::framing::FramedTransport;
use super::link::{
    shutdown_signalled, ConnectionState, DeviceLink, LinkConfig, LinkError, LinkResult,
};
use super::transport::Connector;
use crate::config::ConfigHandle;
use crate::events::{EventBus, MindshowEvent};

/// Address used only to pick the outbound interface; nothing is sent.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

// ============================================================================
// Error Types
// ============================================================================

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    /// No usable local interface address
    #[error("No local network address: {0}")]
    NoLocalAddress(String),

    /// The local address is not IPv4, so there is no /24 to scan
    #[error("Local address {0} is not IPv4")]
    NotIpv4(IpAddr),

    /// No link for this address
    #[error("No controller at {0}")]
    NotFound(SocketAddr),

    /// A link for this address already exists
    #[error("Controller already connected: {0}")]
    AlreadyConnected(SocketAddr),

    /// Controller limit reached
    #[error("Maximum controller limit reached ({0})")]
    TooManyDevices(usize),

    /// Link-level failure
    #[error(transparent)]
    Link(#[from] LinkError),

    /// The registry is shutting down
    #[error("Registry is shutting down")]
    ShuttingDown,
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

// ============================================================================
// Status
// ============================================================================

/// One line of [`RegistryStatus`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceSummary {
    /// Controller address
    pub address: SocketAddr,
    /// Connection state
    pub state: ConnectionState,
    /// Number of catalog entries
    pub patterns: usize,
    /// Last activated pattern id
    pub active_pattern_id: Option<String>,
    /// Last reported frame rate
    pub last_fps: Option<f64>,
    /// Consecutive failures
    pub failures: u32,
}

/// Snapshot of the registry.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RegistryStatus {
    /// Links currently connected
    pub connected: usize,
    /// Links in any state
    pub total: usize,
    /// Per-device detail, ordered by address
    pub devices: Vec<DeviceSummary>,
}

// ============================================================================
// Registry
// ============================================================================

/// Owner of every controller link.
#[derive(Clone)]
pub struct DeviceRegistry {
    connector: Arc<dyn Connector>,
    config: ConfigHandle,
    links: Arc<Mutex<BTreeMap<SocketAddr, DeviceLink>>>,
    events: EventBus,
    shutdown_tx: Arc<watch::Sender<bool>>,
    subnet: Option<Ipv4Addr>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("links", &self.index().len())
            .field("subnet", &self.subnet)
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: ConfigHandle, events: EventBus) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            connector,
            config,
            links: Arc::new(Mutex::new(BTreeMap::new())),
            events,
            shutdown_tx: Arc::new(shutdown_tx),
            subnet: None,
        }
    }

    /// Scan the /24 containing `addr` instead of the local interface's.
    #[must_use]
    pub fn with_subnet(mut self, addr: Ipv4Addr) -> Self {
        self.subnet = Some(addr);
        self
    }

    fn index(&self) -> MutexGuard<'_, BTreeMap<SocketAddr, DeviceLink>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Probe the local /24 and connect responding controllers.
    ///
    /// Returns how many links this pass added. Hosts that already have a
    /// link are not probed. Finding nothing is `Ok(0)`. Responders still
    /// connecting when the budget runs out are dropped from this pass.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NoLocalAddress`] or [`RegistryError::NotIpv4`] when
    /// the subnet cannot be derived, [`RegistryError::ShuttingDown`] if
    /// shutdown starts during the pass.
    pub async fn discover(&self, timeout: Duration) -> RegistryResult<usize> {
        if self.is_shutting_down() {
            return Err(RegistryError::ShuttingDown);
        }

        let tunables = self.config.current();
        let base = match self.subnet {
            Some(addr) => addr,
            None => local_ipv4().await?,
        };
        let started = Instant::now();
        let [a, b, c, _] = base.octets();
        info!(subnet = %format!("{a}.{b}.{c}.0/24"), ?timeout, "discovering controllers");

        let known: Vec<SocketAddr> = self.index().keys().copied().collect();
        let per_host = tunables.probe_timeout();
        let mut probes = JoinSet::new();
        for host in 1..=254u8 {
            let addr = SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(a, b, c, host)),
                tunables.device_port,
            );
            if known.contains(&addr) {
                continue;
            }
            let connector = Arc::clone(&self.connector);
            probes.spawn(async move {
                let ok = probe(connector.as_ref(), addr, per_host).await.is_ok();
                (addr, ok)
            });
        }
        let probed = probes.len();

        let mut responders = Vec::new();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            result = tokio::time::timeout(timeout, collect_responders(&mut probes, &mut responders)) => {
                if result.is_err() {
                    debug!(pending = probes.len(), "discovery timeout reached");
                }
            }
            () = shutdown_signalled(&mut shutdown) => {
                probes.abort_all();
                return Err(RegistryError::ShuttingDown);
            }
        }
        probes.abort_all();

        responders.sort_unstable();
        let responded = responders.len();
        let slots = tunables
            .max_controllers
            .saturating_sub(self.index().len());
        if responded > slots {
            info!(responded, slots, "more controllers than free slots");
        }

        // Responders found at the deadline still get one connect timeout
        let budget = timeout
            .saturating_sub(started.elapsed())
            .max(tunables.connection_timeout());
        let deadline = Instant::now() + budget;
        let mut attempts: FuturesUnordered<_> = responders
            .into_iter()
            .take(slots)
            .map(|addr| self.add_link(addr, &tunables))
            .collect();
        let mut connected = 0;
        loop {
            match tokio::time::timeout_at(deadline, attempts.next()).await {
                Ok(Some(Ok(_))) => connected += 1,
                Ok(Some(Err(RegistryError::ShuttingDown))) => {
                    return Err(RegistryError::ShuttingDown)
                }
                Ok(Some(Err(e))) => warn!(error = %e, "controller found but not connected"),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = attempts.len(), ?budget, "connect phase cut by discovery timeout");
                    break;
                }
            }
        }

        let elapsed = started.elapsed();
        info!(probed, responded, connected, ?elapsed, "discovery finished");
        self.events.emit(MindshowEvent::DiscoveryFinished {
            probed,
            responded,
            connected,
            elapsed,
        });
        Ok(connected)
    }

    /// Connect a controller at a known address without scanning.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyConnected`], [`RegistryError::TooManyDevices`],
    /// or the link's connect failure.
    pub async fn connect_address(&self, address: SocketAddr) -> RegistryResult<DeviceLink> {
        let tunables = self.config.current();
        self.add_link(address, &tunables).await
    }

    async fn add_link(&self, address: SocketAddr, tunables: &Tunables) -> RegistryResult<DeviceLink> {
        if self.is_shutting_down() {
            return Err(RegistryError::ShuttingDown);
        }
        self.check_capacity(address, tunables.max_controllers)?;

        let link = DeviceLink::establish(
            address,
            Arc::clone(&self.connector),
            LinkConfig::from(tunables),
            self.events.clone(),
            self.shutdown_tx.subscribe(),
        )
        .await
        .map_err(|e| match e {
            LinkError::Closed if self.is_shutting_down() => RegistryError::ShuttingDown,
            other => RegistryError::Link(other),
        })?;

        // Another caller may have raced us to the same address or the last slot
        let admitted = {
            let mut links = self.index();
            if links.contains_key(&address) {
                Err(RegistryError::AlreadyConnected(address))
            } else if links.len() >= tunables.max_controllers {
                Err(RegistryError::TooManyDevices(tunables.max_controllers))
            } else {
                links.insert(address, link.clone());
                Ok(())
            }
        };
        if let Err(e) = admitted {
            link.shutdown().await;
            return Err(e);
        }

        info!(address = %address, patterns = link.patterns().len(), "controller added");
        Ok(link)
    }

    fn check_capacity(&self, address: SocketAddr, max: usize) -> RegistryResult<()> {
        let links = self.index();
        if links.contains_key(&address) {
            return Err(RegistryError::AlreadyConnected(address));
        }
        if links.len() >= max {
            return Err(RegistryError::TooManyDevices(max));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Connected count, total and per-device detail.
    #[must_use]
    pub fn status(&self) -> RegistryStatus {
        let devices: Vec<DeviceSummary> = self
            .links()
            .iter()
            .map(|link| {
                let snapshot = link.snapshot();
                DeviceSummary {
                    address: snapshot.address,
                    state: snapshot.state,
                    patterns: snapshot.catalog.len(),
                    active_pattern_id: snapshot.active_pattern_id,
                    last_fps: snapshot.last_fps,
                    failures: snapshot.failures,
                }
            })
            .collect();

        RegistryStatus {
            connected: devices
                .iter()
                .filter(|d| d.state == ConnectionState::Connected)
                .count(),
            total: devices.len(),
            devices,
        }
    }

    /// Snapshot of every link handle, ordered by address.
    #[must_use]
    pub fn links(&self) -> Vec<DeviceLink> {
        self.index().values().cloned().collect()
    }

    /// Snapshot of the links currently connected.
    #[must_use]
    pub fn connected_links(&self) -> Vec<DeviceLink> {
        self.links()
            .into_iter()
            .filter(DeviceLink::is_connected)
            .collect()
    }

    /// Link for one address.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if no link exists.
    pub fn link(&self, address: SocketAddr) -> RegistryResult<DeviceLink> {
        self.index()
            .get(&address)
            .cloned()
            .ok_or(RegistryError::NotFound(address))
    }

    /// Cached pattern catalog of one controller.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if no link exists.
    pub fn device_patterns(&self, address: SocketAddr) -> RegistryResult<PatternCatalog> {
        Ok(self.link(address)?.patterns())
    }

    /// Activate an exact catalog id on one controller.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] or the link's failure, including
    /// [`LinkError::UnknownPattern`].
    pub async fn switch_device_pattern(
        &self,
        address: SocketAddr,
        pattern_id: &str,
    ) -> RegistryResult<()> {
        let link = self.link(address)?;
        link.activate_pattern(pattern_id).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Close and remove every link. Returns how many were removed.
    pub async fn disconnect_all(&self) -> usize {
        let links: Vec<DeviceLink> = {
            let mut index = self.index();
            std::mem::take(&mut *index).into_values().collect()
        };
        let count = links.len();
        join_all(links.iter().map(DeviceLink::shutdown)).await;
        if count > 0 {
            info!(count, "controllers disconnected");
        }
        count
    }

    /// Cancel in-flight discovery and connects, then close every link.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.disconnect_all().await;
    }
}

/// Handshake one host: connect, ping, close.
async fn probe(connector: &dyn Connector, addr: SocketAddr, timeout: Duration) -> LinkResult<()> {
    let attempt = async {
        let mut framed = FramedTransport::new(connector.connect(addr).await?);
        let result = framed.handshake(timeout).await;
        framed.close().await;
        result
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| LinkError::Timeout {
            operation: "probe",
            after: timeout,
        })?
}

async fn collect_responders(
    probes: &mut JoinSet<(SocketAddr, bool)>,
    responders: &mut Vec<SocketAddr>,
) {
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((addr, true)) => {
                debug!(address = %addr, "controller responded");
                responders.push(addr);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "probe task failed"),
        }
    }
}

/// Local IPv4 address of the default route's interface.
async fn local_ipv4() -> RegistryResult<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| RegistryError::NoLocalAddress(e.to_string()))?;
    socket
        .connect(ROUTE_PROBE_ADDR)
        .await
        .map_err(|e| RegistryError::NoLocalAddress(e.to_string()))?;
    let local = socket
        .local_addr()
        .map_err(|e| RegistryError::NoLocalAddress(e.to_string()))?;
    match local.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        IpAddr::V4(ip) => Err(RegistryError::NoLocalAddress(ip.to_string())),
        other @ IpAddr::V6(_) => Err(RegistryError::NotIpv4(other)),
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
    const SUBNET: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);

    fn host(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 81)
    }

    fn registry(connector: FakeConnector, tunables: Tunables) -> DeviceRegistry {
        DeviceRegistry::new(
            Arc::new(connector),
            ConfigHandle::new(tunables),
            EventBus::default(),
        )
        .with_subnet(SUBNET)
    }

    fn fast_tunables() -> Tunables {
        Tunables {
            probe_timeout_s: 1.0,
            connection_timeout_s: 1.0,
            ..Tunables::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_bounded_by_probe_timeout_not_host_count() {
        let connector = FakeConnector::new()
            .with_device(host(7), FakeDevice::new(LISTING))
            .with_device(host(42), FakeDevice::new(LISTING));
        let registry = registry(connector.clone(), fast_tunables());

        let started = Instant::now();
        let found = registry.discover(Duration::from_secs(3)).await.unwrap();

        assert_eq!(found, 2);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(connector.attempts() >= 254);

        let status = registry.status();
        assert_eq!(status.connected, 2);
        assert_eq!(status.total, 2);
        let addresses: Vec<_> = status.devices.iter().map(|d| d.address).collect();
        assert_eq!(addresses, vec![host(7), host(42)]);
        assert!(status.devices.iter().all(|d| d.patterns == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_cut_by_overall_timeout() {
        let connector = FakeConnector::new()
            .with_device(host(3), FakeDevice::new(LISTING))
            .with_device(host(200), FakeDevice::new(LISTING));
        let tunables = Tunables {
            probe_timeout_s: 5.0,
            ..fast_tunables()
        };
        let registry = registry(connector, tunables);

        let started = Instant::now();
        let found = registry.discover(Duration::from_secs(2)).await.unwrap();

        assert_eq!(found, 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_connect_phase_shares_budget() {
        // Answers the scan, then refuses the real connection
        let flaky = FakeDevice::new(LISTING);
        flaky.set_accept_limit(1);
        let connector = FakeConnector::new()
            .with_device(host(8), FakeDevice::new(LISTING))
            .with_device(host(9), flaky.clone());
        let registry = registry(connector, fast_tunables());

        let started = Instant::now();
        let found = registry.discover(Duration::from_secs(2)).await.unwrap();

        assert_eq!(found, 1);
        assert!(started.elapsed() < Duration::from_millis(2100));
        assert!(flaky.connect_attempts() >= 2);
        let addresses: Vec<_> = registry.links().iter().map(DeviceLink::address).collect();
        assert_eq!(addresses, vec![host(8)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_respects_controller_limit() {
        let connector = FakeConnector::new()
            .with_device(host(5), FakeDevice::new(LISTING))
            .with_device(host(6), FakeDevice::new(LISTING))
            .with_device(host(9), FakeDevice::new(LISTING));
        let tunables = Tunables {
            max_controllers: 2,
            ..fast_tunables()
        };
        let registry = registry(connector, tunables);

        assert_eq!(registry.discover(Duration::from_secs(3)).await.unwrap(), 2);
        let addresses: Vec<_> = registry.links().iter().map(DeviceLink::address).collect();
        assert_eq!(addresses, vec![host(5), host(6)]);

        assert_eq!(
            registry.connect_address(host(9)).await.unwrap_err(),
            RegistryError::TooManyDevices(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_with_no_controllers() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let registry = DeviceRegistry::new(
            Arc::new(FakeConnector::new()),
            ConfigHandle::new(fast_tunables()),
            events,
        )
        .with_subnet(SUBNET);

        assert_eq!(registry.discover(Duration::from_secs(3)).await, Ok(0));
        assert_eq!(registry.status(), RegistryStatus::default());

        match rx.recv().await.unwrap() {
            MindshowEvent::DiscoveryFinished {
                probed,
                responded,
                connected,
                ..
            } => {
                assert_eq!(probed, 254);
                assert_eq!(responded, 0);
                assert_eq!(connected, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovery_skips_known_hosts() {
        let device = FakeDevice::new(LISTING);
        let connector = FakeConnector::new().with_device(host(7), device.clone());
        let registry = registry(connector, fast_tunables());

        assert_eq!(registry.discover(Duration::from_secs(3)).await, Ok(1));
        let attempts = device.connect_attempts();
        assert_eq!(registry.discover(Duration::from_secs(3)).await, Ok(0));
        assert_eq!(device.connect_attempts(), attempts);
        assert_eq!(registry.status().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_address_rejects_duplicate() {
        let connector = FakeConnector::new().with_device(host(7), FakeDevice::new(LISTING));
        let registry = registry(connector, fast_tunables());

        registry.connect_address(host(7)).await.unwrap();
        assert_eq!(
            registry.connect_address(host(7)).await.unwrap_err(),
            RegistryError::AlreadyConnected(host(7))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_address_surfaces_connect_failure() {
        let device = FakeDevice::new(LISTING);
        device.set_refuse(true);
        let connector = FakeConnector::new().with_device(host(7), device.clone());
        let registry = registry(connector, fast_tunables());

        let err = registry.connect_address(host(7)).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Link(LinkError::ConnectFailed { attempts: 3, .. })
        ));
        assert_eq!(device.connect_attempts(), 3);
        assert_eq!(registry.status().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_discovery() {
        let tunables = Tunables {
            probe_timeout_s: 30.0,
            ..fast_tunables()
        };
        let registry = registry(FakeConnector::new(), tunables);

        let scan = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.discover(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = Instant::now();
        registry.shutdown().await;
        assert_eq!(scan.await.unwrap(), Err(RegistryError::ShuttingDown));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(
            registry.discover(Duration::from_secs(1)).await,
            Err(RegistryError::ShuttingDown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_device_pattern_control() {
        let device = FakeDevice::new(LISTING);
        let connector = FakeConnector::new().with_device(host(7), device.clone());
        let registry = registry(connector, fast_tunables());
        registry.connect_address(host(7)).await.unwrap();

        let catalog = registry.device_patterns(host(7)).unwrap();
        assert_eq!(catalog.name_of("EF56GH78"), Some("rainbow"));

        registry.switch_device_pattern(host(7), "EF56GH78").await.unwrap();
        assert_eq!(device.active_program().as_deref(), Some("EF56GH78"));
        assert_eq!(
            registry.status().devices[0].active_pattern_id.as_deref(),
            Some("EF56GH78")
        );

        assert_eq!(
            registry.device_patterns(host(8)).unwrap_err(),
            RegistryError::NotFound(host(8))
        );
        assert!(matches!(
            registry.switch_device_pattern(host(7), "ZZZZ").await,
            Err(RegistryError::Link(LinkError::UnknownPattern(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_closes_transports() {
        let first = FakeDevice::new(LISTING);
        let second = FakeDevice::new(LISTING);
        let connector = FakeConnector::new()
            .with_device(host(7), first.clone())
            .with_device(host(8), second.clone());
        let registry = registry(connector, fast_tunables());
        registry.connect_address(host(7)).await.unwrap();
        registry.connect_address(host(8)).await.unwrap();

        assert_eq!(registry.disconnect_all().await, 2);
        assert!(first.closed());
        assert!(second.closed());
        assert_eq!(registry.status().total, 0);
    }
}
