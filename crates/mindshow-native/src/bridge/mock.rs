//! In-memory controllers for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::transport::{Connector, Transport, TransportError, TransportResult};

#[derive(Default)]
struct DeviceState {
    listing: Vec<String>,
    vars: BTreeMap<String, f64>,
    active_program: Option<String>,
    received: Vec<String>,
    outbound: VecDeque<String>,
    generation: u64,
    connections: usize,
    muted: bool,
    status_reply: bool,
    fail_sends: bool,
    stall_sends: bool,
    refuse: bool,
    accept_limit: Option<usize>,
    dropped: bool,
    closed: bool,
}

/// Scripted controller shared between a test and the transports it hands out.
#[derive(Clone)]
pub(crate) struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
    attempts: Arc<AtomicUsize>,
}

impl FakeDevice {
    /// Controller that answers `listPrograms` with one frame.
    pub(crate) fn new(listing: &str) -> Self {
        Self::with_fragments(&[listing])
    }

    /// Controller that answers `listPrograms` with the given frames in order.
    pub(crate) fn with_fragments(fragments: &[&str]) -> Self {
        let state = DeviceState {
            listing: fragments.iter().map(|f| (*f).to_string()).collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    /// Open a new session, killing any previous one.
    pub(crate) fn transport(&self) -> Box<dyn Transport> {
        let mut state = self.lock();
        state.generation += 1;
        state.connections += 1;
        state.dropped = false;
        state.closed = false;
        state.outbound.clear();
        Box::new(FakeTransport {
            device: self.clone(),
            generation: state.generation,
        })
    }

    pub(crate) fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    pub(crate) fn vars(&self) -> BTreeMap<String, f64> {
        self.lock().vars.clone()
    }

    pub(crate) fn set_vars(&self, vars: &[(&str, f64)]) {
        let mut state = self.lock();
        for (name, value) in vars {
            state.vars.insert((*name).to_string(), *value);
        }
    }

    pub(crate) fn active_program(&self) -> Option<String> {
        self.lock().active_program.clone()
    }

    pub(crate) fn connections(&self) -> usize {
        self.lock().connections
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> bool {
        self.lock().closed
    }

    /// Stop answering requests.
    pub(crate) fn set_muted(&self, muted: bool) {
        self.lock().muted = muted;
    }

    /// Answer pings with a status document instead of an ack.
    pub(crate) fn set_status_reply(&self, status: bool) {
        self.lock().status_reply = status;
    }

    /// Make every send fail.
    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Make every send hang.
    pub(crate) fn set_stall_sends(&self, stall: bool) {
        self.lock().stall_sends = stall;
    }

    /// Refuse new connections.
    pub(crate) fn set_refuse(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    /// Refuse connections once `limit` sessions have been opened.
    pub(crate) fn set_accept_limit(&self, limit: usize) {
        self.lock().accept_limit = Some(limit);
    }

    /// Kill the current session from the device side.
    pub(crate) fn drop_connection(&self) {
        self.lock().dropped = true;
    }

    fn handle_request(state: &mut DeviceState, text: &str) {
        let Ok(Value::Object(doc)) = serde_json::from_str::<Value>(text) else {
            return;
        };

        if let Some(Value::Object(vars)) = doc.get("setVars") {
            for (name, value) in vars {
                if let Some(v) = value.as_f64() {
                    state.vars.insert(name.clone(), v);
                }
            }
        }
        if let Some(id) = doc.get("activeProgramId").and_then(Value::as_str) {
            state.active_program = Some(id.to_string());
        }
        if state.muted {
            return;
        }
        if doc.contains_key("ping") {
            let reply = if state.status_reply {
                json!({ "fps": 60.0, "vmerr": 0 })
            } else {
                json!({ "ack": 1 })
            };
            state.outbound.push_back(reply.to_string());
        }
        if doc.contains_key("listPrograms") {
            let listing = state.listing.clone();
            state.outbound.extend(listing);
        }
        if doc.contains_key("getVars") {
            let reply = json!({ "vars": state.vars });
            state.outbound.push_back(reply.to_string());
        }
    }
}

struct FakeTransport {
    device: FakeDevice,
    generation: u64,
}

impl FakeTransport {
    fn is_dead(&self, state: &DeviceState) -> bool {
        state.dropped || state.closed || state.generation != self.generation
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        let stall = {
            let mut state = self.device.lock();
            if self.is_dead(&state) {
                return Err(TransportError::Closed);
            }
            if state.fail_sends {
                return Err(TransportError::Send("injected failure".into()));
            }
            if !state.stall_sends {
                state.received.push(text.clone());
                FakeDevice::handle_request(&mut state, &text);
            }
            state.stall_sends
        };
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn recv_text(&mut self) -> TransportResult<Option<String>> {
        loop {
            {
                let mut state = self.device.lock();
                if self.is_dead(&state) {
                    return Ok(None);
                }
                if let Some(frame) = state.outbound.pop_front() {
                    return Ok(Some(frame));
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        let mut state = self.device.lock();
        if state.generation == self.generation {
            state.closed = true;
        }
        Ok(())
    }
}

/// Connector over a fixed set of fake controllers. Unknown addresses never
/// answer.
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    devices: HashMap<SocketAddr, FakeDevice>,
    attempts: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_device(mut self, addr: SocketAddr, device: FakeDevice) -> Self {
        self.devices.insert(addr, device);
        self
    }

    /// Connection attempts across all addresses, silent ones included.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, addr: SocketAddr) -> TransportResult<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let Some(device) = self.devices.get(&addr) else {
            return std::future::pending().await;
        };
        device.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = {
            let state = device.lock();
            state.refuse || state.accept_limit.is_some_and(|n| state.connections >= n)
        };
        if refused {
            return Err(TransportError::Connect {
                addr,
                reason: "connection refused".into(),
            });
        }
        Ok(device.transport())
    }
}
