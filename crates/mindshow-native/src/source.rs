//! Feature sources.
//!
//! The pipeline pulls at most one [`FeatureSample`] per tick from a
//! [`FeatureSource`]. Sources never block the tick: `poll_sample` returns
//! `Ok(None)` when nothing new arrived.
//!
//! - [`SimulatedSource`]: deterministic demo signal cycling through states
//! - [`OscFeatureSource`]: band powers received as OSC messages (requires
//!   `osc` feature)

use async_trait::async_trait;
use thiserror::Error;

use mindshow_core::{BrainState, EegBand, FeatureSample};

/// Feature source errors
#[derive(Debug, Error)]
pub enum SourceError {
    /// Network I/O error
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Packet could not be decoded
    #[error("Decoding error: {0}")]
    Decoding(String),
}

/// Feature source result type
pub type SourceResult<T> = Result<T, SourceError>;

/// Producer of band-power samples.
#[async_trait]
pub trait FeatureSource: Send {
    /// Newest sample since the last poll, `None` if nothing arrived.
    async fn poll_sample(&mut self) -> SourceResult<Option<FeatureSample>>;

    /// Short name for logs
    fn name(&self) -> &str;
}

// ============================================================================
// Simulated Source
// ============================================================================

/// Phase order of the simulated signal.
const SIMULATED_PHASES: [BrainState; 4] = [
    BrainState::Neutral,
    BrainState::Engaged,
    BrainState::Neutral,
    BrainState::Relaxed,
];

/// Deterministic signal that walks through neutral, engaged and relaxed
/// band profiles, holding each for a fixed number of ticks.
#[derive(Clone, Debug)]
pub struct SimulatedSource {
    tick: u64,
    phase_ticks: u64,
}

impl SimulatedSource {
    /// Ticks spent in each phase by default (10 s at 10 Hz).
    pub const DEFAULT_PHASE_TICKS: u64 = 100;

    /// Create a source holding each phase for the default duration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_phase_ticks(Self::DEFAULT_PHASE_TICKS)
    }

    /// Create a source holding each phase for `ticks` samples.
    #[must_use]
    pub fn with_phase_ticks(ticks: u64) -> Self {
        Self {
            tick: 0,
            phase_ticks: ticks.max(1),
        }
    }

    /// State the next sample is shaped after.
    #[must_use]
    pub fn current_phase(&self) -> BrainState {
        let index = (self.tick / self.phase_ticks) % SIMULATED_PHASES.len() as u64;
        SIMULATED_PHASES[index as usize]
    }

    /// Produce the next sample.
    pub fn next_sample(&mut self) -> FeatureSample {
        let (theta, alpha, beta) = match self.current_phase() {
            BrainState::Neutral => (4.0, 8.0, 40.0),
            BrainState::Engaged => (3.0, 3.0, 27.0),
            BrainState::Relaxed => (4.0, 18.0, 18.0),
        };
        #[allow(clippy::cast_precision_loss)]
        let wobble = 1.0 + 0.05 * (self.tick as f64 * 0.37).sin();
        self.tick += 1;

        FeatureSample::new()
            .with_band(EegBand::Delta, 10.0)
            .with_band(EegBand::Theta, theta)
            .with_band(EegBand::Alpha, alpha)
            .with_band(EegBand::Beta, beta * wobble)
            .with_band(EegBand::Gamma, 2.0)
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeatureSource for SimulatedSource {
    async fn poll_sample(&mut self) -> SourceResult<Option<FeatureSample>> {
        Ok(Some(self.next_sample()))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

// ============================================================================
// OSC Source
// ============================================================================

#[cfg(feature = "osc")]
pub use osc::{OscFeatureSource, DEFAULT_OSC_PREFIX};

#[cfg(feature = "osc")]
mod osc {
    use std::io::ErrorKind;
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use rosc::{decoder, OscMessage, OscPacket, OscType};
    use tokio::net::UdpSocket;
    use tracing::{debug, trace};

    use mindshow_core::{EegBand, FeatureSample};

    use super::{FeatureSource, SourceResult};

    /// Address prefix expected in front of the band name.
    pub const DEFAULT_OSC_PREFIX: &str = "/eeg";

    /// Band powers received as `/<prefix>/<band>` OSC messages.
    ///
    /// Each message updates one band with the mean of its numeric
    /// arguments (one per channel). Bands not yet received read as zero.
    pub struct OscFeatureSource {
        socket: UdpSocket,
        buffer: Vec<u8>,
        prefix: String,
        current: FeatureSample,
        fresh: bool,
    }

    impl OscFeatureSource {
        /// Bind a receiver on `bind_addr`, e.g. `"0.0.0.0:8000"`.
        ///
        /// # Errors
        ///
        /// Returns the bind error.
        pub async fn bind(bind_addr: &str) -> SourceResult<Self> {
            let socket = UdpSocket::bind(bind_addr).await?;
            Ok(Self {
                socket,
                buffer: vec![0u8; rosc::decoder::MTU],
                prefix: DEFAULT_OSC_PREFIX.to_string(),
                current: FeatureSample::new(),
                fresh: false,
            })
        }

        /// Set address prefix (default: `/eeg`)
        #[must_use]
        pub fn with_prefix(mut self, prefix: &str) -> Self {
            self.prefix = prefix.trim_end_matches('/').to_string();
            self
        }

        /// Bound local address
        ///
        /// # Errors
        ///
        /// Returns the socket error.
        pub fn local_addr(&self) -> SourceResult<SocketAddr> {
            Ok(self.socket.local_addr()?)
        }

        fn absorb(&mut self, packet: OscPacket) {
            match packet {
                OscPacket::Message(msg) => self.absorb_message(&msg),
                OscPacket::Bundle(bundle) => {
                    for content in bundle.content {
                        self.absorb(content);
                    }
                }
            }
        }

        fn absorb_message(&mut self, msg: &OscMessage) {
            let Some(band) = msg
                .addr
                .strip_prefix(self.prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
            else {
                trace!(addr = %msg.addr, "ignoring OSC address");
                return;
            };
            let band: EegBand = match band.parse() {
                Ok(band) => band,
                Err(e) => {
                    trace!(error = %e, "ignoring OSC band");
                    return;
                }
            };
            let Some(power) = mean_power(&msg.args) else {
                debug!(band = %band, "OSC message without numeric arguments");
                return;
            };
            self.current = self.current.with_band(band, power);
            self.fresh = true;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn mean_power(args: &[OscType]) -> Option<f64> {
        let values: Vec<f64> = args
            .iter()
            .filter_map(|arg| match arg {
                OscType::Float(v) => Some(f64::from(*v)),
                OscType::Double(v) => Some(*v),
                OscType::Int(v) => Some(f64::from(*v)),
                OscType::Long(v) => Some(*v as f64),
                _ => None,
            })
            .collect();
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    #[async_trait]
    impl FeatureSource for OscFeatureSource {
        async fn poll_sample(&mut self) -> SourceResult<Option<FeatureSample>> {
            loop {
                match self.socket.try_recv_from(&mut self.buffer) {
                    Ok((len, _addr)) => match decoder::decode_udp(&self.buffer[..len]) {
                        Ok((_, packet)) => self.absorb(packet),
                        Err(e) => debug!(error = ?e, "dropping undecodable OSC packet"),
                    },
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }

            if self.fresh {
                self.fresh = false;
                Ok(Some(self.current))
            } else {
                Ok(None)
            }
        }

        fn name(&self) -> &str {
            "osc"
        }
    }

}
