//! Frame classification on top of a raw transport.
//!
//! Every inbound frame is classified once by [`classify_frame`] and routed to
//! one of two queues: decoded control documents and raw pattern list text.
//! Request helpers then read only from the queue they care about, so an
//! interleaved status frame never breaks a catalog read and vice versa.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use mindshow_core::protocol::{
    classify_frame, CatalogAssembler, ControlMessage, InboundFrame, PatternCatalog, Request,
};

use super::link::{LinkError, LinkResult};
use super::transport::{Transport, TransportError};

/// A transport whose inbound frames are split into control and pattern list
/// streams.
pub struct FramedTransport {
    inner: Box<dyn Transport>,
    control: VecDeque<ControlMessage>,
    patterns: VecDeque<String>,
    last_fps: Option<f64>,
}

impl FramedTransport {
    /// Wrap an open transport.
    #[must_use]
    pub fn new(inner: Box<dyn Transport>) -> Self {
        Self {
            inner,
            control: VecDeque::new(),
            patterns: VecDeque::new(),
            last_fps: None,
        }
    }

    /// Send a request frame.
    pub async fn send(&mut self, request: &Request) -> LinkResult<()> {
        tracing::trace!(kind = request.kind(), "send");
        self.inner.send_text(request.to_frame()).await?;
        Ok(())
    }

    /// Read one frame from the wire and route it.
    ///
    /// Cancel-safe as long as the underlying transport's receive is.
    pub async fn pump(&mut self) -> LinkResult<()> {
        let text = self
            .inner
            .recv_text()
            .await?
            .ok_or(TransportError::Closed)?;

        match classify_frame(&text) {
            Ok(InboundFrame::Control(message)) => {
                if let ControlMessage::Status { fps } = message {
                    self.last_fps = Some(fps);
                }
                self.control.push_back(message);
            }
            Ok(InboundFrame::PatternList(fragment)) => self.patterns.push_back(fragment),
            Err(e) => tracing::debug!(error = %e, "dropping undecodable frame"),
        }
        Ok(())
    }

    /// Next control document, reading from the wire as needed.
    pub async fn next_control(&mut self) -> LinkResult<ControlMessage> {
        loop {
            if let Some(message) = self.control.pop_front() {
                return Ok(message);
            }
            self.pump().await?;
        }
    }

    /// Next pattern list fragment, reading from the wire as needed.
    pub async fn next_pattern_fragment(&mut self) -> LinkResult<String> {
        loop {
            if let Some(fragment) = self.patterns.pop_front() {
                return Ok(fragment);
            }
            self.pump().await?;
        }
    }

    /// Send `{"ping": true}` and wait for an `ack` or `fps` document.
    pub async fn handshake(&mut self, timeout: Duration) -> LinkResult<()> {
        self.control.clear();
        with_timeout("handshake", timeout, self.handshake_reply()).await
    }

    async fn handshake_reply(&mut self) -> LinkResult<()> {
        self.send(&Request::Ping).await?;
        loop {
            if self.next_control().await?.is_handshake_reply() {
                return Ok(());
            }
        }
    }

    /// Request and assemble the pattern catalog.
    pub async fn fetch_catalog(&mut self, timeout: Duration) -> LinkResult<PatternCatalog> {
        self.patterns.clear();
        with_timeout("listPrograms", timeout, self.assemble_catalog()).await
    }

    async fn assemble_catalog(&mut self) -> LinkResult<PatternCatalog> {
        self.send(&Request::ListPrograms).await?;
        let mut assembler = CatalogAssembler::new();
        loop {
            let fragment = self.next_pattern_fragment().await?;
            if let Some(catalog) = assembler.push(&fragment)? {
                return Ok(catalog);
            }
        }
    }

    /// Request the controller's current variables.
    pub async fn fetch_vars(&mut self, timeout: Duration) -> LinkResult<BTreeMap<String, f64>> {
        self.control.clear();
        with_timeout("getVars", timeout, self.vars_reply()).await
    }

    async fn vars_reply(&mut self) -> LinkResult<BTreeMap<String, f64>> {
        self.send(&Request::GetVars).await?;
        loop {
            if let ControlMessage::Vars(vars) = self.next_control().await? {
                return Ok(vars);
            }
        }
    }

    /// Drop queued frames nobody asked for. Returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.control.len() + self.patterns.len();
        self.control.clear();
        self.patterns.clear();
        dropped
    }

    /// Frame rate from the most recent status document.
    #[must_use]
    pub fn last_fps(&self) -> Option<f64> {
        self.last_fps
    }

    /// Close the underlying transport, ignoring errors.
    pub async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            tracing::debug!(error = %e, "close failed");
        }
    }
}

async fn with_timeout<T>(
    operation: &'static str,
    after: Duration,
    fut: impl std::future::Future<Output = LinkResult<T>>,
) -> LinkResult<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| LinkError::Timeout { operation, after })?
}
