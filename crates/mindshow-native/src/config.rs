//! Shared runtime configuration.
//!
//! [`ConfigHandle`] wraps a `watch` channel holding the current
//! [`Tunables`]. Components read the latest value at the point of use, so
//! an update takes effect on the next tick, discovery pass or connect without
//! restarting anything.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use mindshow_core::config::{Tunable, Tunables};
use mindshow_core::error::ConfigResult;

/// Cloneable handle to the live tunables.
#[derive(Clone, Debug)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Tunables>>,
}

impl ConfigHandle {
    /// Create a handle holding `tunables`.
    #[must_use]
    pub fn new(tunables: Tunables) -> Self {
        let (tx, _) = watch::channel(tunables);
        Self { tx: Arc::new(tx) }
    }

    /// Copy of the current tunables.
    #[must_use]
    pub fn current(&self) -> Tunables {
        self.tx.borrow().clone()
    }

    /// Subscribe to changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Tunables> {
        self.tx.subscribe()
    }

    /// Set one tunable by name.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`](mindshow_core::error::ConfigError) from
    /// validation; the old value stays.
    pub fn set(&self, name: &str, value: f64) -> ConfigResult<()> {
        let tunable: Tunable = name.parse()?;
        self.update(tunable, value)
    }

    /// Apply a `name=value` assignment.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`](mindshow_core::error::ConfigError) from
    /// parsing or validation.
    pub fn apply_assignment(&self, assignment: &str) -> ConfigResult<Tunable> {
        let (tunable, value) = Tunables::parse_assignment(assignment)?;
        self.update(tunable, value)?;
        Ok(tunable)
    }

    /// Validate and publish in one step; rejected values never reach
    /// subscribers.
    fn update(&self, tunable: Tunable, value: f64) -> ConfigResult<()> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|tunables| {
            outcome = tunables.apply(tunable, value);
            outcome.is_ok()
        });
        outcome?;
        info!(tunable = %tunable, value = self.tx.borrow().get(tunable), "tunable updated");
        Ok(())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(Tunables::default())
    }
}
