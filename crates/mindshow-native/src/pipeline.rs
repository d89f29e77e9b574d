//! Fixed-rate tick loop.
//!
//! Each tick pulls one sample, runs it through the classifier and the mood
//! mapper, and hands the result to the dispatcher. A tick without a sample
//! is skipped; nothing is sent.
//!
//! ```rust,ignore
//! let pipeline = Pipeline::new(Box::new(SimulatedSource::new()), dispatcher, &config, events);
//! let stats = pipeline.run(shutdown_rx).await;
//! ```

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use mindshow_core::config::Tunables;
use mindshow_core::{
    BrainState, Classification, ClassifierConfig, MoodConfig, MoodMapper, MoodReading,
    StateClassifier,
};

use crate::bridge::link::shutdown_signalled;
use crate::config::ConfigHandle;
use crate::dispatch::{CommandDispatcher, DispatchSummary};
use crate::events::{EventBus, MindshowEvent};
use crate::source::FeatureSource;

/// Processed ticks between status summaries.
pub const STATUS_INTERVAL_TICKS: u64 = 100;

/// Everything computed for one processed tick.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TickReport {
    /// Processed tick number, from 1
    pub tick: u64,
    /// Classifier outcome, including metrics and confidence counter
    pub classification: Classification,
    /// Mood stages
    pub mood: MoodReading,
    /// Mean of attention and relaxation
    pub engagement: f64,
    /// Fan-out result
    pub dispatch: DispatchSummary,
}

/// Running counters of the tick loop.
#[derive(Clone, Debug)]
pub struct PipelineStats {
    /// Timer ticks seen
    pub ticks: u64,
    /// Ticks that had a sample and ran the full path
    pub processed: u64,
    /// Ticks skipped for lack of a sample
    pub skipped: u64,
    /// Commands applied by a controller
    pub led_updates: u64,
    /// Source errors plus failed or timed-out sends
    pub errors: u64,
    /// When the loop was created
    pub started: Instant,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            ticks: 0,
            processed: 0,
            skipped: 0,
            led_updates: 0,
            errors: 0,
            started: Instant::now(),
        }
    }

    /// Time since the loop was created
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Sample source, classifier, mood mapper and dispatcher wired together.
pub struct Pipeline {
    source: Box<dyn FeatureSource>,
    classifier: StateClassifier,
    mood: MoodMapper,
    dispatcher: CommandDispatcher,
    config: watch::Receiver<Tunables>,
    events: EventBus,
    stats: PipelineStats,
}

impl Pipeline {
    /// Create a pipeline using the current tunables.
    #[must_use]
    pub fn new(
        source: Box<dyn FeatureSource>,
        dispatcher: CommandDispatcher,
        config: &ConfigHandle,
        events: EventBus,
    ) -> Self {
        let mut config = config.subscribe();
        let tunables = config.borrow_and_update().clone();
        Self {
            source,
            classifier: StateClassifier::new(ClassifierConfig::from(&tunables)),
            mood: MoodMapper::new(MoodConfig::from(&tunables)),
            dispatcher,
            config,
            events,
            stats: PipelineStats::new(),
        }
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Current debounced state
    #[must_use]
    pub fn state(&self) -> BrainState {
        self.classifier.state()
    }

    /// Run one tick. `None` if the tick was skipped.
    pub async fn tick(&mut self) -> Option<TickReport> {
        self.stats.ticks += 1;
        self.apply_config_changes();

        let sample = match self.source.poll_sample().await {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                self.stats.skipped += 1;
                return None;
            }
            Err(e) => {
                warn!(source = self.source.name(), error = %e, "feature source failed");
                self.stats.errors += 1;
                return None;
            }
        };

        let previous = self.classifier.state();
        let classification = self
            .classifier
            .classify(&sample, Instant::now().into_std());
        let mood = self.mood.update_metrics(classification.metrics);

        if classification.changed {
            info!(from = %previous, to = %classification.state, "brain state changed");
            self.events.emit(MindshowEvent::StateTransition {
                from: previous,
                to: classification.state,
            });
        }

        let report = self
            .dispatcher
            .dispatch(classification.state, mood.smoothed, classification.changed)
            .await;
        let dispatch = DispatchSummary::from(&*report);
        self.stats.processed += 1;
        self.stats.led_updates += dispatch.delivered as u64;
        self.stats.errors += dispatch.failed as u64;

        let tick = TickReport {
            tick: self.stats.processed,
            classification,
            mood,
            engagement: classification.metrics.engagement(),
            dispatch,
        };
        debug!(
            state = %classification.state,
            attention = classification.metrics.attention,
            relaxation = classification.metrics.relaxation,
            mood = mood.smoothed,
            confidence = classification.confidence,
            "tick"
        );
        self.events.emit(MindshowEvent::Tick(tick));

        if self.stats.processed % STATUS_INTERVAL_TICKS == 0 {
            self.log_status();
        }
        Some(tick)
    }

    /// Tick at the configured rate until `shutdown` flips to `true`.
    ///
    /// A tick already in progress finishes before the loop exits.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> PipelineStats {
        let mut period = self.config.borrow().tick_period();
        let mut ticker = tick_interval(Instant::now(), period);
        info!(source = self.source.name(), ?period, "pipeline started");

        loop {
            tokio::select! {
                () = shutdown_signalled(&mut shutdown) => break,
                _ = ticker.tick() => {
                    self.tick().await;

                    let next = self.config.borrow().tick_period();
                    if next != period {
                        info!(?next, "tick period changed");
                        period = next;
                        ticker = tick_interval(Instant::now() + period, period);
                    }
                }
            }
        }

        self.log_status();
        info!("pipeline stopped");
        self.stats
    }

    fn apply_config_changes(&mut self) {
        if !self.config.has_changed().unwrap_or(false) {
            return;
        }
        let tunables = self.config.borrow_and_update().clone();
        self.classifier
            .set_config(ClassifierConfig::from(&tunables));
        self.mood.set_config(MoodConfig::from(&tunables));
        debug!("tunables applied");
    }

    fn log_status(&self) {
        let status = self.dispatcher.registry().status();
        info!(
            uptime = ?self.stats.uptime(),
            ticks = self.stats.processed,
            skipped = self.stats.skipped,
            led_updates = self.stats.led_updates,
            errors = self.stats.errors,
            devices = status.connected,
            state = %self.classifier.state(),
            mood = self.mood.value(),
            "status"
        );
    }
}

fn tick_interval(start: Instant, period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

// ============================================================================
// Tests
// ============================================================================
