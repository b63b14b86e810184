//! Progress sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};

use crate::core::{ProgressEvent, StageName};

/// Receives stage transition events.
///
/// The orchestrator calls [`ProgressSink::emit`] once per transition. Sinks
/// must not fail the run: delivery problems are logged and swallowed.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Delivers one event.
    async fn emit(&self, event: ProgressEvent);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressSink;

#[async_trait]
impl ProgressSink for NoOpProgressSink {
    async fn emit(&self, _event: ProgressEvent) {}
}

/// A sink that logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingProgressSink {
    level: Level,
}

impl Default for LoggingProgressSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingProgressSink {
    /// Creates a sink logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl ProgressSink for LoggingProgressSink {
    async fn emit(&self, event: ProgressEvent) {
        if self.level == Level::DEBUG {
            debug!(
                run_id = %event.run_id,
                stage = %event.stage,
                state = ?event.state,
                data = ?event.data,
                "{}", event.event_type
            );
        } else {
            info!(
                run_id = %event.run_id,
                stage = %event.stage,
                state = ?event.state,
                data = ?event.data,
                "{}", event.event_type
            );
        }
    }
}

/// A sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingProgressSink {
    events: RwLock<Vec<ProgressEvent>>,
}

impl CollectingProgressSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().clone()
    }

    /// Number of events received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Event types received for `stage`, in order.
    #[must_use]
    pub fn types_for(&self, stage: StageName) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage == stage)
            .map(|e| e.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl ProgressSink for CollectingProgressSink {
    async fn emit(&self, event: ProgressEvent) {
        self.events.write().push(event);
    }
}

/// A sink forwarding events to a channel.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    /// Creates a sink and the receiver it feeds.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressSink for ChannelProgressSink {
    async fn emit(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            warn!("Progress receiver dropped; event discarded");
        }
    }
}
