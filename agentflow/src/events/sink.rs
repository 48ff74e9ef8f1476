//! Progress sink trait and implementations.

use super::{ProgressEvent, ProgressStatus};
use crate::utils::panic_message;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};

/// Receiver of stage progress updates.
///
/// Implementations may fail; the pipeline logs the failure and keeps going.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Delivers an event.
    async fn emit(&self, event: ProgressEvent) -> anyhow::Result<()>;
}

/// Delivers an event, logging and discarding any sink error or panic.
pub async fn deliver(sink: &dyn ProgressSink, event: ProgressEvent) {
    let stage = event.stage.clone();
    let status = event.status;
    match AssertUnwindSafe(sink.emit(event)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(stage = %stage, status = %status, error = %e, "Progress sink failed"),
        Err(payload) => warn!(
            stage = %stage,
            status = %status,
            error = %panic_message(payload.as_ref()),
            "Progress sink panicked"
        ),
    }
}

/// A sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressSink;

#[async_trait]
impl ProgressSink for NoOpProgressSink {
    async fn emit(&self, _event: ProgressEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A sink that writes events to `tracing`.
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
    /// Creates a sink logging at the given level.
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
    async fn emit(&self, event: ProgressEvent) -> anyhow::Result<()> {
        if self.level == Level::DEBUG {
            debug!(
                stage = %event.stage,
                status = %event.status,
                percent = event.percent,
                attempt = event.attempt,
                "{}", event.message
            );
        } else if event.status == ProgressStatus::Failed {
            warn!(
                stage = %event.stage,
                status = %event.status,
                attempt = event.attempt,
                "{}", event.message
            );
        } else {
            info!(
                stage = %event.stage,
                status = %event.status,
                percent = event.percent,
                attempt = event.attempt,
                "{}", event.message
            );
        }
        Ok(())
    }
}

/// A sink that stores events in memory, for tests and replay.
#[derive(Debug, Default)]
pub struct CollectingProgressSink {
    events: parking_lot::RwLock<Vec<ProgressEvent>>,
}

impl CollectingProgressSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().clone()
    }

    /// Returns events for one stage, in emission order.
    #[must_use]
    pub fn events_for(&self, stage: &str) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage == stage)
            .cloned()
            .collect()
    }

    /// Returns the status sequence reported for one stage.
    #[must_use]
    pub fn statuses_for(&self, stage: &str) -> Vec<ProgressStatus> {
        self.events_for(stage).into_iter().map(|e| e.status).collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl ProgressSink for CollectingProgressSink {
    async fn emit(&self, event: ProgressEvent) -> anyhow::Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}

/// A sink that forwards events over an mpsc channel.
///
/// Suited to a presentation layer that pushes updates to clients. When the
/// receiver is gone, `emit` fails and the event is dropped.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelProgressSink {
    /// Wraps an existing sender.
    #[must_use]
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Creates a sink and its receiving end.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressSink for ChannelProgressSink {
    async fn emit(&self, event: ProgressEvent) -> anyhow::Result<()> {
        // Never block a stage on a slow consumer.
        self.tx
            .try_send(event)
            .map_err(|e| anyhow::anyhow!("progress channel unavailable: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(stage: &str, status: ProgressStatus) -> ProgressEvent {
        ProgressEvent::new(stage, status, format!("{stage} {status}"))
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        NoOpProgressSink.emit(event("a", ProgressStatus::Running)).await.unwrap();
        LoggingProgressSink::default()
            .emit(event("a", ProgressStatus::Failed))
            .await
            .unwrap();
        LoggingProgressSink::debug()
            .emit(event("a", ProgressStatus::Completed))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingProgressSink::new();
        assert!(sink.is_empty());

        sink.emit(event("coordinator", ProgressStatus::Running)).await.unwrap();
        sink.emit(event("web_research", ProgressStatus::Running)).await.unwrap();
        sink.emit(event("coordinator", ProgressStatus::Completed)).await.unwrap();

        assert_eq!(sink.len(), 3);
        assert_eq!(
            sink.statuses_for("coordinator"),
            vec![ProgressStatus::Running, ProgressStatus::Completed]
        );

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelProgressSink::channel(4);
        sink.emit(event("analyst", ProgressStatus::Running)).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.stage, "analyst");
    }

    #[tokio::test]
    async fn test_deliver_swallows_closed_channel() {
        let (sink, rx) = ChannelProgressSink::channel(1);
        drop(rx);

        assert!(sink.emit(event("a", ProgressStatus::Running)).await.is_err());
        deliver(&sink, event("a", ProgressStatus::Running)).await;
    }

    struct ExplodingSink;

    #[async_trait]
    impl ProgressSink for ExplodingSink {
        async fn emit(&self, _event: ProgressEvent) -> anyhow::Result<()> {
            panic!("sink exploded");
        }
    }

    #[tokio::test]
    async fn test_deliver_contains_sink_panic() {
        deliver(&ExplodingSink, event("a", ProgressStatus::Completed)).await;
    }
}
