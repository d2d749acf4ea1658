//! Downstream sinks for normalized events.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::decode::NormalizedEvent;
use crate::error::IngestError;

/// Destination for normalized events (a queue, a channel, a log stream).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: NormalizedEvent) -> Result<(), IngestError>;
}

/// Sends events into an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<NormalizedEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NormalizedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: NormalizedEvent) -> Result<(), IngestError> {
        self.tx
            .send(event)
            .map_err(|_| IngestError::Dispatch("event channel closed".into()))
    }
}

/// Emits one JSON line per event through `tracing` (target `blockrelay::events`).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn send(&self, event: NormalizedEvent) -> Result<(), IngestError> {
        let json = serde_json::to_string(&event)
            .map_err(|e| IngestError::Dispatch(format!("serialize event: {e}")))?;
        tracing::info!(target: "blockrelay::events", event_type = %event.event_type, "{json}");
        Ok(())
    }
}
