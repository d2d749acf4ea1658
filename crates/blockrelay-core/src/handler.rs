//! Log handler trait and the standard decode-and-forward handler.

use std::sync::Arc;

use async_trait::async_trait;

use crate::decode::{LogDecoder, NormalizedEvent};
use crate::error::IngestError;
use crate::report::ErrorReporter;
use crate::sink::EventSink;
use crate::types::{IngestPhase, RawLog};

/// Context passed to a handler alongside each log.
#[derive(Debug, Clone, Copy)]
pub struct LogContext<'a> {
    pub chain_id: u32,
    pub phase: IngestPhase,
    /// Event name configured for the matching registry entry (e.g. `"Transfer"`).
    pub event_name: &'a str,
}

/// Trait for per-event handlers registered in the
/// [`HandlerRegistry`](crate::registry::HandlerRegistry).
///
/// Handlers decode, transform and forward. They must not touch ingestion
/// progress.
#[async_trait]
pub trait LogHandler: Send + Sync {
    /// Called once for each log routed to this handler.
    async fn handle(&self, log: &RawLog, ctx: &LogContext<'_>) -> Result<(), IngestError>;

    /// Short name used in logs and error reports.
    fn name(&self) -> &str;
}

/// Decodes a log, normalizes it and sends it to an [`EventSink`].
///
/// Decode failures are returned to the caller. Sink failures are logged and
/// reported but not retried, so a rejected event is dropped.
pub struct ForwardingHandler {
    name: String,
    decoder: Arc<dyn LogDecoder>,
    sink: Arc<dyn EventSink>,
    reporter: Arc<dyn ErrorReporter>,
}

impl ForwardingHandler {
    pub fn new(
        name: impl Into<String>,
        decoder: Arc<dyn LogDecoder>,
        sink: Arc<dyn EventSink>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            name: name.into(),
            decoder,
            sink,
            reporter,
        }
    }
}

#[async_trait]
impl LogHandler for ForwardingHandler {
    async fn handle(&self, log: &RawLog, ctx: &LogContext<'_>) -> Result<(), IngestError> {
        let payload = self.decoder.decode(log, ctx.event_name)?;
        let event = NormalizedEvent::from_log(log, ctx.chain_id, ctx.event_name, payload);
        let (block, log_index) = (event.block_number, event.log_index);

        if let Err(e) = self.sink.send(event).await {
            tracing::warn!(
                handler = %self.name,
                block,
                log_index,
                error = %e,
                "sink rejected event, dropping"
            );
            self.reporter.capture(&e, &self.name);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
