//! Error reporting seam.
//!
//! Every failure the engine decides to survive (store retries exhausted, a
//! poison block, a sink rejecting an event) is handed to an [`ErrorReporter`]
//! in addition to being logged. Reporting is best-effort and must never block.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::IngestError;

/// Sink for errors that are logged and survived.
pub trait ErrorReporter: Send + Sync {
    /// Record an error. `context` names the operation that failed.
    fn capture(&self, error: &IngestError, context: &str);
}

/// Default reporter: emits an `error` event through `tracing` and counts reports.
#[derive(Debug, Default)]
pub struct TracingReporter {
    reported: AtomicU64,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of errors captured so far.
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}

impl ErrorReporter for TracingReporter {
    fn capture(&self, error: &IngestError, context: &str) {
        self.reported.fetch_add(1, Ordering::Relaxed);
        tracing::error!(context, error = %error, "captured error");
    }
}
