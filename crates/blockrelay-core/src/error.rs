//! Error types for the blockrelay ingestion pipeline.

use thiserror::Error;

/// Errors that can occur while ingesting blocks.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The store could not be opened at all.
    #[error("Progress store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Decode error in '{event}': {reason}")]
    Decode { event: String, reason: String },

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Head subscription failed: {0}")]
    Subscription(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl IngestError {
    /// Returns `true` if the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Storage(_))
    }

    /// Returns `true` if the error must stop the ingestor (the process is
    /// expected to exit and be restarted by its supervisor).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Subscription(_))
    }

    pub fn decode(event: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            event: event.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(IngestError::Rpc("timeout".into()).is_retryable());
        assert!(IngestError::Storage("connection reset".into()).is_retryable());
        assert!(!IngestError::StoreUnavailable("locked".into()).is_retryable());
        assert!(!IngestError::decode("Transfer", "bad topics").is_retryable());
    }

    #[test]
    fn only_subscription_is_fatal() {
        assert!(IngestError::Subscription("closed".into()).is_fatal());
        assert!(!IngestError::Rpc("x".into()).is_fatal());
    }
}
