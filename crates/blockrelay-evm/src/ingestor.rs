//! The ingestion loop: one head stream driving the [`HeadDispatcher`].
//!
//! Heads are handled sequentially in arrival order; each head is fully
//! processed before the next one is polled. Backfills run beside the loop on
//! their own task. The loop ends only when the head stream fails or closes,
//! which is returned as [`IngestError::Subscription`].

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;

use blockrelay_core::error::IngestError;
use blockrelay_core::progress::ProgressTracker;
use blockrelay_core::types::HistoricalRange;

use crate::dispatcher::{HeadDecision, HeadDispatcher};
use crate::heads::HeadSource;

/// Snapshot of stored progress. Logged when ingestion starts and printed by
/// the CLI `status` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeState {
    pub realtime: Option<u64>,
    pub historical: Option<u64>,
    #[serde(rename = "historicalRange")]
    pub range: Option<HistoricalRange>,
}

impl ResumeState {
    pub async fn load(tracker: &ProgressTracker) -> Result<Self, IngestError> {
        Ok(Self {
            realtime: tracker.get_realtime().await?,
            historical: tracker.get_historical().await?,
            range: tracker.get_historical_range().await?,
        })
    }
}

pub struct Ingestor {
    dispatcher: HeadDispatcher,
    heads: Arc<dyn HeadSource>,
    tracker: ProgressTracker,
}

impl Ingestor {
    pub fn new(dispatcher: HeadDispatcher, heads: Arc<dyn HeadSource>, tracker: ProgressTracker) -> Self {
        Self {
            dispatcher,
            heads,
            tracker,
        }
    }

    pub fn dispatcher(&self) -> &HeadDispatcher {
        &self.dispatcher
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Handle one head outside the stream.
    pub async fn handle_head(&self, head: u64) -> HeadDecision {
        self.dispatcher.on_new_head(head).await
    }

    /// Consume the head stream until it errors or ends.
    pub async fn run(&self) -> Result<(), IngestError> {
        match ResumeState::load(&self.tracker).await {
            Ok(state) => tracing::info!(
                chain_id = self.tracker.chain_id(),
                persistent = self.tracker.is_persistent(),
                realtime = ?state.realtime,
                historical = ?state.historical,
                range = ?state.range.as_ref().map(|r| (r.start_block, r.end_block)),
                pending_spans = state.range.as_ref().map_or(0, |r| r.pending.len()),
                "starting ingestion"
            ),
            Err(e) => tracing::warn!(error = %e, "could not load resume state"),
        }

        let mut heads = self
            .heads
            .subscribe_new_heads()
            .await
            .map_err(into_subscription)?;

        while let Some(item) = heads.next().await {
            match item {
                Ok(head) => {
                    let decision = self.dispatcher.on_new_head(head).await;
                    tracing::trace!(head, ?decision, "head handled");
                }
                Err(e) => {
                    tracing::error!(error = %e, "head subscription failed");
                    return Err(into_subscription(e));
                }
            }
        }

        tracing::error!("head stream ended");
        Err(IngestError::Subscription("head stream ended".into()))
    }
}

fn into_subscription(e: IngestError) -> IngestError {
    match e {
        IngestError::Subscription(_) => e,
        other => IngestError::Subscription(other.to_string()),
    }
}
