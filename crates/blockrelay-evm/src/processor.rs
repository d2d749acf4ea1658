//! Fetch-and-dispatch for single blocks and block ranges.

use std::sync::Arc;
use std::time::Duration;

use blockrelay_core::error::IngestError;
use blockrelay_core::registry::{Dispatch, HandlerRegistry};
use blockrelay_core::report::ErrorReporter;
use blockrelay_core::types::{IngestPhase, RawLog};

use crate::fetcher::{for_each_chunk, LogFetcher};

/// What happened while processing a block or range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockReport {
    pub blocks: u64,
    pub logs: usize,
    pub dispatched: usize,
    pub excluded: usize,
    pub unmatched: usize,
    /// Logs whose handler returned an error.
    pub failed: usize,
    /// Blocks whose logs could not be fetched.
    pub failed_blocks: Vec<u64>,
}

impl BlockReport {
    fn merge(&mut self, other: BlockReport) {
        self.logs += other.logs;
        self.dispatched += other.dispatched;
        self.excluded += other.excluded;
        self.unmatched += other.unmatched;
        self.failed += other.failed;
        self.failed_blocks.extend(other.failed_blocks);
    }

    /// Returns `true` if every block was fetched and every log handled.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.failed_blocks.is_empty()
    }
}

/// Fetches logs and routes them through the [`HandlerRegistry`].
///
/// Never fails: fetch and handler errors are logged, reported and counted in
/// the returned [`BlockReport`].
#[derive(Clone)]
pub struct BlockProcessor {
    fetcher: LogFetcher,
    registry: Arc<HandlerRegistry>,
    reporter: Arc<dyn ErrorReporter>,
    chunk_size: usize,
    chunk_pause: Duration,
}

impl BlockProcessor {
    pub fn new(
        fetcher: LogFetcher,
        registry: Arc<HandlerRegistry>,
        reporter: Arc<dyn ErrorReporter>,
        chunk_size: usize,
        chunk_pause: Duration,
    ) -> Self {
        Self {
            fetcher,
            registry,
            reporter,
            chunk_size,
            chunk_pause,
        }
    }

    pub fn fetcher(&self) -> &LogFetcher {
        &self.fetcher
    }

    /// Fetch and dispatch the logs of block `number`.
    pub async fn process_block(&self, number: u64, phase: IngestPhase) -> BlockReport {
        let mut report = match self.fetcher.fetch_block(number).await {
            Ok(logs) => self.dispatch_logs(&logs, phase).await,
            Err(e) => {
                tracing::error!(block = number, %phase, error = %e, "failed to fetch block logs");
                self.reporter.capture(&e, "process_block");
                BlockReport {
                    failed_blocks: vec![number],
                    ..Default::default()
                }
            }
        };
        report.blocks = 1;
        tracing::debug!(
            block = number,
            %phase,
            logs = report.logs,
            dispatched = report.dispatched,
            "block processed"
        );
        report
    }

    /// Fetch and dispatch the logs of `[start, end]`, ascending.
    pub async fn process_range(&self, start: u64, end: u64, phase: IngestPhase) -> BlockReport {
        if end < start {
            return BlockReport::default();
        }
        let fetched = self.fetcher.fetch_range(start, end).await;
        let mut report = self.dispatch_logs(&fetched.logs, phase).await;
        report.blocks = end - start + 1;
        report.failed_blocks.extend(fetched.failed_blocks);
        report
    }

    /// Dispatch `logs` in chunks, yielding between chunks.
    pub async fn dispatch_logs(&self, logs: &[RawLog], phase: IngestPhase) -> BlockReport {
        let mut report = BlockReport::default();
        let chunks = for_each_chunk(logs, self.chunk_size, self.chunk_pause, |chunk| {
            self.dispatch_chunk(chunk, phase)
        })
        .await;
        for chunk in chunks {
            report.merge(chunk);
        }
        report
    }

    async fn dispatch_chunk(&self, logs: &[RawLog], phase: IngestPhase) -> BlockReport {
        let mut report = BlockReport {
            logs: logs.len(),
            ..Default::default()
        };
        for log in logs {
            match self.registry.dispatch(log, phase).await {
                Ok(Dispatch::Specific | Dispatch::TrackedTransfer) => report.dispatched += 1,
                Ok(Dispatch::Excluded) => report.excluded += 1,
                Ok(Dispatch::Unmatched | Dispatch::Removed) => report.unmatched += 1,
                Err(e) => {
                    report.failed += 1;
                    self.report_log_failure(log, phase, &e);
                }
            }
        }
        report
    }

    fn report_log_failure(&self, log: &RawLog, phase: IngestPhase, error: &IngestError) {
        tracing::error!(
            block = log.block_number_u64(),
            log_index = log.log_index_u32(),
            tx = %log.tx_hash,
            %phase,
            error = %error,
            "log dispatch failed, skipping"
        );
        self.reporter.capture(error, "dispatch_log");
    }
}
