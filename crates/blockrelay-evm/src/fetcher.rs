//! EVM block and log fetcher.
//!
//! Range fetches use a single `eth_getLogs` call. When the node rejects the
//! range, the fetcher falls back to one call per block so a single bad block
//! cannot sink the whole batch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use blockrelay_core::error::IngestError;
use blockrelay_core::report::ErrorReporter;
use blockrelay_core::types::{LogFilter, RawLog};

/// Trait for fetching EVM data from a JSON-RPC provider.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn get_block_number(&self) -> Result<u64, IngestError>;
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLog>, IngestError>;
}

/// Logs of a block range plus the blocks that could not be fetched.
#[derive(Debug, Default)]
pub struct RangeLogs {
    pub logs: Vec<RawLog>,
    pub failed_blocks: Vec<u64>,
}

/// Wraps an [`EvmRpcClient`] with a fixed filter and the per-block fallback.
#[derive(Clone)]
pub struct LogFetcher {
    client: Arc<dyn EvmRpcClient>,
    filter: LogFilter,
    reporter: Arc<dyn ErrorReporter>,
}

impl LogFetcher {
    pub fn new(
        client: Arc<dyn EvmRpcClient>,
        filter: LogFilter,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            client,
            filter,
            reporter,
        }
    }

    /// Fetch the logs of a single block.
    pub async fn fetch_block(&self, number: u64) -> Result<Vec<RawLog>, IngestError> {
        let mut logs = self.client.get_logs(number, number, &self.filter).await?;
        sort_logs(&mut logs);
        Ok(logs)
    }

    /// Fetch all logs in `[start, end]`.
    ///
    /// Falls back to sequential per-block fetches if the range call fails.
    /// Blocks that still fail are logged, reported and listed in
    /// [`RangeLogs::failed_blocks`].
    pub async fn fetch_range(&self, start: u64, end: u64) -> RangeLogs {
        if end < start {
            return RangeLogs::default();
        }

        match self.client.get_logs(start, end, &self.filter).await {
            Ok(mut logs) => {
                sort_logs(&mut logs);
                RangeLogs {
                    logs,
                    failed_blocks: vec![],
                }
            }
            Err(e) => {
                tracing::warn!(start, end, error = %e, "range fetch failed, falling back to per-block");
                let mut out = RangeLogs::default();
                for block in start..=end {
                    match self.client.get_logs(block, block, &self.filter).await {
                        Ok(logs) => out.logs.extend(logs),
                        Err(e) => {
                            tracing::error!(block, error = %e, "block fetch failed, skipping");
                            self.reporter.capture(&e, "fetch_block");
                            out.failed_blocks.push(block);
                        }
                    }
                }
                sort_logs(&mut out.logs);
                out
            }
        }
    }
}

/// Order logs by `(block_number, log_index)`.
pub fn sort_logs(logs: &mut [RawLog]) {
    logs.sort_by_key(|l| (l.block_number_u64(), l.log_index_u32()));
}

/// Run `f` over `logs` in chunks of `chunk_size`, pausing between chunks so
/// other tasks get scheduled. A zero `pause` is a plain yield.
pub async fn for_each_chunk<'a, T, F, Fut>(
    logs: &'a [RawLog],
    chunk_size: usize,
    pause: Duration,
    mut f: F,
) -> Vec<T>
where
    F: FnMut(&'a [RawLog]) -> Fut,
    Fut: Future<Output = T>,
{
    let mut out = Vec::new();
    let mut chunks = logs.chunks(chunk_size.max(1)).peekable();
    while let Some(chunk) = chunks.next() {
        out.push(f(chunk).await);
        if chunks.peek().is_some() {
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(pause).await;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{log_at, ScriptedChain};
    use blockrelay_core::report::TracingReporter;

    fn fetcher(chain: Arc<ScriptedChain>, reporter: Arc<TracingReporter>) -> LogFetcher {
        LogFetcher::new(chain, LogFilter::default(), reporter)
    }

    #[tokio::test]
    async fn range_fetch_is_sorted() {
        let chain = Arc::new(ScriptedChain::new(20));
        chain.push_log(log_at(12, 1, "0xa", "0x01"));
        chain.push_log(log_at(11, 4, "0xa", "0x01"));
        chain.push_log(log_at(12, 0, "0xa", "0x01"));

        let out = fetcher(chain.clone(), Arc::new(TracingReporter::new()))
            .fetch_range(10, 12)
            .await;
        let order: Vec<_> = out
            .logs
            .iter()
            .map(|l| (l.block_number_u64(), l.log_index_u32()))
            .collect();
        assert_eq!(order, vec![(11, 4), (12, 0), (12, 1)]);
        assert_eq!(chain.calls(), vec![(10, 12)]);
    }

    #[tokio::test]
    async fn falls_back_per_block_and_skips_failures() {
        let chain = Arc::new(ScriptedChain::new(20));
        chain.push_log(log_at(10, 0, "0xa", "0x01"));
        chain.push_log(log_at(12, 0, "0xa", "0x01"));
        chain.fail_range_calls(true);
        chain.fail_block(11);
        let reporter = Arc::new(TracingReporter::new());

        let out = fetcher(chain.clone(), reporter.clone()).fetch_range(10, 12).await;
        assert_eq!(out.logs.len(), 2);
        assert_eq!(out.failed_blocks, vec![11]);
        assert_eq!(reporter.reported(), 1);
        assert_eq!(chain.calls(), vec![(10, 12), (10, 10), (11, 11), (12, 12)]);
    }

    #[tokio::test]
    async fn inverted_range_is_empty() {
        let chain = Arc::new(ScriptedChain::new(20));
        let out = fetcher(chain.clone(), Arc::new(TracingReporter::new()))
            .fetch_range(5, 4)
            .await;
        assert!(out.logs.is_empty());
        assert!(chain.calls().is_empty());
    }

    #[tokio::test]
    async fn chunks_cover_every_log_in_order() {
        let logs: Vec<RawLog> = (0..25).map(|i| log_at(1, i, "0xa", "0x01")).collect();
        let sizes = for_each_chunk(&logs, 10, Duration::ZERO, |chunk| async move { chunk.len() }).await;
        assert_eq!(sizes, vec![10, 10, 5]);
    }
}
