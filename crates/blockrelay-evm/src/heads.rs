//! Chain head notifications.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream};

use blockrelay_core::error::IngestError;

use crate::fetcher::EvmRpcClient;

/// Stream of new head block numbers. An `Err` item ends ingestion.
pub type HeadStream = Pin<Box<dyn Stream<Item = Result<u64, IngestError>> + Send>>;

/// Source of new chain heads.
#[async_trait]
pub trait HeadSource: Send + Sync {
    async fn subscribe_new_heads(&self) -> Result<HeadStream, IngestError>;
}

/// Polls `eth_blockNumber` and emits each head greater than the last one seen.
///
/// Intermediate numbers are not synthesized: a jump from 100 to 150 is
/// emitted as 150 and left to gap detection. Transient poll errors are
/// tolerated until `max_consecutive_errors` in a row, which ends the stream
/// with [`IngestError::Subscription`].
pub struct PollingHeadSource {
    client: Arc<dyn EvmRpcClient>,
    interval: Duration,
    max_consecutive_errors: u32,
}

impl PollingHeadSource {
    pub fn new(client: Arc<dyn EvmRpcClient>, interval: Duration) -> Self {
        Self {
            client,
            interval,
            max_consecutive_errors: 5,
        }
    }

    pub fn max_consecutive_errors(mut self, n: u32) -> Self {
        self.max_consecutive_errors = n.max(1);
        self
    }
}

struct PollState {
    client: Arc<dyn EvmRpcClient>,
    interval: Duration,
    max_errors: u32,
    last: Option<u64>,
    errors: u32,
    first: bool,
    done: bool,
}

#[async_trait]
impl HeadSource for PollingHeadSource {
    async fn subscribe_new_heads(&self) -> Result<HeadStream, IngestError> {
        let state = PollState {
            client: self.client.clone(),
            interval: self.interval,
            max_errors: self.max_consecutive_errors,
            last: None,
            errors: 0,
            first: true,
            done: false,
        };

        let heads = stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                if !st.first {
                    tokio::time::sleep(st.interval).await;
                }
                st.first = false;

                match st.client.get_block_number().await {
                    Ok(n) if st.last.map_or(true, |last| n > last) => {
                        st.errors = 0;
                        st.last = Some(n);
                        return Some((Ok(n), st));
                    }
                    Ok(_) => st.errors = 0,
                    Err(e) => {
                        st.errors += 1;
                        tracing::warn!(attempt = st.errors, error = %e, "head poll failed");
                        if st.errors >= st.max_errors {
                            st.done = true;
                            let err = IngestError::Subscription(format!(
                                "{} consecutive head poll failures: {e}",
                                st.errors
                            ));
                            return Some((Err(err), st));
                        }
                    }
                }
            }
        });

        Ok(Box::pin(heads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedChain;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn emits_only_new_heads() {
        let chain = Arc::new(ScriptedChain::new(100));
        let source = PollingHeadSource::new(chain.clone(), Duration::from_millis(150));
        let mut heads = source.subscribe_new_heads().await.unwrap();

        assert_eq!(heads.next().await.unwrap().unwrap(), 100);

        let driver = {
            let chain = chain.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                chain.set_head(150);
            })
        };
        assert_eq!(heads.next().await.unwrap().unwrap(), 150);
        driver.await.unwrap();
    }

    struct DownChain;

    #[async_trait]
    impl EvmRpcClient for DownChain {
        async fn get_block_number(&self) -> Result<u64, IngestError> {
            Err(IngestError::Rpc("connection refused".into()))
        }
        async fn get_logs(
            &self,
            _from: u64,
            _to: u64,
            _filter: &blockrelay_core::types::LogFilter,
        ) -> Result<Vec<blockrelay_core::types::RawLog>, IngestError> {
            Err(IngestError::Rpc("connection refused".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_end_the_stream() {
        let source = PollingHeadSource::new(Arc::new(DownChain), Duration::from_millis(10))
            .max_consecutive_errors(3);
        let mut heads = source.subscribe_new_heads().await.unwrap();

        let err = heads.next().await.unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert!(heads.next().await.is_none());
    }
}
