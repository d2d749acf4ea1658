//! Fluent builder API for wiring an [`Ingestor`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use blockrelay_core::EngineConfig;
//! use blockrelay_evm::{HttpRpcClient, IngestorBuilder};
//!
//! # fn main() -> Result<(), blockrelay_core::IngestError> {
//! let client = HttpRpcClient::new("http://localhost:8545", Duration::from_secs(30))?;
//! let ingestor = IngestorBuilder::new(EngineConfig::for_chain(8453))
//!     .client(Arc::new(client))
//!     .max_backfill_blocks(10_000)
//!     .build()?;
//! # Ok(()) }
//! ```

use std::sync::Arc;
use std::time::Duration;

use blockrelay_core::config::EngineConfig;
use blockrelay_core::error::IngestError;
use blockrelay_core::progress::{MemoryProgressStore, ProgressStore, ProgressTracker};
use blockrelay_core::registry::HandlerRegistry;
use blockrelay_core::report::{ErrorReporter, TracingReporter};
use blockrelay_core::retry::RetryExecutor;

use crate::backfill::{BackfillSettings, BackfillWorker};
use crate::dispatcher::{GapDetector, HeadDispatcher};
use crate::fetcher::{EvmRpcClient, LogFetcher};
use crate::heads::{HeadSource, PollingHeadSource};
use crate::ingestor::Ingestor;
use crate::processor::BlockProcessor;

/// Fluent builder for [`Ingestor`].
pub struct IngestorBuilder {
    config: EngineConfig,
    client: Option<Arc<dyn EvmRpcClient>>,
    heads: Option<Arc<dyn HeadSource>>,
    store: Option<Arc<dyn ProgressStore>>,
    durable: bool,
    registry: Option<HandlerRegistry>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl IngestorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            client: None,
            heads: None,
            store: None,
            durable: false,
            registry: None,
            reporter: None,
        }
    }

    /// Set the chain RPC client (required).
    pub fn client(mut self, client: Arc<dyn EvmRpcClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the head source. Defaults to polling the client.
    pub fn heads(mut self, heads: Arc<dyn HeadSource>) -> Self {
        self.heads = Some(heads);
        self
    }

    /// Attach a durable progress store.
    pub fn store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.store = Some(store);
        self.durable = true;
        self
    }

    /// Keep progress in `store` for this process only. Gap detection and
    /// backfill work as usual but nothing is resumed after a restart. This is
    /// also the default, over a [`MemoryProgressStore`], when no store is set.
    pub fn volatile_store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.store = Some(store);
        self.durable = false;
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.chain.batch_size = size;
        self
    }

    pub fn historical_delay_ms(mut self, ms: u64) -> Self {
        self.config.chain.historical_delay_ms = ms;
        self
    }

    pub fn max_backfill_blocks(mut self, n: u64) -> Self {
        self.config.max_backfill_blocks = n;
        self
    }

    pub fn inline_fill_max_gap(mut self, n: u64) -> Self {
        self.config.inline_fill_max_gap = n;
        self
    }

    pub fn log_chunk_size(mut self, n: usize) -> Self {
        self.config.log_chunk_size = n;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn build(self) -> Result<Ingestor, IngestError> {
        self.config.validate()?;
        let config = self.config;
        let client = self
            .client
            .ok_or_else(|| IngestError::Config("an RPC client is required".into()))?;
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(TracingReporter::new()));
        let registry = Arc::new(
            self.registry
                .unwrap_or_else(|| HandlerRegistry::from_config(config.chain_id, &[])),
        );
        if registry.chain_id() != config.chain_id {
            return Err(IngestError::Config(format!(
                "registry built for chain {} but ingestor configured for chain {}",
                registry.chain_id(),
                config.chain_id
            )));
        }

        let retry = RetryExecutor::new(config.retry.clone(), reporter.clone());
        let tracker = match self.store {
            Some(store) if self.durable => ProgressTracker::new(Some(store), config.chain_id, retry),
            Some(store) => ProgressTracker::memory_only(store, config.chain_id, retry),
            None => ProgressTracker::memory_only(
                Arc::new(MemoryProgressStore::new()),
                config.chain_id,
                retry,
            ),
        };
        let fetcher = LogFetcher::new(client.clone(), registry.log_filter(), reporter.clone());
        let processor = BlockProcessor::new(
            fetcher,
            registry,
            reporter,
            config.log_chunk_size,
            Duration::from_millis(config.chunk_yield_ms),
        );
        let backfill = BackfillWorker::new(
            processor.clone(),
            tracker.clone(),
            BackfillSettings {
                batch_size: config.chain.batch_size,
                batch_delay: Duration::from_millis(config.chain.historical_delay_ms),
                max_blocks: config.max_backfill_blocks,
            },
        );
        let dispatcher = HeadDispatcher::new(
            GapDetector::new(config.inline_fill_max_gap),
            tracker.clone(),
            processor,
            backfill,
        );
        let heads = self.heads.unwrap_or_else(|| {
            Arc::new(PollingHeadSource::new(
                client,
                Duration::from_millis(config.chain.live_delay_ms),
            ))
        });

        Ok(Ingestor::new(dispatcher, heads, tracker))
    }
}
