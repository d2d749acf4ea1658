//! blockrelay-evm: EVM head source, log fetcher, gap detection and backfill.
//!
//! ```text
//! HeadSource ──► Ingestor ──► HeadDispatcher ──┬──► BlockProcessor (live)
//!                                              └──► BackfillWorker (tokio task)
//!                                                        └──► BlockProcessor (backfill)
//! ```

pub mod backfill;
pub mod builder;
pub mod dispatcher;
pub mod fetcher;
pub mod heads;
pub mod ingestor;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod processor;
pub mod rpc;

pub use backfill::{BackfillOutcome, BackfillSettings, BackfillWorker};
pub use builder::IngestorBuilder;
pub use dispatcher::{GapDetector, HeadDecision, HeadDispatcher};
pub use fetcher::{EvmRpcClient, LogFetcher};
pub use heads::{HeadSource, HeadStream, PollingHeadSource};
pub use ingestor::{Ingestor, ResumeState};
pub use processor::{BlockProcessor, BlockReport};
pub use rpc::HttpRpcClient;
