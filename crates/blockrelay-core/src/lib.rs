//! blockrelay-core: foundation for the restart-safe block ingestion engine.
//!
//! # Architecture
//!
//! ```text
//! Ingestor (blockrelay-evm)
//!     ├── ProgressTracker   (real-time / historical markers, historical range)
//!     │       └── RetryExecutor → ProgressStore (memory / SQLite)
//!     ├── HandlerRegistry   (topic-address → LogHandler, tracked transfer fallback)
//!     │       └── ForwardingHandler → LogDecoder → EventSink
//!     └── ErrorReporter     (survived failures)
//! ```

pub mod config;
pub mod decode;
pub mod error;
pub mod handler;
pub mod progress;
pub mod registry;
pub mod report;
pub mod retry;
pub mod sink;
pub mod tracked;
pub mod types;

pub use config::{ChainSettings, ContractConfig, EngineConfig, EventConfig};
pub use decode::{EventPayload, LogDecoder, NormalizedEvent, StandardDecoder, TRANSFER_TOPIC};
pub use error::IngestError;
pub use handler::{ForwardingHandler, LogContext, LogHandler};
pub use progress::{MemoryProgressStore, ProgressStore, ProgressTracker};
pub use registry::{Dispatch, HandlerRegistry};
pub use report::{ErrorReporter, TracingReporter};
pub use retry::{RetryExecutor, RetryPolicy};
pub use sink::{ChannelSink, EventSink, LogSink};
pub use tracked::{CachedTrackedAddresses, StaticTrackedAddresses, TrackedAddressSource, TrackedAddressStore};
pub use types::{BlockSpan, HistoricalRange, IngestPhase, LogFilter, ProgressMarker, RawLog, Track};
