//! blockrelay-storage: storage backends for progress markers and tracked addresses.
//!
//! Backends:
//! - [`memory`]: in-memory key/value (dev/testing, no persistence)
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)
//!
//! Both persist the same layout: one JSON record per key
//! (`{chain}:realtime`, `{chain}:historical`, `{chain}:historical_range`).

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
