//! Progress tracking: persists how far each producer has ingested.
//!
//! Three records exist per chain: the real-time marker, the historical marker
//! and the in-flight historical range. [`ProgressTracker`] is the only way the
//! engine touches them; it routes every call through the [`RetryExecutor`] and
//! keeps going without resumability when no durable store is attached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::IngestError;
use crate::report::ErrorReporter;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::types::{HistoricalRange, ProgressMarker, Track};

/// Trait for durable progress storage.
///
/// Implementations include [`MemoryProgressStore`] and the backends in
/// `blockrelay-storage` (in-memory key/value and SQLite). No operation may
/// assume a transaction spanning several records.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Load the marker of `track` for a chain.
    async fn load_marker(
        &self,
        chain_id: u32,
        track: Track,
    ) -> Result<Option<ProgressMarker>, IngestError>;

    /// Save (upsert) a marker.
    async fn save_marker(&self, marker: ProgressMarker) -> Result<(), IngestError>;

    /// Delete a marker. Deleting a missing marker is not an error.
    async fn delete_marker(&self, chain_id: u32, track: Track) -> Result<(), IngestError>;

    /// Load the in-flight historical range for a chain.
    async fn load_range(&self, chain_id: u32) -> Result<Option<HistoricalRange>, IngestError>;

    /// Save (upsert) the historical range for a chain.
    async fn save_range(&self, chain_id: u32, range: HistoricalRange) -> Result<(), IngestError>;

    /// Delete the historical range. Deleting a missing range is not an error.
    async fn delete_range(&self, chain_id: u32) -> Result<(), IngestError>;
}

/// Reads and writes progress for one chain.
///
/// Without a store every read returns `None` and every write returns
/// `Ok(false)` ("not persisted"). A memory-only tracker keeps progress in
/// process so gap detection still works, but also reports writes as not
/// persisted: ingestion continues without being resumable across restarts.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Option<Arc<dyn ProgressStore>>,
    persistent: bool,
    chain_id: u32,
    retry: RetryExecutor,
}

impl ProgressTracker {
    pub fn new(
        store: Option<Arc<dyn ProgressStore>>,
        chain_id: u32,
        retry: RetryExecutor,
    ) -> Self {
        if store.is_none() {
            tracing::warn!(chain_id, "no progress store attached, running without resumability");
        }
        Self {
            persistent: store.is_some(),
            store,
            chain_id,
            retry,
        }
    }

    /// Track progress in `volatile`, a store that does not outlive the process.
    pub fn memory_only(volatile: Arc<dyn ProgressStore>, chain_id: u32, retry: RetryExecutor) -> Self {
        tracing::warn!(chain_id, "progress kept in memory only, restarts will not resume");
        Self {
            store: Some(volatile),
            persistent: false,
            chain_id,
            retry,
        }
    }

    /// Convenience constructor with the default retry policy.
    pub fn with_reporter(
        store: Option<Arc<dyn ProgressStore>>,
        chain_id: u32,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self::new(store, chain_id, RetryExecutor::new(RetryPolicy::default(), reporter))
    }

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }

    /// Returns `true` if writes survive a restart.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub async fn get_realtime(&self) -> Result<Option<u64>, IngestError> {
        self.get_marker(Track::RealTime).await
    }

    /// Record `block` as the last block processed by the live path.
    pub async fn set_realtime(&self, block: u64) -> Result<bool, IngestError> {
        self.set_marker(Track::RealTime, block).await
    }

    pub async fn get_historical(&self) -> Result<Option<u64>, IngestError> {
        self.get_marker(Track::Historical).await
    }

    /// Record `block` as the end of the last completed backfill batch.
    pub async fn set_historical(&self, block: u64) -> Result<bool, IngestError> {
        self.set_marker(Track::Historical, block).await
    }

    pub async fn get_historical_range(&self) -> Result<Option<HistoricalRange>, IngestError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let chain_id = self.chain_id;
        self.retry
            .run("load_range", || store.load_range(chain_id))
            .await
    }

    /// Persist `[start, end]` as the range being backfilled.
    pub async fn set_historical_range(&self, start: u64, end: u64) -> Result<bool, IngestError> {
        self.save_historical_range(HistoricalRange::processing(start, end))
            .await
    }

    /// Persist a full range record, including its queued spans.
    pub async fn save_historical_range(&self, range: HistoricalRange) -> Result<bool, IngestError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let chain_id = self.chain_id;
        let (start, end, pending) = (range.start_block, range.end_block, range.pending.len());
        self.retry
            .run("save_range", || store.save_range(chain_id, range.clone()))
            .await?;
        tracing::debug!(chain_id, start, end, pending, status = ?range.status, "historical range saved");
        Ok(self.persistent)
    }

    /// Remove the historical marker and the historical range.
    ///
    /// Both deletes are attempted even if the first one fails; the first error
    /// is returned.
    pub async fn clear_historical(&self) -> Result<bool, IngestError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let chain_id = self.chain_id;
        let marker = self.clear_historical_marker().await;
        let range = self
            .retry
            .run("delete_range", || store.delete_range(chain_id))
            .await;
        marker?;
        range?;
        tracing::debug!(chain_id, "historical state cleared");
        Ok(self.persistent)
    }

    /// Remove only the historical marker.
    pub async fn clear_historical_marker(&self) -> Result<bool, IngestError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let chain_id = self.chain_id;
        self.retry
            .run("delete_historical", || store.delete_marker(chain_id, Track::Historical))
            .await?;
        Ok(self.persistent)
    }

    async fn get_marker(&self, track: Track) -> Result<Option<u64>, IngestError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let chain_id = self.chain_id;
        let marker = self
            .retry
            .run("load_marker", || store.load_marker(chain_id, track))
            .await?;
        Ok(marker.map(|m| m.block_number))
    }

    async fn set_marker(&self, track: Track, block: u64) -> Result<bool, IngestError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let chain_id = self.chain_id;
        self.retry
            .run("save_marker", || {
                store.save_marker(ProgressMarker::new(chain_id, track, block))
            })
            .await?;
        tracing::trace!(chain_id, %track, block, "progress marker saved");
        Ok(self.persistent)
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory progress store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryProgressStore {
    markers: Mutex<HashMap<(u32, Track), ProgressMarker>>,
    ranges: Mutex<HashMap<u32, HistoricalRange>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn load_marker(
        &self,
        chain_id: u32,
        track: Track,
    ) -> Result<Option<ProgressMarker>, IngestError> {
        Ok(self.markers.lock().unwrap().get(&(chain_id, track)).cloned())
    }

    async fn save_marker(&self, marker: ProgressMarker) -> Result<(), IngestError> {
        self.markers
            .lock()
            .unwrap()
            .insert((marker.chain_id, marker.track), marker);
        Ok(())
    }

    async fn delete_marker(&self, chain_id: u32, track: Track) -> Result<(), IngestError> {
        self.markers.lock().unwrap().remove(&(chain_id, track));
        Ok(())
    }

    async fn load_range(&self, chain_id: u32) -> Result<Option<HistoricalRange>, IngestError> {
        Ok(self.ranges.lock().unwrap().get(&chain_id).cloned())
    }

    async fn save_range(&self, chain_id: u32, range: HistoricalRange) -> Result<(), IngestError> {
        self.ranges.lock().unwrap().insert(chain_id, range);
        Ok(())
    }

    async fn delete_range(&self, chain_id: u32) -> Result<(), IngestError> {
        self.ranges.lock().unwrap().remove(&chain_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::TracingReporter;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tracker(store: Option<Arc<dyn ProgressStore>>) -> ProgressTracker {
        ProgressTracker::with_reporter(store, 8453, Arc::new(TracingReporter::new()))
    }

    #[tokio::test]
    async fn realtime_roundtrip_and_idempotence() {
        let t = tracker(Some(Arc::new(MemoryProgressStore::new())));
        assert!(t.get_realtime().await.unwrap().is_none());

        assert!(t.set_realtime(100).await.unwrap());
        assert!(t.set_realtime(100).await.unwrap());
        assert_eq!(t.get_realtime().await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn markers_are_independent() {
        let t = tracker(Some(Arc::new(MemoryProgressStore::new())));
        t.set_realtime(150).await.unwrap();
        t.set_historical(120).await.unwrap();
        assert_eq!(t.get_realtime().await.unwrap(), Some(150));
        assert_eq!(t.get_historical().await.unwrap(), Some(120));
    }

    #[tokio::test]
    async fn clear_historical_removes_marker_and_range() {
        let t = tracker(Some(Arc::new(MemoryProgressStore::new())));
        t.set_realtime(150).await.unwrap();
        t.set_historical(120).await.unwrap();
        t.set_historical_range(101, 149).await.unwrap();

        let range = t.get_historical_range().await.unwrap().unwrap();
        assert_eq!((range.start_block, range.end_block), (101, 149));

        assert!(t.clear_historical().await.unwrap());
        assert!(t.get_historical().await.unwrap().is_none());
        assert!(t.get_historical_range().await.unwrap().is_none());
        // real-time marker is untouched
        assert_eq!(t.get_realtime().await.unwrap(), Some(150));
    }

    #[tokio::test]
    async fn degraded_mode_never_errors() {
        let t = tracker(None);
        assert!(!t.is_persistent());
        assert!(!t.set_realtime(1).await.unwrap());
        assert!(!t.set_historical_range(1, 2).await.unwrap());
        assert!(!t.clear_historical().await.unwrap());
        assert!(t.get_realtime().await.unwrap().is_none());
        assert!(t.get_historical_range().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_only_keeps_progress_but_reports_not_persisted() {
        let t = ProgressTracker::memory_only(
            Arc::new(MemoryProgressStore::new()),
            8453,
            RetryExecutor::new(RetryPolicy::default(), Arc::new(TracingReporter::new())),
        );
        assert!(!t.is_persistent());
        assert!(!t.set_realtime(100).await.unwrap());
        assert_eq!(t.get_realtime().await.unwrap(), Some(100));

        t.save_historical_range(HistoricalRange::processing(101, 120))
            .await
            .unwrap();
        t.set_historical(110).await.unwrap();
        assert!(!t.clear_historical_marker().await.unwrap());
        assert!(t.get_historical().await.unwrap().is_none());
        assert!(t.get_historical_range().await.unwrap().is_some());
    }

    /// Fails the first `failures` marker writes with a transient error.
    struct FlakyStore {
        inner: MemoryProgressStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ProgressStore for FlakyStore {
        async fn load_marker(
            &self,
            chain_id: u32,
            track: Track,
        ) -> Result<Option<ProgressMarker>, IngestError> {
            self.inner.load_marker(chain_id, track).await
        }
        async fn save_marker(&self, marker: ProgressMarker) -> Result<(), IngestError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(IngestError::Storage("connection reset".into()));
            }
            self.inner.save_marker(marker).await
        }
        async fn delete_marker(&self, chain_id: u32, track: Track) -> Result<(), IngestError> {
            self.inner.delete_marker(chain_id, track).await
        }
        async fn load_range(&self, chain_id: u32) -> Result<Option<HistoricalRange>, IngestError> {
            self.inner.load_range(chain_id).await
        }
        async fn save_range(&self, chain_id: u32, range: HistoricalRange) -> Result<(), IngestError> {
            self.inner.save_range(chain_id, range).await
        }
        async fn delete_range(&self, chain_id: u32) -> Result<(), IngestError> {
            self.inner.delete_range(chain_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_write_failures_are_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryProgressStore::new(),
            failures: AtomicU32::new(2),
        });
        let t = tracker(Some(store));
        assert!(t.set_realtime(7).await.unwrap());
        assert_eq!(t.get_realtime().await.unwrap(), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_write_surfaces_error() {
        let store = Arc::new(FlakyStore {
            inner: MemoryProgressStore::new(),
            failures: AtomicU32::new(5),
        });
        let reporter = Arc::new(TracingReporter::new());
        let t = ProgressTracker::with_reporter(Some(store), 1, reporter.clone());
        assert!(t.set_realtime(7).await.is_err());
        assert_eq!(reporter.reported(), 1);
        assert!(t.get_realtime().await.unwrap().is_none());
    }
}
