//! Historical backfill worker.
//!
//! Repairs one block window at a time in the background:
//!
//! ```text
//! Starting ──► Batching ──┬──► Completed
//!                         ├──► Superseded      (live path reached the batch)
//!                         └──► CircuitLimited  (window clamped, tail queued)
//! ```
//!
//! At most one run is active per process; the slot is an `AtomicBool` held
//! through a guard that releases it on every exit path, including panics.
//!
//! Work that cannot be done in the current run is never dropped. The clamped
//! tail and any gap reported while the worker is busy are kept as pending
//! spans on the range record, and the next gap cycle picks them up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use blockrelay_core::progress::ProgressTracker;
use blockrelay_core::types::{BlockSpan, HistoricalRange, IngestPhase};

use crate::processor::BlockProcessor;

/// Terminal state of a backfill run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// Every batch of the window was processed.
    Completed { start: u64, end: u64 },
    /// The live path reached `at_block` before this run did.
    Superseded { at_block: u64, realtime: u64 },
    /// The range exceeded the circuit breaker. `(processed_to, deferred_to]`
    /// was queued for a later run.
    CircuitLimited { processed_to: u64, deferred_to: u64 },
}

/// Pacing and limits for a [`BackfillWorker`].
#[derive(Debug, Clone, Copy)]
pub struct BackfillSettings {
    pub batch_size: u64,
    pub batch_delay: Duration,
    pub max_blocks: u64,
}

/// Releases the single backfill slot on drop.
struct RunGuard {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl RunGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: flag.clone(),
                armed: true,
            })
    }

    fn release(mut self) {
        self.flag.store(false, Ordering::Release);
        self.armed = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(false, Ordering::Release);
        }
    }
}

/// Single-slot historical backfill.
#[derive(Clone)]
pub struct BackfillWorker {
    processor: BlockProcessor,
    tracker: ProgressTracker,
    settings: BackfillSettings,
    running: Arc<AtomicBool>,
    /// Spans handed over while a run is active. The slot is only released
    /// with this lock held, so nothing queued here is missed.
    queued: Arc<Mutex<Vec<BlockSpan>>>,
}

impl BackfillWorker {
    pub fn new(processor: BlockProcessor, tracker: ProgressTracker, settings: BackfillSettings) -> Self {
        Self {
            processor,
            tracker,
            settings: BackfillSettings {
                batch_size: settings.batch_size.max(1),
                max_blocks: settings.max_blocks.max(1),
                ..settings
            },
            running: Arc::new(AtomicBool::new(false)),
            queued: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start a run on a tokio task. Returns `None` if a run is already active.
    pub fn try_spawn(&self, start: u64, end: u64) -> Option<JoinHandle<BackfillOutcome>> {
        self.try_spawn_with(start, end, Vec::new())
    }

    /// Like [`try_spawn`](Self::try_spawn), carrying `pending` spans that are
    /// persisted with the range and left for later runs.
    pub fn try_spawn_with(
        &self,
        start: u64,
        end: u64,
        pending: Vec<BlockSpan>,
    ) -> Option<JoinHandle<BackfillOutcome>> {
        let guard = RunGuard::acquire(&self.running)?;
        let worker = self.clone();
        Some(tokio::spawn(async move {
            worker.run_range(guard, start, end, pending).await
        }))
    }

    /// Run to completion on the current task. Returns `None` if a run is
    /// already active.
    pub async fn run(&self, start: u64, end: u64) -> Option<BackfillOutcome> {
        let guard = RunGuard::acquire(&self.running)?;
        Some(self.run_range(guard, start, end, Vec::new()).await)
    }

    /// Hand `span` to the active run. Returns `false` when no run is active,
    /// in which case the caller schedules it itself.
    pub async fn enqueue(&self, span: BlockSpan) -> bool {
        let mut queued = self.queued.lock().await;
        if !self.is_running() {
            return false;
        }
        tracing::info!(from = span.start, to = span.end, "gap queued behind running backfill");
        queued.push(span);
        true
    }

    async fn run_range(
        &self,
        guard: RunGuard,
        start: u64,
        requested_end: u64,
        mut pending: Vec<BlockSpan>,
    ) -> BackfillOutcome {
        let BackfillSettings {
            batch_size,
            batch_delay,
            max_blocks,
        } = self.settings;

        if requested_end < start {
            self.finish(guard, start, requested_end, pending).await;
            return BackfillOutcome::Completed {
                start,
                end: requested_end,
            };
        }

        // The live position when the run starts. Only progress made past a
        // batch after this point supersedes it.
        let realtime_at_start = self.read_realtime().await;

        let requested = requested_end.saturating_sub(start) + 1;
        let (end, deferred_to) = if requested > max_blocks {
            let clamped = start + max_blocks - 1;
            tracing::warn!(
                start,
                requested_end,
                clamped_end = clamped,
                max_blocks,
                "backfill range exceeds circuit breaker, clamping"
            );
            pending.insert(0, BlockSpan::new(clamped + 1, requested_end));
            (clamped, Some(requested_end))
        } else {
            (requested_end, None)
        };

        self.persist_range(HistoricalRange::processing(start, end).with_pending(pending.clone()))
            .await;
        tracing::info!(start, end, batch_size, pending = pending.len(), "backfill started");

        let mut batch_start = start;
        while batch_start <= end {
            let batch_end = batch_start.saturating_add(batch_size - 1).min(end);

            if let Some(realtime) = self.read_realtime().await {
                let behind_at_start = realtime_at_start.map_or(true, |r| r < batch_start);
                if behind_at_start && realtime >= batch_start {
                    tracing::info!(
                        batch_start,
                        realtime,
                        "live path reached backfill range, stopping"
                    );
                    self.finish(guard, start, end, pending).await;
                    return BackfillOutcome::Superseded {
                        at_block: batch_start,
                        realtime,
                    };
                }
            }

            let report = self
                .processor
                .process_range(batch_start, batch_end, IngestPhase::Backfill)
                .await;
            if !report.is_clean() {
                tracing::warn!(
                    batch_start,
                    batch_end,
                    failed_logs = report.failed,
                    failed_blocks = ?report.failed_blocks,
                    "backfill batch had failures"
                );
            }

            if let Err(e) = self.tracker.set_historical(batch_end).await {
                tracing::error!(batch_end, error = %e, "failed to persist historical marker");
            }
            tracing::info!(
                batch_start,
                batch_end,
                end,
                logs = report.logs,
                dispatched = report.dispatched,
                "backfill batch complete"
            );

            // Persist spans handed over mid-run so a restart keeps them.
            let handed_over: Vec<BlockSpan> = self.queued.lock().await.drain(..).collect();
            if !handed_over.is_empty() {
                pending.extend(handed_over);
                self.persist_range(
                    HistoricalRange::processing(start, end).with_pending(pending.clone()),
                )
                .await;
            }

            batch_start = batch_end + 1;
            if batch_start <= end && !batch_delay.is_zero() {
                tokio::time::sleep(batch_delay).await;
            }
        }

        self.finish(guard, start, end, pending).await;
        match deferred_to {
            Some(deferred_to) => {
                tracing::warn!(
                    processed_to = end,
                    deferred_from = end + 1,
                    deferred_to,
                    "backfill circuit-limited, remaining blocks queued for the next gap cycle"
                );
                BackfillOutcome::CircuitLimited {
                    processed_to: end,
                    deferred_to,
                }
            }
            None => {
                tracing::info!(start, end, "backfill complete");
                BackfillOutcome::Completed { start, end }
            }
        }
    }

    /// Close the run: collect late hand-overs, then either clear historical
    /// state or leave a `Done` record holding the pending spans. The slot is
    /// released before the queue lock is dropped.
    async fn finish(&self, guard: RunGuard, start: u64, end: u64, mut pending: Vec<BlockSpan>) {
        let mut queued = self.queued.lock().await;
        pending.extend(queued.drain(..));

        if pending.is_empty() {
            if let Err(e) = self.tracker.clear_historical().await {
                tracing::error!(error = %e, "failed to clear historical state");
            }
        } else {
            if let Err(e) = self.tracker.clear_historical_marker().await {
                tracing::error!(error = %e, "failed to clear historical marker");
            }
            tracing::info!(spans = pending.len(), "pending backfill spans left for the next gap cycle");
            self.persist_range(HistoricalRange::done(start, end, pending)).await;
        }

        guard.release();
        drop(queued);
    }

    async fn persist_range(&self, range: HistoricalRange) {
        let (start, end) = (range.start_block, range.end_block);
        if let Err(e) = self.tracker.save_historical_range(range).await {
            tracing::error!(start, end, error = %e, "failed to persist historical range");
        }
    }

    /// A failed read is logged and treated as "no marker".
    async fn read_realtime(&self) -> Option<u64> {
        match self.tracker.get_realtime().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "could not read real-time marker");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::LogFetcher;
    use crate::mock::{RecordingStore, ScriptedChain, StoreOp};
    use blockrelay_core::registry::HandlerRegistry;
    use blockrelay_core::report::TracingReporter;
    use blockrelay_core::progress::ProgressStore;
    use blockrelay_core::types::{LogFilter, RangeStatus, Track};

    fn worker(
        chain: Arc<ScriptedChain>,
        store: Arc<RecordingStore>,
        batch_size: u64,
        max_blocks: u64,
    ) -> BackfillWorker {
        let reporter = Arc::new(TracingReporter::new());
        let fetcher = LogFetcher::new(chain, LogFilter::default(), reporter.clone());
        let processor = BlockProcessor::new(
            fetcher,
            Arc::new(HandlerRegistry::from_config(1, &[])),
            reporter.clone(),
            1000,
            Duration::ZERO,
        );
        let tracker = ProgressTracker::with_reporter(Some(store), 1, reporter);
        BackfillWorker::new(
            processor,
            tracker,
            BackfillSettings {
                batch_size,
                batch_delay: Duration::from_millis(50),
                max_blocks,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn completes_in_batches_and_clears_state() {
        let chain = Arc::new(ScriptedChain::new(200));
        let store = Arc::new(RecordingStore::new());
        let w = worker(chain.clone(), store.clone(), 20, 50_000);

        let outcome = w.run(101, 149).await.unwrap();
        assert_eq!(outcome, BackfillOutcome::Completed { start: 101, end: 149 });
        assert_eq!(chain.calls(), vec![(101, 120), (121, 140), (141, 149)]);
        assert_eq!(
            store.ops(),
            vec![
                StoreOp::SaveRange(101, 149),
                StoreOp::SaveMarker(Track::Historical, 120),
                StoreOp::SaveMarker(Track::Historical, 140),
                StoreOp::SaveMarker(Track::Historical, 149),
                StoreOp::DeleteMarker(Track::Historical),
                StoreOp::DeleteRange,
            ]
        );
        assert!(!w.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn clamps_before_persisting() {
        let chain = Arc::new(ScriptedChain::new(200_000));
        let store = Arc::new(RecordingStore::new());
        let w = worker(chain, store.clone(), 10_000, 50_000);

        let outcome = w.run(1, 80_000).await.unwrap();
        assert_eq!(
            outcome,
            BackfillOutcome::CircuitLimited {
                processed_to: 50_000,
                deferred_to: 80_000
            }
        );
        assert_eq!(store.ops()[0], StoreOp::SaveRange(1, 50_000));
        assert!(!store
            .ops()
            .iter()
            .any(|op| matches!(op, StoreOp::SaveRange(s, e) if e - s + 1 > 50_000)));

        // the tail is kept for the next cycle, the marker is gone
        let range = store.load_range(1).await.unwrap().unwrap();
        assert_eq!(range.status, RangeStatus::Done);
        assert_eq!((range.start_block, range.end_block), (1, 50_000));
        assert_eq!(range.pending, vec![BlockSpan::new(50_001, 80_000)]);
        assert!(store.load_marker(1, Track::Historical).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn spans_handed_over_mid_run_are_kept() {
        let chain = Arc::new(ScriptedChain::new(1_000));
        let store = Arc::new(RecordingStore::new());
        let w = worker(chain, store.clone(), 10, 50_000);

        assert!(!w.enqueue(BlockSpan::new(500, 600)).await);

        let handle = w.try_spawn(1, 100).expect("slot free");
        assert!(w.enqueue(BlockSpan::new(500, 600)).await);
        assert!(w.enqueue(BlockSpan::new(700, 710)).await);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome, BackfillOutcome::Completed { start: 1, end: 100 });

        let range = store.load_range(1).await.unwrap().unwrap();
        assert_eq!(range.status, RangeStatus::Done);
        assert_eq!(
            range.pending,
            vec![BlockSpan::new(500, 600), BlockSpan::new(700, 710)]
        );
        assert!(!w.is_running());
        assert!(!w.enqueue(BlockSpan::new(800, 810)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn carried_spans_are_persisted_with_the_window() {
        let chain = Arc::new(ScriptedChain::new(1_000));
        let store = Arc::new(RecordingStore::new());
        let w = worker(chain.clone(), store.clone(), 50, 50_000);

        let handle = w
            .try_spawn_with(101, 149, vec![BlockSpan::new(161, 169)])
            .expect("slot free");
        handle.await.unwrap();

        assert_eq!(chain.calls(), vec![(101, 149)]);
        let range = store.load_range(1).await.unwrap().unwrap();
        assert_eq!((range.start_block, range.end_block), (101, 149));
        assert_eq!(range.pending, vec![BlockSpan::new(161, 169)]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_slot() {
        let chain = Arc::new(ScriptedChain::new(1_000));
        let store = Arc::new(RecordingStore::new());
        let w = worker(chain, store, 10, 50_000);

        let first = w.try_spawn(1, 100).expect("slot free");
        assert!(w.is_running());
        assert!(w.try_spawn(200, 300).is_none());
        assert!(w.run(200, 300).await.is_none());

        first.await.unwrap();
        assert!(!w.is_running());
        assert!(w.try_spawn(200, 210).is_some());
    }
}
