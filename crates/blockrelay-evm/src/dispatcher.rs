//! Gap detection and per-head dispatch.
//!
//! For every head `n` the real-time marker `R` decides what happens:
//!
//! | state                      | action                                          |
//! |----------------------------|-------------------------------------------------|
//! | no `R`                     | process `n`                                     |
//! | `n <= R`                   | skip (stale or duplicate head)                  |
//! | `n == R + 1`               | process `n`                                     |
//! | gap `<= inline_fill_max`   | process `R+1 ..= n-1` inline, then `n`          |
//! | larger gap                 | process `n`, then start, resume or queue a backfill |
//!
//! A gap found while the worker is busy is queued behind the active run and
//! stored with the range record, so no block range is forgotten.

use blockrelay_core::progress::ProgressTracker;
use blockrelay_core::types::{BlockSpan, IngestPhase, RangeStatus};

use crate::backfill::BackfillWorker;
use crate::processor::BlockProcessor;

/// Classification of a new head against the real-time marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadDecision {
    /// No marker yet.
    FirstBlock,
    /// `n == R + 1`.
    Contiguous,
    /// Small gap `[from, to]` filled by the live path.
    InlineFill { from: u64, to: u64 },
    /// Gap `[from, to]` left to the backfill worker.
    Gap { from: u64, to: u64, size: u64 },
    /// `n <= R`.
    Stale { realtime: u64 },
}

/// Pure classifier: no I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct GapDetector {
    inline_fill_max_gap: u64,
}

impl GapDetector {
    pub fn new(inline_fill_max_gap: u64) -> Self {
        Self { inline_fill_max_gap }
    }

    pub fn classify(&self, realtime: Option<u64>, head: u64) -> HeadDecision {
        let Some(r) = realtime else {
            return HeadDecision::FirstBlock;
        };
        if head <= r {
            return HeadDecision::Stale { realtime: r };
        }
        let gap = head - r - 1;
        if gap == 0 {
            HeadDecision::Contiguous
        } else if gap <= self.inline_fill_max_gap {
            HeadDecision::InlineFill {
                from: r + 1,
                to: head - 1,
            }
        } else {
            HeadDecision::Gap {
                from: r + 1,
                to: head - 1,
                size: gap,
            }
        }
    }
}

/// Acts on each head: direct processing, inline fill, backfill launch.
#[derive(Clone)]
pub struct HeadDispatcher {
    detector: GapDetector,
    tracker: ProgressTracker,
    processor: BlockProcessor,
    backfill: BackfillWorker,
}

impl HeadDispatcher {
    pub fn new(
        detector: GapDetector,
        tracker: ProgressTracker,
        processor: BlockProcessor,
        backfill: BackfillWorker,
    ) -> Self {
        Self {
            detector,
            tracker,
            processor,
            backfill,
        }
    }

    pub fn backfill(&self) -> &BackfillWorker {
        &self.backfill
    }

    /// Handle head `n`. Never fails: store and processing errors are logged
    /// and the engine moves on.
    pub async fn on_new_head(&self, head: u64) -> HeadDecision {
        let realtime = match self.tracker.get_realtime().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(head, error = %e, "could not read real-time marker, treating as absent");
                None
            }
        };

        let decision = self.detector.classify(realtime, head);
        match decision {
            HeadDecision::Stale { realtime } => {
                tracing::debug!(head, realtime, "stale head, skipping");
            }
            HeadDecision::FirstBlock | HeadDecision::Contiguous => {
                self.process_live(head).await;
            }
            HeadDecision::InlineFill { from, to } => {
                tracing::info!(head, from, to, "small gap, filling inline");
                let report = self.processor.process_range(from, to, IngestPhase::Live).await;
                if !report.is_clean() {
                    tracing::warn!(from, to, failed_blocks = ?report.failed_blocks, "inline fill had failures");
                }
                self.process_live(head).await;
            }
            HeadDecision::Gap { from, to, size } => {
                tracing::info!(head, gap = size, from, to, "gap detected");
                self.process_live(head).await;
                self.schedule_backfill(from, to).await;
            }
        }
        decision
    }

    /// Process `head` on the live path and advance the real-time marker.
    ///
    /// A block whose fetch or handlers failed still advances the marker.
    async fn process_live(&self, head: u64) {
        let report = self.processor.process_block(head, IngestPhase::Live).await;
        if !report.is_clean() {
            tracing::warn!(
                block = head,
                failed_logs = report.failed,
                "block processed with failures, advancing anyway"
            );
        }
        if let Err(e) = self.tracker.set_realtime(head).await {
            tracing::error!(block = head, error = %e, "failed to persist real-time marker");
        }
    }

    /// Hand the gap `[from, to]` to the backfill worker.
    ///
    /// A running worker queues it. Otherwise an unfinished recorded window is
    /// resumed first and the gap joins its pending spans. With no window left
    /// to resume, the oldest pending span runs next.
    async fn schedule_backfill(&self, from: u64, to: u64) {
        let gap = BlockSpan::new(from, to);
        if self.backfill.enqueue(gap).await {
            return;
        }

        let recorded = match self.tracker.get_historical_range().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "could not read historical range");
                None
            }
        };

        let Some(range) = recorded else {
            self.spawn(from, to, Vec::new());
            return;
        };

        let mut queue = range.pending.clone();
        queue.push(gap);

        if range.status == RangeStatus::Processing {
            let historical = self.tracker.get_historical().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "could not read historical marker");
                None
            });
            let start = historical.map_or(range.start_block, |h| (h + 1).max(range.start_block));
            if start <= range.end_block {
                tracing::info!(
                    range_start = range.start_block,
                    range_end = range.end_block,
                    resume_from = start,
                    queued_from = from,
                    queued_to = to,
                    "resuming recorded backfill range"
                );
                self.spawn(start, range.end_block, queue);
                return;
            }
            tracing::info!(
                start = range.start_block,
                end = range.end_block,
                "recorded window already complete"
            );
        }

        let next = queue.remove(0);
        tracing::info!(
            from = next.start,
            to = next.end,
            pending = queue.len(),
            "starting next pending backfill span"
        );
        self.spawn(next.start, next.end, queue);
    }

    fn spawn(&self, start: u64, end: u64, pending: Vec<BlockSpan>) {
        if self.backfill.try_spawn_with(start, end, pending).is_none() {
            tracing::debug!(start, end, "backfill slot taken concurrently");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let d = GapDetector::new(0);
        assert_eq!(d.classify(None, 100), HeadDecision::FirstBlock);
        assert_eq!(d.classify(Some(100), 101), HeadDecision::Contiguous);
        assert_eq!(d.classify(Some(100), 100), HeadDecision::Stale { realtime: 100 });
        assert_eq!(d.classify(Some(100), 90), HeadDecision::Stale { realtime: 100 });
        assert_eq!(
            d.classify(Some(100), 150),
            HeadDecision::Gap {
                from: 101,
                to: 149,
                size: 49
            }
        );
    }

    #[test]
    fn inline_fill_threshold() {
        let d = GapDetector::new(5);
        assert_eq!(
            d.classify(Some(100), 106),
            HeadDecision::InlineFill { from: 101, to: 105 }
        );
        assert!(matches!(d.classify(Some(100), 107), HeadDecision::Gap { size: 6, .. }));
    }
}
