//! Scripted collaborators for tests and local dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use blockrelay_core::error::IngestError;
use blockrelay_core::handler::{LogContext, LogHandler};
use blockrelay_core::progress::{MemoryProgressStore, ProgressStore};
use blockrelay_core::types::{
    to_hex_quantity, HistoricalRange, IngestPhase, LogFilter, ProgressMarker, RawLog, Track,
};

use crate::fetcher::EvmRpcClient;
use crate::heads::{HeadSource, HeadStream};

/// Build a log at `(block, log_index)` emitted by `address` with `topic0`.
pub fn log_at(block: u64, log_index: u32, address: &str, topic0: &str) -> RawLog {
    RawLog {
        address: address.to_string(),
        topics: vec![topic0.to_string()],
        data: "0x".into(),
        block_number: to_hex_quantity(block),
        tx_hash: format!("0x{block:x}{log_index:x}"),
        log_index: to_hex_quantity(log_index as u64),
        removed: None,
    }
}

// ─── ScriptedChain ────────────────────────────────────────────────────────────

/// In-memory chain: serves logs by block and records every `eth_getLogs` range.
#[derive(Default)]
pub struct ScriptedChain {
    head: AtomicU64,
    logs: Mutex<BTreeMap<u64, Vec<RawLog>>>,
    calls: Mutex<Vec<(u64, u64)>>,
    fail_ranges: AtomicBool,
    failing_blocks: Mutex<HashSet<u64>>,
}

impl ScriptedChain {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            ..Default::default()
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn push_log(&self, log: RawLog) {
        self.logs
            .lock()
            .unwrap()
            .entry(log.block_number_u64())
            .or_default()
            .push(log);
    }

    /// Make every multi-block `get_logs` call fail.
    pub fn fail_range_calls(&self, fail: bool) {
        self.fail_ranges.store(fail, Ordering::SeqCst);
    }

    /// Make any `get_logs` call covering `block` fail.
    pub fn fail_block(&self, block: u64) {
        self.failing_blocks.lock().unwrap().insert(block);
    }

    /// Every `(from, to)` requested so far, in call order.
    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().unwrap().clone()
    }

    /// Every block number covered by a `get_logs` call, in call order.
    pub fn blocks_requested(&self) -> Vec<u64> {
        self.calls().into_iter().flat_map(|(f, t)| f..=t).collect()
    }
}

#[async_trait]
impl EvmRpcClient for ScriptedChain {
    async fn get_block_number(&self) -> Result<u64, IngestError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLog>, IngestError> {
        self.calls.lock().unwrap().push((from, to));
        if from != to && self.fail_ranges.load(Ordering::SeqCst) {
            return Err(IngestError::Rpc("query returned more than 10000 results".into()));
        }
        {
            let failing = self.failing_blocks.lock().unwrap();
            if (from..=to).any(|b| failing.contains(&b)) {
                return Err(IngestError::Rpc(format!("block range {from}-{to} unavailable")));
            }
        }
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .range(from..=to)
            .flat_map(|(_, v)| v.iter())
            .filter(|l| filter.matches(l))
            .cloned()
            .collect())
    }
}

// ─── ScriptedHeads ────────────────────────────────────────────────────────────

/// Head source that replays a fixed script, then ends the stream.
pub struct ScriptedHeads {
    script: Mutex<Option<Vec<Result<u64, IngestError>>>>,
}

impl ScriptedHeads {
    pub fn new(script: Vec<Result<u64, IngestError>>) -> Self {
        Self {
            script: Mutex::new(Some(script)),
        }
    }

    pub fn heads(heads: impl IntoIterator<Item = u64>) -> Self {
        Self::new(heads.into_iter().map(Ok).collect())
    }
}

#[async_trait]
impl HeadSource for ScriptedHeads {
    async fn subscribe_new_heads(&self) -> Result<HeadStream, IngestError> {
        let script = self
            .script
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| IngestError::Subscription("script already consumed".into()))?;
        Ok(Box::pin(stream::iter(script)))
    }
}

// ─── RecordingStore ───────────────────────────────────────────────────────────

/// A progress store write, as seen by [`RecordingStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    SaveMarker(Track, u64),
    DeleteMarker(Track),
    SaveRange(u64, u64),
    DeleteRange,
}

/// Memory store that records every write in order.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryProgressStore,
    ops: Mutex<Vec<StoreOp>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: StoreOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl ProgressStore for RecordingStore {
    async fn load_marker(
        &self,
        chain_id: u32,
        track: Track,
    ) -> Result<Option<ProgressMarker>, IngestError> {
        self.inner.load_marker(chain_id, track).await
    }

    async fn save_marker(&self, marker: ProgressMarker) -> Result<(), IngestError> {
        self.record(StoreOp::SaveMarker(marker.track, marker.block_number));
        self.inner.save_marker(marker).await
    }

    async fn delete_marker(&self, chain_id: u32, track: Track) -> Result<(), IngestError> {
        self.record(StoreOp::DeleteMarker(track));
        self.inner.delete_marker(chain_id, track).await
    }

    async fn load_range(&self, chain_id: u32) -> Result<Option<HistoricalRange>, IngestError> {
        self.inner.load_range(chain_id).await
    }

    async fn save_range(&self, chain_id: u32, range: HistoricalRange) -> Result<(), IngestError> {
        self.record(StoreOp::SaveRange(range.start_block, range.end_block));
        self.inner.save_range(chain_id, range).await
    }

    async fn delete_range(&self, chain_id: u32) -> Result<(), IngestError> {
        self.record(StoreOp::DeleteRange);
        self.inner.delete_range(chain_id).await
    }
}

// ─── RecordingHandler ─────────────────────────────────────────────────────────

/// Handler that records `(block, phase)` for every log it receives.
#[derive(Default, Clone)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<(u64, IngestPhase)>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<(u64, IngestPhase)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn blocks(&self, phase: IngestPhase) -> Vec<u64> {
        self.seen()
            .into_iter()
            .filter(|(_, p)| *p == phase)
            .map(|(b, _)| b)
            .collect()
    }
}

#[async_trait]
impl LogHandler for RecordingHandler {
    async fn handle(&self, log: &RawLog, ctx: &LogContext<'_>) -> Result<(), IngestError> {
        self.seen
            .lock()
            .unwrap()
            .push((log.block_number_u64(), ctx.phase));
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}
