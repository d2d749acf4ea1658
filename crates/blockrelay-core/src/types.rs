//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

// ─── RawLog ───────────────────────────────────────────────────────────────────

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "transactionHash", default)]
    pub tx_hash: String,
    #[serde(rename = "logIndex", default)]
    pub log_index: String,
    #[serde(rename = "removed", default)]
    pub removed: Option<bool>,
}

impl RawLog {
    /// Returns the block number as u64.
    pub fn block_number_u64(&self) -> u64 {
        parse_hex_u64(&self.block_number)
    }

    /// Returns the log index as u32.
    pub fn log_index_u32(&self) -> u32 {
        parse_hex_u64(&self.log_index) as u32
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// The event signature hash (`topics[0]`), if present.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(|s| s.as_str())
    }

    /// Registry key for this log: `topic0-lowercase(address)`.
    pub fn handler_key(&self) -> Option<String> {
        self.topic0().map(|t| handler_key(t, &self.address))
    }
}

/// Build the registry key for a `(topic, address)` pair.
pub fn handler_key(topic: &str, address: &str) -> String {
    format!("{}-{}", topic.to_ascii_lowercase(), address.to_ascii_lowercase())
}

/// Parse a hex-encoded string (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> u64 {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).unwrap_or(0)
}

/// Format a block number as a `0x`-prefixed quantity.
pub fn to_hex_quantity(n: u64) -> String {
    format!("0x{n:x}")
}

/// Extract the address packed into the low 20 bytes of a 32-byte topic.
///
/// Returns the lowercase `0x…` form, or `None` if the topic is not 32 bytes.
pub fn topic_to_address(topic: &str) -> Option<String> {
    let hex = topic.strip_prefix("0x").unwrap_or(topic);
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", hex[24..].to_ascii_lowercase()))
}

// ─── Progress ─────────────────────────────────────────────────────────────────

/// Which producer of progress a marker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Track {
    /// Blocks processed directly as chain heads arrive.
    RealTime,
    /// Blocks processed by the background backfill worker.
    Historical,
}

impl Track {
    fn key_suffix(&self) -> &'static str {
        match self {
            Self::RealTime => "realtime",
            Self::Historical => "historical",
        }
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key_suffix())
    }
}

/// Store key of a progress marker, e.g. `8453:realtime`.
pub fn marker_key(chain_id: u32, track: Track) -> String {
    format!("{chain_id}:{}", track.key_suffix())
}

/// Store key of the in-flight historical range, e.g. `8453:historical_range`.
pub fn range_key(chain_id: u32) -> String {
    format!("{chain_id}:historical_range")
}

/// The last block a producer processed successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMarker {
    pub track: Track,
    pub block_number: u64,
    pub chain_id: u32,
    /// Unix timestamp (seconds) of the last write.
    pub updated_at: i64,
}

impl ProgressMarker {
    pub fn new(chain_id: u32, track: Track, block_number: u64) -> Self {
        Self {
            track,
            block_number,
            chain_id,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Lifecycle of a historical range record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RangeStatus {
    /// The window is being backfilled; the historical marker tracks it.
    Processing,
    /// The window is finished; only `pending` spans remain.
    Done,
}

/// An inclusive span of blocks waiting for a backfill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpan {
    pub start: u64,
    pub end: u64,
}

impl BlockSpan {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The block window being repaired by the backfill worker, plus the spans
/// queued behind it (circuit-breaker tails, gaps seen while it was busy).
///
/// The window never exceeds the backfill ceiling; queued spans may.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalRange {
    pub start_block: u64,
    pub end_block: u64,
    pub status: RangeStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<BlockSpan>,
    pub updated_at: i64,
}

impl HistoricalRange {
    pub fn processing(start_block: u64, end_block: u64) -> Self {
        Self {
            start_block,
            end_block,
            status: RangeStatus::Processing,
            pending: vec![],
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// A finished window that still has queued spans.
    pub fn done(start_block: u64, end_block: u64, pending: Vec<BlockSpan>) -> Self {
        Self {
            status: RangeStatus::Done,
            pending,
            ..Self::processing(start_block, end_block)
        }
    }

    pub fn with_pending(mut self, pending: Vec<BlockSpan>) -> Self {
        self.pending = pending;
        self
    }

    /// Number of blocks covered by the range (0 if inverted).
    pub fn len(&self) -> u64 {
        if self.end_block < self.start_block {
            0
        } else {
            self.end_block - self.start_block + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── LogFilter ────────────────────────────────────────────────────────────────

/// Filter passed to `eth_getLogs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFilter {
    /// Only fetch logs from these contract addresses (empty = all addresses).
    pub addresses: Vec<String>,
    /// Only fetch logs with this topic[0] value (empty = all events).
    pub topic0_values: Vec<String>,
}

impl LogFilter {
    /// Create a filter for a single contract address.
    pub fn address(addr: impl Into<String>) -> Self {
        Self {
            addresses: vec![addr.into()],
            ..Default::default()
        }
    }

    /// Add a topic0 filter (event signature hash).
    pub fn topic0(mut self, topic: impl Into<String>) -> Self {
        self.topic0_values.push(topic.into());
        self
    }

    /// Returns `true` if `log` passes this filter.
    pub fn matches(&self, log: &RawLog) -> bool {
        let address_ok = self.addresses.is_empty()
            || self.addresses.iter().any(|a| a.eq_ignore_ascii_case(&log.address));
        let topic_ok = self.topic0_values.is_empty()
            || log
                .topic0()
                .is_some_and(|t0| self.topic0_values.iter().any(|t| t.eq_ignore_ascii_case(t0)));
        address_ok && topic_ok
    }
}

// ─── IngestPhase ──────────────────────────────────────────────────────────────

/// Which path is dispatching a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestPhase {
    /// Processing a chain head as it arrives.
    Live,
    /// Repairing a gap in the background.
    Backfill,
}

impl std::fmt::Display for IngestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Backfill => write!(f, "backfill"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn log(address: &str, topics: &[&str]) -> RawLog {
        RawLog {
            address: address.into(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            data: "0x".into(),
            block_number: "0x64".into(),
            tx_hash: "0x0".into(),
            log_index: "0x2".into(),
            removed: None,
        }
    }

    #[test]
    fn raw_log_numbers() {
        let l = log("0xabc", &["0xddf2"]);
        assert_eq!(l.block_number_u64(), 100);
        assert_eq!(l.log_index_u32(), 2);
        assert!(!l.is_removed());
    }

    #[test]
    fn raw_log_deserializes_rpc_shape() {
        let json = serde_json::json!({
            "address": "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            "topics": ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"],
            "data": "0x",
            "blockNumber": "0x10",
            "blockHash": "0xfeed",
            "transactionHash": "0xbeef",
            "logIndex": "0x0",
            "removed": false
        });
        let l: RawLog = serde_json::from_value(json).unwrap();
        assert_eq!(l.block_number_u64(), 16);
        assert_eq!(l.tx_hash, "0xbeef");
    }

    #[test]
    fn handler_key_is_case_insensitive() {
        let l = log("0xAbCdEf", &["0xDDF2"]);
        assert_eq!(l.handler_key().unwrap(), "0xddf2-0xabcdef");
        assert_eq!(handler_key("0xddf2", "0xABCDEF"), "0xddf2-0xabcdef");
    }

    #[test]
    fn topic_address_extraction() {
        let topic = "0x000000000000000000000000D8dA6BF26964aF9D7eEd9e03E53415D37aA96045";
        assert_eq!(
            topic_to_address(topic).unwrap(),
            "0xd8da6bf26964af9d7eed9e03e53415d37aa96045"
        );
        assert!(topic_to_address("0x1234").is_none());
    }

    #[test]
    fn store_keys() {
        assert_eq!(marker_key(8453, Track::RealTime), "8453:realtime");
        assert_eq!(marker_key(1, Track::Historical), "1:historical");
        assert_eq!(range_key(137), "137:historical_range");
    }

    #[test]
    fn range_len() {
        assert_eq!(HistoricalRange::processing(101, 149).len(), 49);
        assert!(HistoricalRange::processing(10, 9).is_empty());
    }

    #[test]
    fn pending_spans_survive_json() {
        let plain = serde_json::to_value(HistoricalRange::processing(101, 149)).unwrap();
        assert!(plain.get("pending").is_none());
        assert_eq!(plain["status"], "processing");

        let done = HistoricalRange::done(101, 120, vec![BlockSpan::new(121, 149)]);
        let json = serde_json::to_string(&done).unwrap();
        let back: HistoricalRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, RangeStatus::Done);
        assert_eq!(back.pending, vec![BlockSpan::new(121, 149)]);
        assert_eq!(back.pending[0].len(), 29);
    }

    #[test]
    fn filter_matches() {
        let f = LogFilter::address("0xAbC").topic0("0xDD");
        assert!(f.matches(&log("0xabc", &["0xdd"])));
        assert!(!f.matches(&log("0xabc", &["0xee"])));
        assert!(LogFilter::default().matches(&log("0x1", &[])));
    }
}
