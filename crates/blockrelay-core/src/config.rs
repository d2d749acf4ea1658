//! Engine configuration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::decode::TRANSFER_TOPIC;
use crate::error::IngestError;
use crate::handler::LogHandler;
use crate::retry::RetryPolicy;
use crate::tracked::DEFAULT_TRACKED_TTL;

/// Per-chain pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSettings {
    /// Blocks per backfill batch.
    pub batch_size: u64,
    /// Head polling interval for the live path.
    pub live_delay_ms: u64,
    /// Pause between backfill batches.
    pub historical_delay_ms: u64,
}

impl ChainSettings {
    /// Presets for known chains; conservative defaults otherwise.
    pub fn for_chain(chain_id: u32) -> Self {
        let (batch_size, live_delay_ms, historical_delay_ms) = match chain_id {
            1 => (100, 300, 100),
            137 => (100, 100, 25),
            8453 => (100, 150, 50),
            25 => (100, 50, 20),
            _ => (5, 150, 50),
        };
        Self {
            batch_size,
            live_delay_ms,
            historical_delay_ms,
        }
    }
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self::for_chain(0)
    }
}

/// Everything the ingestion engine needs, other than handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub chain_id: u32,
    pub chain: ChainSettings,
    /// Circuit breaker: the largest range a single backfill run may cover.
    pub max_backfill_blocks: u64,
    /// Gaps up to this size are filled inline by the live path. `0` disables it.
    pub inline_fill_max_gap: u64,
    /// Logs dispatched per chunk before yielding.
    pub log_chunk_size: usize,
    /// Pause between chunks (0 = plain yield).
    pub chunk_yield_ms: u64,
    /// `topic0` of the generic transfer event used for tracked collections.
    pub transfer_topic: String,
    pub retry: RetryPolicy,
    pub tracked_cache_ttl_secs: u64,
    pub rpc_url: String,
    /// SQLite database path. `None` runs without a progress store.
    pub store_path: Option<String>,
    pub asset_linked_topic: Option<String>,
    pub asset_unlinked_topic: Option<String>,
    /// Address of the asset registry contract emitting link/unlink events.
    pub registry_address: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            chain: ChainSettings::for_chain(1),
            max_backfill_blocks: 50_000,
            inline_fill_max_gap: 0,
            log_chunk_size: 1000,
            chunk_yield_ms: 0,
            transfer_topic: TRANSFER_TOPIC.to_string(),
            retry: RetryPolicy::default(),
            tracked_cache_ttl_secs: DEFAULT_TRACKED_TTL.as_secs(),
            rpc_url: "http://localhost:8545".into(),
            store_path: None,
            asset_linked_topic: None,
            asset_unlinked_topic: None,
            registry_address: None,
        }
    }
}

impl EngineConfig {
    /// Build a config for `chain_id` with that chain's presets.
    pub fn for_chain(chain_id: u32) -> Self {
        Self {
            chain_id,
            chain: ChainSettings::for_chain(chain_id),
            ..Default::default()
        }
    }

    /// Read configuration from environment variables.
    pub fn from_env() -> Result<Self, IngestError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`. Unset keys keep their defaults;
    /// present but malformed values are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, IngestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let chain_id = parse_var(&lookup, "CHAIN_ID")?.unwrap_or(1);
        let mut cfg = Self::for_chain(chain_id);

        if let Some(url) = lookup("RPC_URL") {
            cfg.rpc_url = url;
        }
        cfg.store_path = lookup("STORE_PATH").filter(|s| !s.is_empty());
        if let Some(topic) = lookup("TRANSFER_TOPIC") {
            cfg.transfer_topic = topic;
        }
        cfg.asset_linked_topic = lookup("ASSET_LINKED_TOPIC");
        cfg.asset_unlinked_topic = lookup("ASSET_UNLINKED_TOPIC");
        cfg.registry_address = lookup("REGISTRY_ADDRESS");

        if let Some(v) = parse_var(&lookup, "MAX_BACKFILL_BLOCKS")? {
            cfg.max_backfill_blocks = v;
        }
        if let Some(v) = parse_var(&lookup, "INLINE_FILL_MAX_GAP")? {
            cfg.inline_fill_max_gap = v;
        }
        if let Some(v) = parse_var(&lookup, "BATCH_SIZE")? {
            cfg.chain.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "LIVE_DELAY_MS")? {
            cfg.chain.live_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "HISTORICAL_DELAY_MS")? {
            cfg.chain.historical_delay_ms = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chain.batch_size == 0 {
            return Err(IngestError::Config("batch_size must be > 0".into()));
        }
        if self.max_backfill_blocks == 0 {
            return Err(IngestError::Config("max_backfill_blocks must be > 0".into()));
        }
        if self.log_chunk_size == 0 {
            return Err(IngestError::Config("log_chunk_size must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, IngestError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| IngestError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

// ─── Contract / event configuration ──────────────────────────────────────────

/// One event of a contract, bound to its handler.
#[derive(Clone)]
pub struct EventConfig {
    /// `topic0`. `None` when the topic could not be resolved (entry skipped).
    pub topic: Option<String>,
    pub event_name: String,
    pub handler: Arc<dyn LogHandler>,
    pub exclude_addresses: Vec<String>,
}

impl EventConfig {
    pub fn new(
        topic: Option<String>,
        event_name: impl Into<String>,
        handler: Arc<dyn LogHandler>,
    ) -> Self {
        Self {
            topic,
            event_name: event_name.into(),
            handler,
            exclude_addresses: vec![],
        }
    }

    /// Skip logs whose sender or recipient is one of `addresses`.
    pub fn exclude<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_addresses
            .extend(addresses.into_iter().map(Into::into));
        self
    }
}

/// A contract and the events to ingest from it.
#[derive(Clone)]
pub struct ContractConfig {
    pub name: String,
    /// `None` when the deployment address is unknown on this chain.
    pub address: Option<String>,
    pub events: Vec<EventConfig>,
}

impl ContractConfig {
    pub fn new(name: impl Into<String>, address: Option<String>) -> Self {
        Self {
            name: name.into(),
            address,
            events: vec![],
        }
    }

    pub fn event(mut self, event: EventConfig) -> Self {
        self.events.push(event);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn chain_presets() {
        assert_eq!(ChainSettings::for_chain(1).live_delay_ms, 300);
        assert_eq!(ChainSettings::for_chain(137).historical_delay_ms, 25);
        assert_eq!(ChainSettings::for_chain(8453).batch_size, 100);
        assert_eq!(ChainSettings::for_chain(25).live_delay_ms, 50);
        assert_eq!(ChainSettings::for_chain(999).batch_size, 5);
    }

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_backfill_blocks, 50_000);
        assert_eq!(cfg.inline_fill_max_gap, 0);
        assert_eq!(cfg.tracked_cache_ttl_secs, DEFAULT_TRACKED_TTL.as_secs());
        assert_eq!(cfg.log_chunk_size, 1000);
        assert_eq!(cfg.transfer_topic, TRANSFER_TOPIC);
        assert!(cfg.store_path.is_none());
    }

    #[test]
    fn env_overrides_presets() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("CHAIN_ID", "8453"),
            ("BATCH_SIZE", "25"),
            ("MAX_BACKFILL_BLOCKS", "1000"),
            ("STORE_PATH", "/tmp/relay.db"),
        ]))
        .unwrap();
        assert_eq!(cfg.chain_id, 8453);
        assert_eq!(cfg.chain.batch_size, 25);
        assert_eq!(cfg.chain.live_delay_ms, 150);
        assert_eq!(cfg.max_backfill_blocks, 1000);
        assert_eq!(cfg.store_path.as_deref(), Some("/tmp/relay.db"));
    }

    #[test]
    fn malformed_value_is_config_error() {
        let err = EngineConfig::from_lookup(lookup(&[("CHAIN_ID", "base")])).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }
}
