//! Handler registry: routes each log to exactly one handler.
//!
//! Entries are keyed by `topic0-lowercase(address)` and built once from
//! [`ContractConfig`]. A generic-transfer fallback forwards transfers from
//! tracked collections that have no dedicated entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::ContractConfig;
use crate::error::IngestError;
use crate::handler::{LogContext, LogHandler};
use crate::tracked::TrackedAddressSource;
use crate::types::{handler_key, topic_to_address, IngestPhase, LogFilter, RawLog};

/// A registered `(topic, contract)` pair.
#[derive(Clone)]
pub struct HandlerEntry {
    pub topic: String,
    pub address: String,
    pub event_name: String,
    pub handler: Arc<dyn LogHandler>,
    pub exclude_addresses: HashSet<String>,
}

impl HandlerEntry {
    /// Returns `true` if the log's sender or recipient (topics 1 and 2) is excluded.
    fn excludes(&self, log: &RawLog) -> bool {
        if self.exclude_addresses.is_empty() {
            return false;
        }
        log.topics
            .iter()
            .skip(1)
            .take(2)
            .filter_map(|t| topic_to_address(t))
            .any(|addr| self.exclude_addresses.contains(&addr))
    }
}

struct TransferFallback {
    topic: String,
    handler: Arc<dyn LogHandler>,
    tracked: Arc<dyn TrackedAddressSource>,
}

/// How a log was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handled by the entry registered for its topic and address.
    Specific,
    /// Handled by the transfer fallback (tracked collection).
    TrackedTransfer,
    /// Matched an entry but skipped by its exclusion list.
    Excluded,
    /// No handler applies.
    Unmatched,
    /// Log was flagged `removed` by the node.
    Removed,
}

/// Immutable routing table from `(topic, address)` to handler.
pub struct HandlerRegistry {
    chain_id: u32,
    entries: HashMap<String, HandlerEntry>,
    fallback: Option<TransferFallback>,
}

impl HandlerRegistry {
    /// Build the registry. Events with an unresolved address or topic are
    /// skipped with a warning.
    pub fn from_config(chain_id: u32, contracts: &[ContractConfig]) -> Self {
        let mut entries = HashMap::new();
        for contract in contracts {
            let Some(address) = contract.address.as_deref() else {
                tracing::warn!(contract = %contract.name, chain_id, "no address on this chain, skipping");
                continue;
            };
            for event in &contract.events {
                let Some(topic) = event.topic.as_deref() else {
                    tracing::warn!(
                        contract = %contract.name,
                        event = %event.event_name,
                        "event topic unresolved, skipping"
                    );
                    continue;
                };
                let key = handler_key(topic, address);
                let entry = HandlerEntry {
                    topic: topic.to_ascii_lowercase(),
                    address: address.to_ascii_lowercase(),
                    event_name: event.event_name.clone(),
                    handler: event.handler.clone(),
                    exclude_addresses: event
                        .exclude_addresses
                        .iter()
                        .map(|a| a.to_ascii_lowercase())
                        .collect(),
                };
                if entries.insert(key.clone(), entry).is_some() {
                    tracing::warn!(key = %key, "duplicate handler registration, last one wins");
                }
            }
        }
        tracing::info!(chain_id, handlers = entries.len(), "handler registry built");
        Self {
            chain_id,
            entries,
            fallback: None,
        }
    }

    /// Forward logs with `topic` from tracked collections to `handler`
    /// when no specific entry matches.
    pub fn with_transfer_fallback(
        mut self,
        topic: impl Into<String>,
        handler: Arc<dyn LogHandler>,
        tracked: Arc<dyn TrackedAddressSource>,
    ) -> Self {
        self.fallback = Some(TransferFallback {
            topic: topic.into().to_ascii_lowercase(),
            handler,
            tracked,
        });
        self
    }

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }

    pub fn lookup(&self, topic: &str, address: &str) -> Option<&HandlerEntry> {
        self.entries.get(&handler_key(topic, address))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `eth_getLogs` filter covering every registered topic plus the
    /// fallback topic. Addresses are left open so tracked collections match.
    pub fn log_filter(&self) -> LogFilter {
        let mut topics: Vec<String> = self.entries.values().map(|e| e.topic.clone()).collect();
        if let Some(fb) = &self.fallback {
            topics.push(fb.topic.clone());
        }
        topics.sort();
        topics.dedup();
        LogFilter {
            addresses: vec![],
            topic0_values: topics,
        }
    }

    /// Route one log. Handler errors are returned as-is.
    pub async fn dispatch(&self, log: &RawLog, phase: IngestPhase) -> Result<Dispatch, IngestError> {
        if log.is_removed() {
            return Ok(Dispatch::Removed);
        }
        let Some(topic0) = log.topic0() else {
            return Ok(Dispatch::Unmatched);
        };

        if let Some(entry) = self.entries.get(&handler_key(topic0, &log.address)) {
            if entry.excludes(log) {
                return Ok(Dispatch::Excluded);
            }
            let ctx = LogContext {
                chain_id: self.chain_id,
                phase,
                event_name: &entry.event_name,
            };
            entry.handler.handle(log, &ctx).await?;
            return Ok(Dispatch::Specific);
        }

        if let Some(fb) = &self.fallback {
            if fb.topic.eq_ignore_ascii_case(topic0)
                && fb.tracked.is_tracked(self.chain_id, &log.address).await?
            {
                let ctx = LogContext {
                    chain_id: self.chain_id,
                    phase,
                    event_name: "Transfer",
                };
                fb.handler.handle(log, &ctx).await?;
                return Ok(Dispatch::TrackedTransfer);
            }
        }

        Ok(Dispatch::Unmatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventConfig;
    use crate::decode::TRANSFER_TOPIC;
    use crate::tracked::StaticTrackedAddresses;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const LINKED: &str = "0xaaaa";
    const REGISTRY: &str = "0xRegistry";

    struct Counter(Arc<AtomicU32>, &'static str);

    #[async_trait]
    impl LogHandler for Counter {
        async fn handle(&self, _log: &RawLog, _ctx: &LogContext<'_>) -> Result<(), IngestError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn name(&self) -> &str {
            self.1
        }
    }

    fn addr_topic(last: u8) -> String {
        format!("0x{:064x}", last)
    }

    fn log(address: &str, topics: Vec<String>) -> RawLog {
        RawLog {
            address: address.into(),
            topics,
            data: "0x".into(),
            block_number: "0x1".into(),
            tx_hash: "0x0".into(),
            log_index: "0x0".into(),
            removed: None,
        }
    }

    fn registry(specific: Arc<AtomicU32>, fallback: Arc<AtomicU32>) -> HandlerRegistry {
        let contracts = vec![
            ContractConfig::new("registry", Some(REGISTRY.into())).event(EventConfig::new(
                Some(LINKED.into()),
                "AssetLinked",
                Arc::new(Counter(specific.clone(), "linked")),
            )),
            ContractConfig::new("usdc", Some("0xUSDC".into())).event(
                EventConfig::new(
                    Some(TRANSFER_TOPIC.into()),
                    "Transfer",
                    Arc::new(Counter(specific, "usdc")),
                )
                .exclude([format!("0x{:040x}", 0)]),
            ),
            ContractConfig::new("undeployed", None).event(EventConfig::new(
                Some(LINKED.into()),
                "AssetLinked",
                Arc::new(Counter(Arc::new(AtomicU32::new(0)), "x")),
            )),
        ];
        HandlerRegistry::from_config(8453, &contracts).with_transfer_fallback(
            TRANSFER_TOPIC,
            Arc::new(Counter(fallback, "collection")),
            Arc::new(StaticTrackedAddresses::new(["0xCollection"])),
        )
    }

    #[test]
    fn unresolved_entries_are_skipped() {
        let r = registry(Arc::default(), Arc::default());
        assert_eq!(r.len(), 2);
        assert!(r.lookup("0xAAAA", "0xregistry").is_some());
    }

    #[tokio::test]
    async fn matching_log_dispatched_exactly_once() {
        let specific = Arc::new(AtomicU32::new(0));
        let fallback = Arc::new(AtomicU32::new(0));
        let r = registry(specific.clone(), fallback.clone());

        let d = r
            .dispatch(&log("0xREGISTRY", vec![LINKED.into()]), IngestPhase::Live)
            .await
            .unwrap();
        assert_eq!(d, Dispatch::Specific);
        assert_eq!(specific.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_matching_non_transfer_goes_nowhere() {
        let specific = Arc::new(AtomicU32::new(0));
        let fallback = Arc::new(AtomicU32::new(0));
        let r = registry(specific.clone(), fallback.clone());

        let d = r
            .dispatch(&log("0xcollection", vec!["0xbeef".into()]), IngestPhase::Live)
            .await
            .unwrap();
        assert_eq!(d, Dispatch::Unmatched);
        assert_eq!(specific.load(Ordering::SeqCst) + fallback.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transfer_fallback_checks_tracked_set() {
        let specific = Arc::new(AtomicU32::new(0));
        let fallback = Arc::new(AtomicU32::new(0));
        let r = registry(specific.clone(), fallback.clone());
        let topics = vec![TRANSFER_TOPIC.into(), addr_topic(1), addr_topic(2)];

        let tracked = r
            .dispatch(&log("0xCOLLECTION", topics.clone()), IngestPhase::Backfill)
            .await
            .unwrap();
        assert_eq!(tracked, Dispatch::TrackedTransfer);

        let untracked = r
            .dispatch(&log("0xother", topics), IngestPhase::Backfill)
            .await
            .unwrap();
        assert_eq!(untracked, Dispatch::Unmatched);
        assert_eq!(fallback.load(Ordering::SeqCst), 1);
        assert_eq!(specific.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn excluded_sender_is_skipped() {
        let specific = Arc::new(AtomicU32::new(0));
        let r = registry(specific.clone(), Arc::default());

        let mint = log(
            "0xusdc",
            vec![TRANSFER_TOPIC.into(), addr_topic(0), addr_topic(9)],
        );
        assert_eq!(r.dispatch(&mint, IngestPhase::Live).await.unwrap(), Dispatch::Excluded);

        let transfer = log(
            "0xusdc",
            vec![TRANSFER_TOPIC.into(), addr_topic(3), addr_topic(9)],
        );
        assert_eq!(r.dispatch(&transfer, IngestPhase::Live).await.unwrap(), Dispatch::Specific);
        assert_eq!(specific.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removed_logs_are_ignored() {
        let specific = Arc::new(AtomicU32::new(0));
        let r = registry(specific.clone(), Arc::default());
        let mut l = log(REGISTRY, vec![LINKED.into()]);
        l.removed = Some(true);
        assert_eq!(r.dispatch(&l, IngestPhase::Live).await.unwrap(), Dispatch::Removed);
        assert_eq!(specific.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn log_filter_covers_all_topics() {
        let r = registry(Arc::default(), Arc::default());
        let f = r.log_filter();
        assert!(f.addresses.is_empty());
        assert_eq!(f.topic0_values.len(), 2);
    }
}
