//! Tracked collection addresses.
//!
//! Transfers from contracts without a dedicated registry entry are only
//! forwarded when the emitting contract is a tracked collection. The set
//! lives in a [`TrackedAddressStore`]; the registry reads it through a
//! [`TrackedAddressSource`], normally a [`CachedTrackedAddresses`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::IngestError;

/// Read-only membership check used during dispatch.
#[async_trait]
pub trait TrackedAddressSource: Send + Sync {
    /// Returns `true` if `address` is a tracked collection on `chain_id`.
    async fn is_tracked(&self, chain_id: u32, address: &str) -> Result<bool, IngestError>;
}

/// Durable list of tracked collection addresses, per chain.
///
/// Addresses are stored lowercase.
#[async_trait]
pub trait TrackedAddressStore: Send + Sync {
    async fn list_tracked(&self, chain_id: u32) -> Result<Vec<String>, IngestError>;

    /// Returns `false` if the address was already tracked.
    async fn add_tracked(&self, chain_id: u32, address: &str) -> Result<bool, IngestError>;

    /// Returns `false` if the address was not tracked.
    async fn remove_tracked(&self, chain_id: u32, address: &str) -> Result<bool, IngestError>;
}

// ─── Cache ────────────────────────────────────────────────────────────────────

pub const DEFAULT_TRACKED_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    loaded_at: Instant,
    addresses: Arc<HashSet<String>>,
}

/// TTL cache in front of a [`TrackedAddressStore`].
///
/// When a refresh fails and a stale set is available, the stale set is used
/// and the failure is logged. With nothing cached the error is returned.
pub struct CachedTrackedAddresses {
    store: Arc<dyn TrackedAddressStore>,
    ttl: Duration,
    cache: Mutex<HashMap<u32, CacheEntry>>,
}

impl CachedTrackedAddresses {
    pub fn new(store: Arc<dyn TrackedAddressStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Drop cached sets so the next lookup hits the store.
    pub async fn invalidate(&self) {
        self.cache.lock().await.clear();
    }

    async fn addresses(&self, chain_id: u32) -> Result<Arc<HashSet<String>>, IngestError> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.get(&chain_id) {
            if entry.loaded_at.elapsed() < self.ttl {
                return Ok(entry.addresses.clone());
            }
        }

        match self.store.list_tracked(chain_id).await {
            Ok(list) => {
                let addresses: Arc<HashSet<String>> =
                    Arc::new(list.into_iter().map(|a| a.to_ascii_lowercase()).collect());
                tracing::debug!(chain_id, count = addresses.len(), "tracked addresses refreshed");
                cache.insert(
                    chain_id,
                    CacheEntry {
                        loaded_at: Instant::now(),
                        addresses: addresses.clone(),
                    },
                );
                Ok(addresses)
            }
            Err(e) => match cache.get(&chain_id) {
                Some(stale) => {
                    tracing::warn!(chain_id, error = %e, "tracked address refresh failed, using stale set");
                    Ok(stale.addresses.clone())
                }
                None => Err(e),
            },
        }
    }
}

#[async_trait]
impl TrackedAddressSource for CachedTrackedAddresses {
    async fn is_tracked(&self, chain_id: u32, address: &str) -> Result<bool, IngestError> {
        let set = self.addresses(chain_id).await?;
        Ok(set.contains(&address.to_ascii_lowercase()))
    }
}

/// A fixed address set, for tests and store-less deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticTrackedAddresses {
    addresses: HashSet<String>,
}

impl StaticTrackedAddresses {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            addresses: addresses
                .into_iter()
                .map(|a| a.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }
}

#[async_trait]
impl TrackedAddressSource for StaticTrackedAddresses {
    async fn is_tracked(&self, _chain_id: u32, address: &str) -> Result<bool, IngestError> {
        Ok(self.addresses.contains(&address.to_ascii_lowercase()))
    }
}
