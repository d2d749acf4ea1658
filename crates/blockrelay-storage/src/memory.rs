//! In-memory storage backend.
//!
//! Keeps progress records as serialized JSON under their store keys, exactly
//! as the SQLite backend does, plus the tracked-address sets. All data is lost
//! when the process exits.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use blockrelay_core::error::IngestError;
use blockrelay_core::progress::ProgressStore;
use blockrelay_core::tracked::TrackedAddressStore;
use blockrelay_core::types::{marker_key, range_key, HistoricalRange, ProgressMarker, Track};

/// In-memory progress and tracked-address storage.
#[derive(Default)]
pub struct InMemoryStorage {
    records: Mutex<BTreeMap<String, String>>,
    tracked: Mutex<HashMap<u32, BTreeSet<String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw JSON stored under `key`.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.records.lock().unwrap().get(key).cloned()
    }

    /// All keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, IngestError> {
        match self.raw(key) {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| IngestError::Other(format!("corrupt record '{key}': {e}"))),
        }
    }

    fn put<T: Serialize>(&self, key: String, value: &T) -> Result<(), IngestError> {
        let json = serde_json::to_string(value)
            .map_err(|e| IngestError::Other(format!("serialize '{key}': {e}")))?;
        self.records.lock().unwrap().insert(key, json);
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.records.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl ProgressStore for InMemoryStorage {
    async fn load_marker(
        &self,
        chain_id: u32,
        track: Track,
    ) -> Result<Option<ProgressMarker>, IngestError> {
        self.get(&marker_key(chain_id, track))
    }

    async fn save_marker(&self, marker: ProgressMarker) -> Result<(), IngestError> {
        self.put(marker_key(marker.chain_id, marker.track), &marker)
    }

    async fn delete_marker(&self, chain_id: u32, track: Track) -> Result<(), IngestError> {
        self.remove(&marker_key(chain_id, track));
        Ok(())
    }

    async fn load_range(&self, chain_id: u32) -> Result<Option<HistoricalRange>, IngestError> {
        self.get(&range_key(chain_id))
    }

    async fn save_range(&self, chain_id: u32, range: HistoricalRange) -> Result<(), IngestError> {
        self.put(range_key(chain_id), &range)
    }

    async fn delete_range(&self, chain_id: u32) -> Result<(), IngestError> {
        self.remove(&range_key(chain_id));
        Ok(())
    }
}

#[async_trait]
impl TrackedAddressStore for InMemoryStorage {
    async fn list_tracked(&self, chain_id: u32) -> Result<Vec<String>, IngestError> {
        Ok(self
            .tracked
            .lock()
            .unwrap()
            .get(&chain_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_tracked(&self, chain_id: u32, address: &str) -> Result<bool, IngestError> {
        Ok(self
            .tracked
            .lock()
            .unwrap()
            .entry(chain_id)
            .or_default()
            .insert(address.to_ascii_lowercase()))
    }

    async fn remove_tracked(&self, chain_id: u32, address: &str) -> Result<bool, IngestError> {
        Ok(self
            .tracked
            .lock()
            .unwrap()
            .get_mut(&chain_id)
            .is_some_and(|set| set.remove(&address.to_ascii_lowercase())))
    }
}
