//! Observable replicated store.
//!
//! Wraps a [`PersistentMap`] and decides, per write, whether it is new:
//!
//! - no version supplied → locally originated; a fresh [`Version`] is minted
//! - version supplied and equal to the stored one → already applied, skipped
//! - version supplied and different → persisted as-is
//!
//! Every applied write is announced as a [`DataChanged`] on a broadcast
//! channel. This is de-duplication, not conflict resolution: concurrent
//! writes of one key on both peers end with whichever arrives last.

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::map::{Entry, PersistentMap, StoreConfig, StoreError};
use crate::version::Version;

/// Default change channel capacity.
const DEFAULT_CHANGE_CAPACITY: usize = 256;

/// Notification for every applied write, local or remote.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChanged {
    pub key: String,
    pub value: serde_json::Value,
    pub version: Version,
}

/// Versioned, observable view over a persistent map.
#[derive(Clone)]
pub struct ReplicatedStore {
    map: PersistentMap,
    changes: broadcast::Sender<DataChanged>,
    /// Serializes compare-then-persist so two writers of the same key
    /// cannot both pass the version check against stale state.
    write_gate: Arc<Mutex<()>>,
}

impl ReplicatedStore {
    /// Open the named store on disk.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::from_map(PersistentMap::open(config)?))
    }

    pub fn from_map(map: PersistentMap) -> Self {
        Self::with_capacity(map, DEFAULT_CHANGE_CAPACITY)
    }

    /// Wrap `map` with a change channel buffering `capacity` events per subscriber.
    pub fn with_capacity(map: PersistentMap, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            map,
            changes,
            write_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DataChanged> {
        self.changes.subscribe()
    }

    pub async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        self.map.get(key).await
    }

    pub async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        self.map.contains(key).await
    }

    /// Apply a write. Returns `true` if it was applied, `false` if the
    /// supplied version is already the stored one.
    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        version: Option<Version>,
    ) -> Result<bool, StoreError> {
        Ok(self.write(key, value, version).await?.is_some())
    }

    /// Like [`set`](Self::set), but hands back the version that was
    /// persisted so callers can forward it.
    pub async fn write(
        &self,
        key: &str,
        value: serde_json::Value,
        version: Option<Version>,
    ) -> Result<Option<Version>, StoreError> {
        let _gate = self.write_gate.lock().await;

        let version = match version {
            None => Version::fresh(),
            Some(incoming) => {
                if let Some(current) = self.map.get(key).await? {
                    if current.version == incoming {
                        log::trace!("Skipping '{key}': version {incoming} already applied");
                        return Ok(None);
                    }
                }
                incoming
            }
        };

        self.map.set(key, value.clone(), version.clone()).await?;

        // No subscribers is fine.
        let _ = self.changes.send(DataChanged {
            key: key.to_owned(),
            value,
            version: version.clone(),
        });
        Ok(Some(version))
    }

    /// The underlying map.
    pub fn map(&self) -> &PersistentMap {
        &self.map
    }
}
