//! Sync coordinator: keeps a [`ReplicatedStore`] in step with the peer.
//!
//! ```text
//!  SyncedStore::set ──► store.write (fresh version) ──► conn.send(db-sync) ──► peer
//!  peer ──► conn.inbound_data() (db-sync) ──► store.write(verbatim version)
//!                                                   │
//!                                                   └─ equal version: dropped (echo)
//! ```
//!
//! Only writes made through [`SyncedStore::set`] are forwarded. Writes
//! applied from the network are never sent back, so a value crosses the
//! link once. Inbound payloads arrive on an unbounded tap, so a slow store
//! delays remote writes but never loses them. With no open channel a local
//! write stays local; nothing is queued for later.

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use tandem_store::{DataChanged, Entry, ReplicatedStore, Version};

use crate::connection::ConnectionManager;
use crate::error::SyncError;
use crate::protocol::PeerMessage;

/// A replicated store wired to a connection.
pub struct SyncedStore {
    store: ReplicatedStore,
    conn: ConnectionManager,
    inbound: JoinHandle<()>,
}

impl SyncedStore {
    /// Wire `store` to `conn`. Must be called inside a tokio runtime.
    pub fn new(store: ReplicatedStore, conn: ConnectionManager) -> Self {
        // Subscribe before waiting so nothing sent right after the channel
        // opens is missed.
        let payloads = conn.inbound_data();
        let inbound = tokio::spawn(apply_remote(store.clone(), conn.clone(), payloads));
        Self {
            store,
            conn,
            inbound,
        }
    }

    /// Write locally, then forward to the peer if a channel is open.
    ///
    /// With `version` of `None` a fresh one is minted. Returns the version
    /// the value was stored under, or `None` when `version` was already the
    /// stored one; such a write is neither applied nor forwarded.
    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        version: Option<Version>,
    ) -> Result<Option<Version>, SyncError> {
        let version = match self.store.write(key, value.clone(), version).await? {
            Some(applied) => applied,
            None => {
                log::debug!("'{key}' already at that version; not forwarded");
                return Ok(None);
            }
        };

        if !self.conn.is_open() {
            log::debug!("No open channel; '{key}' stays local");
            return Ok(Some(version));
        }
        let message = PeerMessage::db_sync(key, value, &version);
        match self.conn.send(&message) {
            Ok(()) => log::debug!("Forwarded '{key}' at {version}"),
            Err(e) => log::warn!("Could not forward '{key}': {e}"),
        }
        Ok(Some(version))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Entry>, SyncError> {
        Ok(self.store.get(key).await?)
    }

    pub async fn contains(&self, key: &str) -> Result<bool, SyncError> {
        Ok(self.store.contains(key).await?)
    }

    pub async fn keys(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.store.map().keys().await?)
    }

    /// Every applied write, local or remote.
    pub fn subscribe(&self) -> broadcast::Receiver<DataChanged> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &ReplicatedStore {
        &self.store
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }
}

impl Drop for SyncedStore {
    fn drop(&mut self) {
        self.inbound.abort();
    }
}

async fn apply_remote(
    store: ReplicatedStore,
    conn: ConnectionManager,
    mut payloads: mpsc::UnboundedReceiver<serde_json::Value>,
) {
    conn.wait_for_ready().await;
    log::debug!("Sync for '{}' is live", conn.channel_id());

    while let Some(payload) = payloads.recv().await {
        let Some(PeerMessage::DbSync(update)) = PeerMessage::from_value(&payload) else {
            continue;
        };
        let version = update.version();
        match store.write(&update.key, update.value, version).await {
            Ok(Some(applied)) => log::debug!("Applied remote '{}' at {applied}", update.key),
            Ok(None) => log::trace!("Echo of '{}' suppressed", update.key),
            Err(e) => log::error!("Failed to apply remote '{}': {e}", update.key),
        }
    }
}
