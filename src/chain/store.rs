//! Secondary storage for cached key states.
//!
//! The in-memory cache is authoritative for a process; a store lets a
//! restarted process pick up where it left off. Redis entries carry an
//! integrity tag keyed by a server secret and are discarded when the tag
//! does not verify.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::chain::cache::KeyStateCacheEntry;
use crate::chain::error::StoreError;
use crate::chain::types::Uid;

/// Redis key prefix for stored key states.
const KEY_PREFIX: &str = "sigchain:keystate:";

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, uid: &Uid) -> Result<Option<KeyStateCacheEntry>, StoreError>;
    async fn put(&self, entry: &KeyStateCacheEntry) -> Result<(), StoreError>;
    async fn remove(&self, uid: &Uid) -> Result<(), StoreError>;
}

/// Process-local store, mostly for tests.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<Uid, KeyStateCacheEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, uid: &Uid) -> Result<Option<KeyStateCacheEntry>, StoreError> {
        Ok(self.entries.read().await.get(uid).cloned())
    }

    async fn put(&self, entry: &KeyStateCacheEntry) -> Result<(), StoreError> {
        self.entries.write().await.insert(entry.uid, entry.clone());
        Ok(())
    }

    async fn remove(&self, uid: &Uid) -> Result<(), StoreError> {
        self.entries.write().await.remove(uid);
        Ok(())
    }
}

/// Entry as written to Redis.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    entry: KeyStateCacheEntry,
    integrity_tag: String,
}

/// Redis-backed store.
pub struct RedisStateStore {
    redis_client: Arc<redis::Client>,
    server_secret: [u8; 32],
}

impl RedisStateStore {
    /// # Arguments
    /// * `redis_client` - Redis client shared with the rest of the process
    /// * `server_secret` - 32-byte secret for integrity tags
    pub fn new(redis_client: Arc<redis::Client>, server_secret: [u8; 32]) -> Self {
        Self {
            redis_client,
            server_secret,
        }
    }

    fn key(uid: &Uid) -> String {
        format!("{}{}", KEY_PREFIX, uid.to_hex())
    }

    /// Tag over the secret, the uid and the serialized entry.
    fn compute_integrity_tag(&self, uid: &Uid, entry_json: &[u8]) -> [u8; 32] {
        compute_integrity_tag(&self.server_secret, uid, entry_json)
    }

    fn seal(&self, entry: &KeyStateCacheEntry) -> Result<String, StoreError> {
        let entry_json = serde_json::to_vec(entry)?;
        let tag = self.compute_integrity_tag(&entry.uid, &entry_json);
        let stored = StoredEntry {
            entry: entry.clone(),
            integrity_tag: hex::encode(tag),
        };
        Ok(serde_json::to_string(&stored)?)
    }

    fn open(&self, uid: &Uid, raw: &str) -> Result<KeyStateCacheEntry, StoreError> {
        let stored: StoredEntry = serde_json::from_str(raw)?;
        let entry_json = serde_json::to_vec(&stored.entry)?;
        let expected = self.compute_integrity_tag(uid, &entry_json);
        let actual = hex::decode(&stored.integrity_tag).map_err(|_| StoreError::IntegrityFailed)?;
        if stored.entry.uid != *uid || !constant_time_eq(&actual, &expected) {
            return Err(StoreError::IntegrityFailed);
        }
        Ok(stored.entry)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, uid: &Uid) -> Result<Option<KeyStateCacheEntry>, StoreError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(Self::key(uid)).await?;
        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match self.open(uid, &raw) {
            Ok(entry) => {
                debug!("Store hit for {}", uid);
                Ok(Some(entry))
            }
            Err(e) => {
                // Unreadable or tampered; drop it.
                warn!("Discarding stored key state for {}: {}", uid, e);
                let _: () = conn.del(Self::key(uid)).await?;
                Ok(None)
            }
        }
    }

    async fn put(&self, entry: &KeyStateCacheEntry) -> Result<(), StoreError> {
        let sealed = self.seal(entry)?;
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let _: () = conn.set(Self::key(&entry.uid), sealed).await?;
        Ok(())
    }

    async fn remove(&self, uid: &Uid) -> Result<(), StoreError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(Self::key(uid)).await?;
        Ok(())
    }
}

fn compute_integrity_tag(secret: &[u8; 32], uid: &Uid, entry_json: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(uid.to_hex().as_bytes());
    hasher.update(entry_json);
    hasher.finalize().into()
}

/// Constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
