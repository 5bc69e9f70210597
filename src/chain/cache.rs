//! Freshness-aware cache of verified key states.
//!
//! A cached state is served as-is while it is younger than the freshness
//! window. Past the window, the Merkle tree is asked for the user's current
//! chain tip: if it has not moved the entry is simply re-stamped, otherwise
//! the chain is reloaded in full. Loads for one user are serialized through a
//! per-user async mutex; loads for different users run independently. A
//! user's mutex lives in the lock table only while some load holds or waits
//! on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::chain::client::{KeyStateLoader, MerkleClient};
use crate::chain::config::CacheSettings;
use crate::chain::error::{LoadError, StoreError};
use crate::chain::key_state::KeyFamilyState;
use crate::chain::store::{RedisStateStore, StateStore};
use crate::chain::types::{Seqno, Uid};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One cached key state.
///
/// `source_seqno` is the verified chain tip at the time `cached_at` was last
/// set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStateCacheEntry {
    pub uid: Uid,
    pub state: KeyFamilyState,
    pub cached_at: DateTime<Utc>,
    pub source_seqno: Seqno,
}

/// Result of [`KeyStateCache::load`]. The state is the caller's own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub state: KeyFamilyState,
    pub was_full_load: bool,
}

type UidLock = Arc<tokio::sync::Mutex<()>>;
type LockTable = Mutex<HashMap<Uid, UidLock>>;

/// A caller's claim on one user's lock. Dropping the last claim removes the
/// lock from the table, whether the load finished or was cancelled.
struct LockSlot<'a> {
    table: &'a LockTable,
    uid: Uid,
    lock: UidLock,
}

impl<'a> LockSlot<'a> {
    fn claim(table: &'a LockTable, uid: &Uid) -> Self {
        let mut locks = table.lock().unwrap_or_else(|e| e.into_inner());
        let lock = locks.entry(*uid).or_default().clone();
        Self {
            table,
            uid: *uid,
            lock,
        }
    }
}

impl Drop for LockSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.table.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the table, one here.
        let last = locks
            .get(&self.uid)
            .map(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2)
            .unwrap_or(false);
        if last {
            locks.remove(&self.uid);
        }
    }
}

pub struct KeyStateCache {
    loader: Arc<dyn KeyStateLoader>,
    merkle: Arc<dyn MerkleClient>,
    store: Option<Arc<dyn StateStore>>,
    clock: Arc<dyn Clock>,
    freshness: Duration,

    entries: Mutex<HashMap<Uid, KeyStateCacheEntry>>,
    locks: LockTable,
}

impl KeyStateCache {
    pub fn new(
        loader: Arc<dyn KeyStateLoader>,
        merkle: Arc<dyn MerkleClient>,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            loader,
            merkle,
            store: None,
            clock: Arc::new(SystemClock),
            freshness: settings.freshness(),
            entries: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build a cache from settings, backed by Redis when both a URL and a
    /// store secret are configured.
    pub fn from_settings(
        loader: Arc<dyn KeyStateLoader>,
        merkle: Arc<dyn MerkleClient>,
        settings: &CacheSettings,
    ) -> Result<Self, LoadError> {
        let cache = Self::new(loader, merkle, settings);
        match (&settings.redis_url, settings.store_secret) {
            (Some(url), Some(secret)) => {
                let client = redis::Client::open(url.as_str()).map_err(StoreError::from)?;
                info!("Key state store enabled");
                Ok(cache.with_store(Arc::new(RedisStateStore::new(Arc::new(client), secret))))
            }
            _ => Ok(cache),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Load the key state for `uid`, reusing the cached copy when it is
    /// fresh or when the Merkle tree shows the chain has not moved.
    pub async fn load(&self, uid: &Uid) -> Result<LoadOutcome, LoadError> {
        if uid.is_nil() {
            return Err(LoadError::InvalidArgument(
                "cannot load key state for an empty uid".to_string(),
            ));
        }

        let slot = LockSlot::claim(&self.locks, uid);
        let _guard = slot.lock.lock().await;

        let entry = match self.get_entry(uid) {
            Some(entry) => entry,
            None => match self.from_store(uid).await {
                Some(entry) => {
                    self.put_entry(entry.clone());
                    entry
                }
                None => {
                    debug!("Key state cache miss for {}", uid);
                    return self.full_load(uid).await;
                }
            },
        };

        let now = self.clock.now();
        if self.is_fresh(&entry, now) {
            debug!("Key state cache hit for {} (seqno {})", uid, entry.source_seqno);
            return Ok(LoadOutcome {
                state: entry.state,
                was_full_load: false,
            });
        }

        let (leaf, _root) = self.merkle.lookup_leaf(uid).await?;
        match leaf {
            Some(leaf) if leaf.seqno == entry.source_seqno => {
                debug!(
                    "Key state for {} is stale but unchanged at seqno {}; refreshing",
                    uid, entry.source_seqno
                );
                let refreshed = KeyStateCacheEntry {
                    cached_at: self.clock.now(),
                    ..entry
                };
                self.put_entry(refreshed.clone());
                self.write_through(&refreshed).await;
                Ok(LoadOutcome {
                    state: refreshed.state,
                    was_full_load: false,
                })
            }
            leaf => {
                info!(
                    "Key state for {} moved from seqno {} to {:?}; reloading",
                    uid,
                    entry.source_seqno,
                    leaf.map(|l| l.seqno)
                );
                self.full_load(uid).await
            }
        }
    }

    fn is_fresh(&self, entry: &KeyStateCacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.cached_at <= self.freshness
    }

    async fn full_load(&self, uid: &Uid) -> Result<LoadOutcome, LoadError> {
        let loaded = self.loader.load_full(uid).await?;
        let entry = KeyStateCacheEntry {
            uid: *uid,
            state: loaded.state.clone(),
            cached_at: self.clock.now(),
            source_seqno: loaded.tip_seqno,
        };
        self.put_entry(entry.clone());
        self.write_through(&entry).await;
        Ok(LoadOutcome {
            state: loaded.state,
            was_full_load: true,
        })
    }

    fn get_entry(&self, uid: &Uid) -> Option<KeyStateCacheEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(uid).cloned()
    }

    fn put_entry(&self, entry: KeyStateCacheEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(entry.uid, entry);
    }

    async fn from_store(&self, uid: &Uid) -> Option<KeyStateCacheEntry> {
        let store = self.store.as_ref()?;
        match store.get(uid).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to read stored key state for {}: {}", uid, e);
                None
            }
        }
    }

    async fn write_through(&self, entry: &KeyStateCacheEntry) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put(entry).await {
                warn!("Failed to store key state for {}: {}", entry.uid, e);
            }
        }
    }

    /// Copy of the cached entry, without any freshness check.
    pub fn peek(&self, uid: &Uid) -> Option<KeyStateCacheEntry> {
        self.get_entry(uid)
    }

    /// Drop one user's cached state. The secondary store is left alone.
    pub fn evict(&self, uid: &Uid) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(uid).is_some()
    }

    /// Drop one user's cached state here and in the secondary store.
    pub async fn forget(&self, uid: &Uid) -> Result<bool, StoreError> {
        let evicted = self.evict(uid);
        if let Some(store) = &self.store {
            store.remove(uid).await?;
        }
        Ok(evicted)
    }

    /// Drop every cached state.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl std::fmt::Debug for KeyStateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStateCache")
            .field("freshness", &self.freshness)
            .field("entries", &self.len())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}
