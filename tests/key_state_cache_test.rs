mod support;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use futures_util::future::join_all;

use sigchain::chain::{
    ApiError, CacheSettings, ChainLinkError, ChainOwner, ChainTail, KeyFamilyState, KeyStateCache,
    KeyStateLoader, LinkId, LoadError, LoadedKeyState, MemoryStateStore, Seqno,
    ServerChainLoader, StateStore, Uid,
};
use support::{records, uid, ChainBuilder, ManualClock, MockApi, MockMerkle, USERNAME};

/// Loader that fabricates a state at a settable tip and counts calls.
struct CountingLoader {
    tip: AtomicU64,
    calls: AtomicUsize,
    fail: AtomicBool,
    delay_ms: u64,
}

impl CountingLoader {
    fn new(tip: u64) -> Self {
        Self {
            tip: AtomicU64::new(tip),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay_ms: 0,
        }
    }

    fn slow(tip: u64, delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::new(tip)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn tip_hash(seqno: u64) -> LinkId {
    LinkId::from_bytes([seqno as u8; 32])
}

#[async_trait]
impl KeyStateLoader for CountingLoader {
    async fn load_full(&self, uid: &Uid) -> Result<LoadedKeyState, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(StdDuration::from_millis(self.delay_ms)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("connection reset".to_string()).into());
        }
        let seqno = self.tip.load(Ordering::SeqCst);
        let mut state = KeyFamilyState::empty(&ChainOwner::new(*uid, USERNAME));
        state.tail = Some(ChainTail {
            seqno: Seqno(seqno),
            link_id: tip_hash(seqno),
        });
        Ok(LoadedKeyState {
            state,
            tip_seqno: Seqno(seqno),
        })
    }
}

struct Fixture {
    loader: Arc<CountingLoader>,
    merkle: Arc<MockMerkle>,
    clock: Arc<ManualClock>,
    cache: KeyStateCache,
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn fixture(loader: CountingLoader) -> Fixture {
    let tip = loader.tip.load(Ordering::SeqCst);
    let loader = Arc::new(loader);
    let merkle = Arc::new(MockMerkle::new(tip, tip_hash(tip)));
    let clock = Arc::new(ManualClock::new(t0()));
    let settings = CacheSettings::default().with_freshness(Duration::hours(1));
    let cache = KeyStateCache::new(loader.clone(), merkle.clone(), &settings)
        .with_clock(clock.clone());
    Fixture {
        loader,
        merkle,
        clock,
        cache,
    }
}

#[tokio::test]
async fn test_miss_then_hit() {
    let f = fixture(CountingLoader::new(5));

    let first = f.cache.load(&uid()).await.unwrap();
    assert!(first.was_full_load);
    assert_eq!(f.loader.calls(), 1);

    f.clock.set(t0() + Duration::minutes(30));
    let second = f.cache.load(&uid()).await.unwrap();
    assert!(!second.was_full_load);
    assert_eq!(second.state, first.state);
    assert_eq!(f.loader.calls(), 1);
    assert_eq!(f.merkle.calls(), 0);
}

#[tokio::test]
async fn test_stale_unchanged_refreshes() {
    let f = fixture(CountingLoader::new(5));
    f.cache.load(&uid()).await.unwrap();

    let later = t0() + Duration::hours(2);
    f.clock.set(later);
    let outcome = f.cache.load(&uid()).await.unwrap();

    assert!(!outcome.was_full_load);
    assert_eq!(f.merkle.calls(), 1);
    assert_eq!(f.loader.calls(), 1);
    let entry = f.cache.peek(&uid()).unwrap();
    assert_eq!(entry.cached_at, later);
    assert_eq!(entry.source_seqno, Seqno(5));
}

#[tokio::test]
async fn test_stale_advanced_reloads() {
    let f = fixture(CountingLoader::new(5));
    f.cache.load(&uid()).await.unwrap();

    f.loader.tip.store(6, Ordering::SeqCst);
    f.merkle.set_tip(6, tip_hash(6));
    f.clock.set(t0() + Duration::hours(2));
    let outcome = f.cache.load(&uid()).await.unwrap();

    assert!(outcome.was_full_load);
    assert_eq!(outcome.state.tip_seqno(), Seqno(6));
    assert_eq!(f.loader.calls(), 2);
    assert_eq!(f.cache.peek(&uid()).unwrap().source_seqno, Seqno(6));
}

#[tokio::test]
async fn test_worked_example() {
    let f = fixture(CountingLoader::new(5));
    f.cache.load(&uid()).await.unwrap();
    assert_eq!(f.cache.peek(&uid()).unwrap().source_seqno, Seqno(5));

    // Two hours on, the tip has not moved.
    f.clock.set(t0() + Duration::hours(2));
    assert!(!f.cache.load(&uid()).await.unwrap().was_full_load);
    assert_eq!(f.cache.peek(&uid()).unwrap().cached_at, t0() + Duration::hours(2));

    // Within the window of the refresh: no lookups at all.
    f.clock.set(t0() + Duration::minutes(150));
    assert!(!f.cache.load(&uid()).await.unwrap().was_full_load);
    assert_eq!(f.merkle.calls(), 1);

    // Three hours on, a new link has landed.
    f.loader.tip.store(6, Ordering::SeqCst);
    f.merkle.set_tip(6, tip_hash(6));
    f.clock.set(t0() + Duration::hours(3) + Duration::minutes(1));
    assert!(f.cache.load(&uid()).await.unwrap().was_full_load);
    assert_eq!(f.cache.peek(&uid()).unwrap().source_seqno, Seqno(6));
    assert_eq!(f.loader.calls(), 2);
}

#[tokio::test]
async fn test_returned_states_are_independent() {
    let f = fixture(CountingLoader::new(5));
    let mut first = f.cache.load(&uid()).await.unwrap().state;
    first.username = "mallory".to_string();
    first.sibkeys.clear();
    first.tail = None;

    let second = f.cache.load(&uid()).await.unwrap().state;
    assert_eq!(second.username, USERNAME);
    assert_eq!(second.tip_seqno(), Seqno(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_collapse() {
    let f = Arc::new(fixture(CountingLoader::slow(5, 50)));

    let loads = (0..16).map(|_| {
        let f = f.clone();
        tokio::spawn(async move { f.cache.load(&uid()).await })
    });
    let results = join_all(loads).await;

    let mut full_loads = 0;
    for result in results {
        if result.unwrap().unwrap().was_full_load {
            full_loads += 1;
        }
    }
    assert_eq!(full_loads, 1);
    assert_eq!(f.loader.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_load_leaves_no_trace() {
    let f = fixture(CountingLoader::slow(5, 200));

    let timed_out = tokio::time::timeout(StdDuration::from_millis(20), f.cache.load(&uid())).await;
    assert!(timed_out.is_err());
    assert!(f.cache.peek(&uid()).is_none());

    // The abandoned load released the user's lock.
    let outcome = tokio::time::timeout(StdDuration::from_secs(5), f.cache.load(&uid()))
        .await
        .expect("second load hung")
        .unwrap();
    assert!(outcome.was_full_load);
    assert_eq!(f.loader.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_users_load_independently() {
    let f = Arc::new(fixture(CountingLoader::slow(5, 20)));
    let loads = (1..=4u8).map(|b| {
        let f = f.clone();
        tokio::spawn(async move { f.cache.load(&Uid::from_bytes([b; 16])).await })
    });
    for result in join_all(loads).await {
        assert!(result.unwrap().unwrap().was_full_load);
    }
    assert_eq!(f.loader.calls(), 4);
    assert_eq!(f.cache.len(), 4);
}

#[tokio::test]
async fn test_nil_uid_is_invalid() {
    let f = fixture(CountingLoader::new(5));
    assert!(matches!(
        f.cache.load(&Uid::nil()).await,
        Err(LoadError::InvalidArgument(_))
    ));
    assert_eq!(f.loader.calls(), 0);
    assert_eq!(f.merkle.calls(), 0);
}

#[tokio::test]
async fn test_failures_propagate_without_writes() {
    let f = fixture(CountingLoader::new(5));
    f.loader.fail.store(true, Ordering::SeqCst);
    assert!(matches!(
        f.cache.load(&uid()).await,
        Err(LoadError::Api(ApiError::Transport(_)))
    ));
    assert!(f.cache.peek(&uid()).is_none());

    // A failed reconciliation leaves the old entry untouched.
    f.loader.fail.store(false, Ordering::SeqCst);
    f.cache.load(&uid()).await.unwrap();
    let before = f.cache.peek(&uid()).unwrap();
    *f.merkle.fail.lock().unwrap() = true;
    f.clock.set(t0() + Duration::hours(2));
    assert!(f.cache.load(&uid()).await.is_err());
    assert_eq!(f.cache.peek(&uid()).unwrap(), before);
}

#[tokio::test]
async fn test_store_write_through_and_warm_start() {
    let f = fixture(CountingLoader::new(5));
    let store = Arc::new(MemoryStateStore::new());
    let settings = CacheSettings::default().with_freshness(Duration::hours(1));

    let cache = KeyStateCache::new(f.loader.clone(), f.merkle.clone(), &settings)
        .with_clock(f.clock.clone())
        .with_store(store.clone());
    cache.load(&uid()).await.unwrap();
    assert_eq!(store.get(&uid()).await.unwrap().unwrap().source_seqno, Seqno(5));

    // A new cache over the same store starts warm.
    let restarted = KeyStateCache::new(f.loader.clone(), f.merkle.clone(), &settings)
        .with_clock(f.clock.clone())
        .with_store(store.clone());
    assert!(!restarted.load(&uid()).await.unwrap().was_full_load);
    assert_eq!(f.loader.calls(), 1);
}

#[tokio::test]
async fn test_server_chain_loader_end_to_end() {
    let links = ChainBuilder::linear(3).build();
    let tip = links[2].link_id;
    let api = Arc::new(MockApi::new(USERNAME, records(&links)));
    let merkle = Arc::new(MockMerkle::new(3, tip));
    let loader = Arc::new(ServerChainLoader::new(api.clone(), merkle.clone()));

    let clock = Arc::new(ManualClock::new(t0()));
    let cache = KeyStateCache::new(loader, merkle.clone(), &CacheSettings::default())
        .with_clock(clock.clone());

    let outcome = cache.load(&uid()).await.unwrap();
    assert!(outcome.was_full_load);
    assert_eq!(outcome.state.tip_seqno(), Seqno(3));
    assert_eq!(outcome.state.tail.unwrap().link_id, tip);
    assert_eq!(outcome.state.username, USERNAME);
}

#[tokio::test]
async fn test_server_chain_loader_accepts_links_past_leaf() {
    // Links posted after the Merkle root was built are fine, as long as the
    // link at the leaf's seqno is the one the tree committed to.
    let links = ChainBuilder::linear(3).build();
    let api = Arc::new(MockApi::new(USERNAME, records(&links)));
    let merkle = Arc::new(MockMerkle::new(2, links[1].link_id));
    let loader = ServerChainLoader::new(api.clone(), merkle.clone());

    let loaded = loader.load_full(&uid()).await.unwrap();
    assert_eq!(loaded.tip_seqno, Seqno(3));
    assert_eq!(loaded.state.tail.unwrap().link_id, links[2].link_id);

    merkle.set_tip(2, links[0].link_id);
    assert!(matches!(
        loader.load_full(&uid()).await,
        Err(LoadError::Chain(ChainLinkError::ServerChain(_)))
    ));

    // A user with links must have a leaf.
    merkle.set_tip(0, links[0].link_id);
    assert!(matches!(
        loader.load_full(&uid()).await,
        Err(LoadError::Chain(ChainLinkError::ServerChain(_)))
    ));
}

#[tokio::test]
async fn test_server_chain_loader_errors() {
    let links = ChainBuilder::linear(3).build();

    // The Merkle tree is ahead of what the server handed back.
    let api = Arc::new(MockApi::new(USERNAME, records(&links[..2])));
    let merkle = Arc::new(MockMerkle::new(3, links[2].link_id));
    let loader = ServerChainLoader::new(api, merkle);
    assert!(matches!(
        loader.load_full(&uid()).await,
        Err(LoadError::Chain(_))
    ));

    // Wrong tail at the same seqno.
    let api = Arc::new(MockApi::new(USERNAME, records(&links)));
    let merkle = Arc::new(MockMerkle::new(3, links[1].link_id));
    let loader = ServerChainLoader::new(api, merkle);
    assert!(loader.load_full(&uid()).await.is_err());

    // Deleted and missing users.
    let api = Arc::new(MockApi::new(USERNAME, records(&links)));
    *api.status.lock().unwrap() = 216;
    let merkle = Arc::new(MockMerkle::new(3, links[2].link_id));
    let loader = ServerChainLoader::new(api.clone(), merkle.clone());
    assert!(loader.load_full(&uid()).await.unwrap_err().is_deleted());
    *api.status.lock().unwrap() = 205;
    assert!(loader.load_full(&uid()).await.unwrap_err().is_not_found());
}
