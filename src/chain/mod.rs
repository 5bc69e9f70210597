//! Sigchain link import, verification and key state caching.
//!
//! A sigchain is a user's hash-linked sequence of signed statements about
//! their keys. Each link commits to its predecessor, and the newest link is
//! anchored in the global Merkle tree. This module decodes links from the
//! server's wire formats, checks that they form one unbroken chain, folds
//! them into a key family, and caches the result until the Merkle tree shows
//! the chain has moved.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────┐   ┌────────────────┐
//! │ raw JSON │──▶│ import_link  │──▶│ verify_chain  │──▶│ KeyFamilyState │
//! │ records  │   │ (codec)      │   │ (verifier)    │   │ (key_state)    │
//! └──────────┘   └──────────────┘   └───────────────┘   └────────────────┘
//!                   │        │                                   │
//!                   ▼        ▼                                   ▼
//!            ┌─────────┐ ┌─────────────┐                ┌────────────────┐
//!            │ link_id │ │ OuterLinkV2 │                │ KeyStateCache  │
//!            │ fixups  │ │ assertions  │                │ (+ StateStore) │
//!            └─────────┘ └─────────────┘                └────────────────┘
//!                                                          │          │
//!                                                          ▼          ▼
//!                                              ┌──────────────┐ ┌──────────────┐
//!                                              │KeyStateLoader│ │ MerkleClient │
//!                                              └──────────────┘ └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use sigchain::chain::{CacheSettings, KeyStateCache, ServerChainLoader};
//!
//! let settings = CacheSettings::from_env();
//! let loader = Arc::new(ServerChainLoader::new(api.clone(), merkle.clone()));
//! let cache = KeyStateCache::from_settings(loader, merkle, &settings)?;
//!
//! let outcome = cache.load(&uid).await?;
//! if outcome.state.is_active(&kid) { /* ... */ }
//! ```

pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod key_state;
pub mod link;
pub mod link_id;
pub mod outer;
pub mod payload;
pub mod pgp;
pub mod sig_id;
pub mod store;
pub mod types;
pub mod verifier;

pub use cache::{Clock, KeyStateCache, KeyStateCacheEntry, LoadOutcome, SystemClock};
pub use client::{
    ApiClient, KeyStateLoader, LoadedKeyState, MerkleClient, MerkleLeaf, MerkleRoot,
    ServerChainLoader, SessionRequirement,
};
pub use codec::{import_link, import_link_value, WireKind};
pub use config::CacheSettings;
pub use error::{ApiError, ChainLinkError, LoadError, StoreError};
pub use key_state::KeyFamilyState;
pub use link::{ChainLink, ChainTail};
pub use link_id::{compute_link_id, compute_link_id_with_fixups};
pub use outer::{ExpectedOuterFields, LinkType, OuterLinkV2};
pub use store::{MemoryStateStore, RedisStateStore, StateStore};
pub use types::{ChainOwner, HighSkip, Kid, LinkId, SeqType, Seqno, SigVersion, Uid};
pub use verifier::{check_freshness, compute_high_skips, is_dense, verify_chain};
