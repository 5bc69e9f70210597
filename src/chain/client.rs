//! Collaborators the key state cache depends on, and the loader that builds
//! a key family from the server's copy of a sigchain.
//!
//! The API and Merkle clients are traits so the transport can be swapped out
//! and tests can count calls.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;

use crate::chain::codec::import_link_value;
use crate::chain::error::{ApiError, ChainLinkError, LoadError};
use crate::chain::key_state::KeyFamilyState;
use crate::chain::link::{ChainLink, ChainTail};
use crate::chain::types::{ChainOwner, LinkId, Seqno, Uid};
use crate::chain::verifier::{compute_high_skips, verify_chain};

/// API status code for a user that has been deleted.
pub const STATUS_DELETED: i64 = 216;

/// API status code for a user that does not exist.
pub const STATUS_NOT_FOUND: i64 = 205;

/// Whether a request needs a logged-in session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRequirement {
    None,
    Optional,
    Required,
}

/// Server API access. Responses are JSON bodies including a `status` object.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn get_decode(
        &self,
        endpoint: &str,
        args: &[(&str, String)],
        session: SessionRequirement,
    ) -> Result<Value, ApiError>;

    async fn post_decode(
        &self,
        endpoint: &str,
        args: &[(&str, String)],
        session: SessionRequirement,
    ) -> Result<Value, ApiError>;
}

/// A user's entry in the Merkle tree: the chain tail it commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleLeaf {
    pub uid: Uid,
    pub seqno: Seqno,
    pub sig_id: Option<String>,
    pub chain_tip_hash: LinkId,
}

impl MerkleLeaf {
    pub fn tail(&self) -> ChainTail {
        ChainTail {
            seqno: self.seqno,
            link_id: self.chain_tip_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleRoot {
    pub seqno: Seqno,
    pub hash: Vec<u8>,
    pub ctime: DateTime<Utc>,
}

/// Lookups against the global Merkle tree.
#[async_trait]
pub trait MerkleClient: Send + Sync {
    async fn lookup_leaf_at_seqno(
        &self,
        uid: &Uid,
        seqno: Seqno,
    ) -> Result<(Option<MerkleLeaf>, MerkleRoot), ApiError>;

    async fn last_root(&self) -> Result<MerkleRoot, ApiError>;

    /// Look the leaf up at the most recent root.
    async fn lookup_leaf(&self, uid: &Uid) -> Result<(Option<MerkleLeaf>, MerkleRoot), ApiError> {
        let root = self.last_root().await?;
        self.lookup_leaf_at_seqno(uid, root.seqno).await
    }
}

/// A fully verified key state and the chain seqno it was derived at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedKeyState {
    pub state: KeyFamilyState,
    pub tip_seqno: Seqno,
}

/// Produces a fully verified key state for a user, from scratch.
#[async_trait]
pub trait KeyStateLoader: Send + Sync {
    async fn load_full(&self, uid: &Uid) -> Result<LoadedKeyState, LoadError>;
}

/// Map the `status` object of an API response to an error.
fn check_status(body: &Value, uid: &Uid) -> Result<(), ApiError> {
    let status = body
        .get("status")
        .ok_or_else(|| ApiError::Decode("response has no status".to_string()))?;
    let code = status.get("code").and_then(Value::as_i64).unwrap_or(0);
    match code {
        0 => Ok(()),
        STATUS_DELETED => Err(ApiError::UserDeleted),
        STATUS_NOT_FOUND => Err(ApiError::NotFound(uid.to_hex())),
        code => Err(ApiError::Status {
            code,
            desc: status
                .get("desc")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
    }
}

/// Loads a user's whole sigchain from the server, verifies it against the
/// Merkle tree, and derives the key family.
pub struct ServerChainLoader {
    api: Arc<dyn ApiClient>,
    merkle: Arc<dyn MerkleClient>,
    self_uid: Option<Uid>,
}

impl ServerChainLoader {
    pub fn new(api: Arc<dyn ApiClient>, merkle: Arc<dyn MerkleClient>) -> Self {
        Self {
            api,
            merkle,
            self_uid: None,
        }
    }

    /// The local user, whose links keep their full proof text.
    pub fn with_self_uid(mut self, uid: Uid) -> Self {
        self.self_uid = Some(uid);
        self
    }

    async fn lookup_owner(&self, uid: &Uid) -> Result<ChainOwner, ApiError> {
        let body = self
            .api
            .get_decode(
                "user/lookup",
                &[("uid", uid.to_hex())],
                SessionRequirement::Optional,
            )
            .await?;
        check_status(&body, uid)?;
        let username = body
            .pointer("/them/basics/username")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Decode("user/lookup returned no username".to_string()))?;
        Ok(ChainOwner::new(*uid, username))
    }

    async fn fetch_links(&self, uid: &Uid) -> Result<Vec<ChainLink>, LoadError> {
        let body = self
            .api
            .get_decode(
                "sig/get",
                &[("uid", uid.to_hex()), ("low", "0".to_string())],
                SessionRequirement::Optional,
            )
            .await?;
        check_status(&body, uid)?;
        let sigs = body
            .get("sigs")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::Decode("sig/get returned no sigs".to_string()))?;

        let mut links = Vec::with_capacity(sigs.len());
        for record in sigs {
            links.push(import_link_value(record, self.self_uid.as_ref())?);
        }
        Ok(links)
    }
}

/// The server may hand back links newer than the Merkle leaf, but it must
/// reach the leaf's seqno and the link there must hash to the leaf's tip.
fn check_against_merkle_leaf(
    links: &[ChainLink],
    leaf: Option<&MerkleLeaf>,
) -> Result<(), ChainLinkError> {
    let leaf = match leaf {
        Some(leaf) => leaf,
        None if links.is_empty() => return Ok(()),
        None => {
            return Err(ChainLinkError::ServerChain(format!(
                "server returned {} links but the Merkle tree has no leaf",
                links.len()
            )))
        }
    };
    match links.iter().find(|l| l.seqno() == leaf.seqno) {
        Some(link) if link.id() == leaf.chain_tip_hash => {
            debug!("Found chain tail advertised in Merkle tree @{}", leaf.seqno);
            Ok(())
        }
        Some(link) => Err(ChainLinkError::ServerChain(format!(
            "bad chain ID at seqno={}: {} != {}",
            leaf.seqno,
            link.id(),
            leaf.chain_tip_hash
        ))),
        None => Err(ChainLinkError::ServerChain(format!(
            "failed to reach ({}, {}) in server response",
            leaf.chain_tip_hash, leaf.seqno
        ))),
    }
}

#[async_trait]
impl KeyStateLoader for ServerChainLoader {
    async fn load_full(&self, uid: &Uid) -> Result<LoadedKeyState, LoadError> {
        info!("Full sigchain load for {}", uid);

        let (leaf, root) = self.merkle.lookup_leaf(uid).await?;
        debug!("Merkle root {} leaf {:?}", root.seqno, leaf.as_ref().map(|l| l.seqno));

        let owner = self.lookup_owner(uid).await?;
        let mut links = self.fetch_links(uid).await?;

        verify_chain(&mut links, &owner)?;
        compute_high_skips(&mut links)?;

        check_against_merkle_leaf(&links, leaf.as_ref()).map_err(|e| {
            warn!("Server chain for {} disagrees with its Merkle leaf: {}", uid, e);
            e
        })?;

        let state = KeyFamilyState::from_links(&owner, &links)?;
        let tip_seqno = state.tip_seqno();
        info!(
            "Loaded sigchain for {} ({} links, tip {})",
            owner.username,
            links.len(),
            tip_seqno
        );
        Ok(LoadedKeyState { state, tip_seqno })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_status_codes() {
        let uid = Uid::from_bytes([1; 16]);
        assert!(check_status(&json!({"status": {"code": 0}}), &uid).is_ok());
        assert_eq!(
            check_status(&json!({"status": {"code": 216}}), &uid),
            Err(ApiError::UserDeleted)
        );
        assert_eq!(
            check_status(&json!({"status": {"code": 205}}), &uid),
            Err(ApiError::NotFound(uid.to_hex()))
        );
        assert_eq!(
            check_status(&json!({"status": {"code": 100, "desc": "bad"}}), &uid),
            Err(ApiError::Status {
                code: 100,
                desc: "bad".to_string()
            })
        );
        assert!(check_status(&json!({}), &uid).is_err());
    }

    #[test]
    fn test_leaf_tail() {
        let leaf = MerkleLeaf {
            uid: Uid::from_bytes([1; 16]),
            seqno: Seqno(9),
            sig_id: None,
            chain_tip_hash: LinkId::from_bytes([2; 32]),
        };
        assert_eq!(leaf.tail().seqno, Seqno(9));
        assert_eq!(leaf.tail().link_id, LinkId::from_bytes([2; 32]));
    }

    fn leaf_at(seqno: u64, hash: LinkId) -> MerkleLeaf {
        MerkleLeaf {
            uid: Uid::from_bytes([1; 16]),
            seqno: Seqno(seqno),
            sig_id: None,
            chain_tip_hash: hash,
        }
    }

    #[test]
    fn test_merkle_leaf_check() {
        let links = crate::chain::link::test_links::linear_chain(3);

        for (i, link) in links.iter().enumerate() {
            let leaf = leaf_at(i as u64 + 1, link.id());
            assert!(check_against_merkle_leaf(&links, Some(&leaf)).is_ok());
        }
        assert!(check_against_merkle_leaf(&[], None).is_ok());

        let wrong = leaf_at(2, LinkId::from_bytes([0xEE; 32]));
        assert!(matches!(
            check_against_merkle_leaf(&links, Some(&wrong)),
            Err(ChainLinkError::ServerChain(_))
        ));
        let ahead = leaf_at(4, links[2].id());
        assert!(matches!(
            check_against_merkle_leaf(&links, Some(&ahead)),
            Err(ChainLinkError::ServerChain(_))
        ));
        assert!(matches!(
            check_against_merkle_leaf(&links, None),
            Err(ChainLinkError::ServerChain(_))
        ));
    }
}
