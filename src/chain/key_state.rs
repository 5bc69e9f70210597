//! Key family state derived from a verified sigchain.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::chain::error::ChainLinkError;
use crate::chain::link::{ChainLink, ChainTail};
use crate::chain::outer::LinkType;
use crate::chain::types::{ChainOwner, Kid, Seqno, Uid};

/// The keys a user currently has, as stated by their sigchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFamilyState {
    pub uid: Uid,
    pub username: String,

    /// Key that signed the most recent eldest link.
    pub eldest_kid: Option<Kid>,

    /// Active signing keys, including the eldest key.
    pub sibkeys: BTreeSet<Kid>,

    /// Active encryption subkeys.
    pub subkeys: BTreeSet<Kid>,

    pub revoked_kids: BTreeSet<Kid>,
    pub revoked_sig_ids: BTreeSet<String>,

    /// Sig id of each delegating link, mapped to the key it delegated, so a
    /// revocation by sig id can retire the key.
    pub delegations: BTreeMap<String, Kid>,

    /// Newest link the state was derived from.
    pub tail: Option<ChainTail>,

    /// Links that arrived without a payload.
    pub stubbed_links: usize,
}

impl KeyFamilyState {
    pub fn empty(owner: &ChainOwner) -> Self {
        Self {
            uid: owner.uid,
            username: owner.username.clone(),
            eldest_kid: None,
            sibkeys: BTreeSet::new(),
            subkeys: BTreeSet::new(),
            revoked_kids: BTreeSet::new(),
            revoked_sig_ids: BTreeSet::new(),
            delegations: BTreeMap::new(),
            tail: None,
            stubbed_links: 0,
        }
    }

    /// Replay chain-verified links, oldest first, into a key family.
    pub fn from_links(owner: &ChainOwner, links: &[ChainLink]) -> Result<Self, ChainLinkError> {
        let mut state = Self::empty(owner);
        for link in links {
            if !link.is_chain_verified() {
                return Err(ChainLinkError::ServerChain(format!(
                    "link {} was not chain-verified",
                    link.seqno()
                )));
            }
            state.apply(link)?;
        }
        debug!(
            "Derived key family for {}: {} sibkeys, {} subkeys, tip {}",
            owner.username,
            state.sibkeys.len(),
            state.subkeys.len(),
            state.tip_seqno()
        );
        Ok(state)
    }

    fn apply(&mut self, link: &ChainLink) -> Result<(), ChainLinkError> {
        self.tail = Some(link.tail());

        let payload = match link.payload() {
            Some(p) => p,
            None => {
                self.stubbed_links += 1;
                return Ok(());
            }
        };

        match link.link_type() {
            Some(LinkType::ELDEST) => {
                // A new eldest key resets the whole family.
                self.sibkeys.clear();
                self.subkeys.clear();
                self.eldest_kid = link.kid().cloned();
                if let Some(kid) = link.kid() {
                    self.sibkeys.insert(kid.clone());
                }
            }
            Some(LinkType::SIBKEY) => {
                if let Some(kid) = payload.delegated_kid("sibkey")? {
                    self.delegate(link, kid, true);
                }
            }
            Some(LinkType::SUBKEY) => {
                if let Some(kid) = payload.delegated_kid("subkey")? {
                    self.delegate(link, kid, false);
                }
            }
            Some(LinkType::PGP_UPDATE) => {
                if let Some(kid) = payload.delegated_kid("pgp_update")? {
                    self.delegate(link, kid, true);
                }
            }
            _ => {}
        }

        if link.has_revocations() {
            for kid in payload.revoked_kids() {
                self.revoke_kid(kid);
            }
            for sig_id in payload.revoked_sig_ids() {
                if let Some(kid) = self.delegations.get(&sig_id).cloned() {
                    self.revoke_kid(kid);
                }
                self.revoked_sig_ids.insert(sig_id);
            }
        }
        Ok(())
    }

    fn delegate(&mut self, link: &ChainLink, kid: Kid, sibkey: bool) {
        if self.revoked_kids.contains(&kid) {
            return;
        }
        if let Some(sig_id) = link.sig_id() {
            self.delegations.insert(sig_id.to_string(), kid.clone());
        }
        if sibkey {
            self.sibkeys.insert(kid);
        } else {
            self.subkeys.insert(kid);
        }
    }

    fn revoke_kid(&mut self, kid: Kid) {
        self.sibkeys.remove(&kid);
        self.subkeys.remove(&kid);
        self.revoked_kids.insert(kid);
    }

    /// Seqno of the newest link, or genesis for an empty chain.
    pub fn tip_seqno(&self) -> Seqno {
        self.tail.map(|t| t.seqno).unwrap_or(Seqno::GENESIS)
    }

    pub fn is_active(&self, kid: &Kid) -> bool {
        self.sibkeys.contains(kid) || self.subkeys.contains(kid)
    }
}
