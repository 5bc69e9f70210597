//! A single decoded sigchain link.

use serde::{Deserialize, Serialize};

use crate::chain::outer::{LinkType, SignedOuterLink};
use crate::chain::payload::PayloadJson;
use crate::chain::types::{HighSkip, Kid, LinkId, SeqType, Seqno, SigVersion, Uid};

/// The (seqno, link id) pair that identifies the newest link of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainTail {
    pub seqno: Seqno,
    pub link_id: LinkId,
}

/// Fields unpacked from a link's payload. Absent for stubbed links.
#[derive(Debug, Clone, PartialEq)]
pub struct UnpackedPayload {
    pub payload: PayloadJson,
    pub uid: Uid,
    pub username: String,
    pub type_name: String,
    pub ctime: i64,
    pub expire_in: i64,
    pub kid: Option<Kid>,
    pub eldest_kid: Option<Kid>,
    pub has_revocations: bool,
    pub proof_text: Option<String>,
    pub first_appeared_merkle_seqno_unverified: Option<Seqno>,
}

/// One decoded chain link.
///
/// Immutable once imported, apart from the verification flags the verifier
/// sets. A stubbed link carries only its outer envelope; everything that
/// lives in the payload is `None` for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainLink {
    pub(crate) id: LinkId,
    pub(crate) seqno: Seqno,
    pub(crate) prev: Option<LinkId>,
    pub(crate) sig_version: SigVersion,
    pub(crate) seq_type: SeqType,
    pub(crate) ignore_if_unsupported: bool,
    pub(crate) high_skip: Option<HighSkip>,
    pub(crate) link_type: Option<LinkType>,
    pub(crate) kid: Option<Kid>,
    pub(crate) sig: Option<String>,
    pub(crate) sig_id: Option<String>,
    pub(crate) outer: Option<SignedOuterLink>,
    pub(crate) unpacked: Option<UnpackedPayload>,
    pub(crate) hash_verified: bool,
    pub(crate) payload_verified: bool,
    pub(crate) chain_verified: bool,
    pub(crate) computed_high_skip: Option<HighSkip>,
}

impl ChainLink {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn seqno(&self) -> Seqno {
        self.seqno
    }

    pub fn prev(&self) -> Option<LinkId> {
        self.prev
    }

    pub fn sig_version(&self) -> SigVersion {
        self.sig_version
    }

    pub fn seq_type(&self) -> SeqType {
        self.seq_type
    }

    pub fn ignore_if_unsupported(&self) -> bool {
        self.ignore_if_unsupported
    }

    pub fn high_skip(&self) -> Option<HighSkip> {
        self.high_skip
    }

    /// V2 type code. `None` for v1 links whose type name has no code.
    pub fn link_type(&self) -> Option<LinkType> {
        self.link_type
    }

    /// Signing key id, when known.
    pub fn kid(&self) -> Option<&Kid> {
        self.kid.as_ref()
    }

    pub fn sig(&self) -> Option<&str> {
        self.sig.as_deref()
    }

    pub fn sig_id(&self) -> Option<&str> {
        self.sig_id.as_deref()
    }

    pub fn outer(&self) -> Option<&SignedOuterLink> {
        self.outer.as_ref()
    }

    pub fn unpacked(&self) -> Option<&UnpackedPayload> {
        self.unpacked.as_ref()
    }

    pub fn payload(&self) -> Option<&PayloadJson> {
        self.unpacked.as_ref().map(|u| &u.payload)
    }

    pub fn is_stubbed(&self) -> bool {
        self.unpacked.is_none()
    }

    pub fn uid(&self) -> Option<Uid> {
        self.unpacked.as_ref().map(|u| u.uid)
    }

    pub fn username(&self) -> Option<&str> {
        self.unpacked.as_ref().map(|u| u.username.as_str())
    }

    pub fn type_name(&self) -> Option<&str> {
        self.unpacked.as_ref().map(|u| u.type_name.as_str())
    }

    pub fn ctime(&self) -> Option<i64> {
        self.unpacked.as_ref().map(|u| u.ctime)
    }

    pub fn etime(&self) -> Option<i64> {
        self.unpacked.as_ref().map(|u| u.ctime + u.expire_in)
    }

    pub fn eldest_kid(&self) -> Option<&Kid> {
        self.unpacked.as_ref().and_then(|u| u.eldest_kid.as_ref())
    }

    pub fn has_revocations(&self) -> bool {
        self.unpacked
            .as_ref()
            .map(|u| u.has_revocations)
            .unwrap_or(false)
    }

    pub fn is_hash_verified(&self) -> bool {
        self.hash_verified
    }

    pub fn is_payload_verified(&self) -> bool {
        self.payload_verified
    }

    pub fn is_chain_verified(&self) -> bool {
        self.chain_verified
    }

    /// The high skip this link should carry, as recomputed by walking the
    /// chain forward. Unset until high skips are computed.
    pub fn computed_high_skip(&self) -> Option<HighSkip> {
        self.computed_high_skip
    }

    pub(crate) fn mark_chain_verified(&mut self) {
        self.chain_verified = true;
    }

    pub fn tail(&self) -> ChainTail {
        ChainTail {
            seqno: self.seqno,
            link_id: self.id,
        }
    }

    /// What this link says about its predecessor: the seqno just before it
    /// and its `prev` hash.
    pub fn prev_expectation(&self) -> HighSkip {
        HighSkip::new(self.seqno.prev(), self.prev)
    }

    /// High links mark points a later link may skip back to: the chain start,
    /// eldest links, and links that add or revoke keys.
    pub fn is_high(&self) -> bool {
        if self.seqno == Seqno(1) {
            return true;
        }
        match self.link_type {
            Some(t) => {
                t == LinkType::ELDEST
                    || t == LinkType::SIBKEY
                    || t == LinkType::PGP_UPDATE
                    || t.is_revoking()
            }
            None => false,
        }
    }

}
