//! Identifier and value types shared across sigchain handling.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::chain::error::ChainLinkError;

/// Length in bytes of a link id (a SHA-256 digest).
pub const LINK_ID_LEN: usize = 32;

/// Length in bytes of a user id.
pub const UID_LEN: usize = 16;

/// KID version byte.
const KID_VERSION: u8 = 0x01;

/// KID trailer byte.
const KID_SUFFIX: u8 = 0x0a;

/// Content hash identifying one chain link.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId([u8; LINK_ID_LEN]);

impl LinkId {
    pub fn from_bytes(bytes: [u8; LINK_ID_LEN]) -> Self {
        LinkId(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ChainLinkError> {
        let arr: [u8; LINK_ID_LEN] = bytes.try_into().map_err(|_| {
            ChainLinkError::Malformed(format!("Bad link ID; wrong length: {}", bytes.len()))
        })?;
        Ok(LinkId(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, ChainLinkError> {
        let bytes = hex::decode(s)
            .map_err(|e| ChainLinkError::Malformed(format!("Bad link ID hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LINK_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkId({})", self.to_hex())
    }
}

impl Serialize for LinkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for LinkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        LinkId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Position of a link within a sigchain. Seqno 0 is the genesis sentinel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Seqno(pub u64);

impl Seqno {
    pub const GENESIS: Seqno = Seqno(0);

    /// The seqno immediately before this one, saturating at genesis.
    pub fn prev(self) -> Seqno {
        Seqno(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signature format version declared by a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigVersion {
    V1 = 1,
    V2 = 2,
}

impl SigVersion {
    pub fn from_i64(v: i64) -> Option<SigVersion> {
        match v {
            1 => Some(SigVersion::V1),
            2 => Some(SigVersion::V2),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Visibility class of a sigchain. Unknown values are carried through as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqType(pub u8);

impl SeqType {
    pub const NONE: SeqType = SeqType(0);
    pub const PUBLIC: SeqType = SeqType(1);
    pub const PRIVATE: SeqType = SeqType(2);
    pub const SEMIPRIVATE: SeqType = SeqType(3);
    pub const USER_PRIVATE_HIDDEN: SeqType = SeqType(16);
    pub const TEAM_PRIVATE_HIDDEN: SeqType = SeqType(17);

    /// Old links left the seq type unset; they are public.
    pub fn fixup(self) -> SeqType {
        if self == SeqType::NONE {
            SeqType::PUBLIC
        } else {
            self
        }
    }
}

/// Versioned binary key identifier: `0x01 || key type || key bytes || 0x0a`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kid(Vec<u8>);

impl Kid {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ChainLinkError> {
        if bytes.len() < 3 {
            return Err(ChainLinkError::Malformed(format!(
                "KID too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != KID_VERSION {
            return Err(ChainLinkError::Malformed(format!(
                "Unsupported KID version: {}",
                bytes[0]
            )));
        }
        if bytes[bytes.len() - 1] != KID_SUFFIX {
            return Err(ChainLinkError::Malformed("KID has bad trailer".to_string()));
        }
        Ok(Kid(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, ChainLinkError> {
        let bytes = hex::decode(s)
            .map_err(|e| ChainLinkError::Malformed(format!("Bad KID hex: {}", e)))?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn key_type(&self) -> u8 {
        self.0[1]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kid({})", self.to_hex())
    }
}

impl Serialize for Kid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Kid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Kid::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// User identifier (16 bytes, hex on the wire).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uid([u8; UID_LEN]);

impl Uid {
    pub fn from_bytes(bytes: [u8; UID_LEN]) -> Self {
        Uid(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, ChainLinkError> {
        let bytes =
            hex::decode(s).map_err(|e| ChainLinkError::Malformed(format!("Bad UID hex: {}", e)))?;
        let arr: [u8; UID_LEN] = bytes.try_into().map_err(|_| {
            ChainLinkError::Malformed(format!("Bad UID; wrong length in '{}'", s))
        })?;
        Ok(Uid(arr))
    }

    /// The all-zero UID, never a valid identity.
    pub fn nil() -> Self {
        Uid([0u8; UID_LEN])
    }

    pub fn is_nil(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.to_hex())
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uid::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Pointer to the most recent "high" link before a given link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HighSkip {
    pub seqno: Seqno,
    pub hash: Option<LinkId>,
}

impl HighSkip {
    pub fn new(seqno: Seqno, hash: Option<LinkId>) -> Self {
        Self { seqno, hash }
    }

    /// The high skip every chain starts from: seqno 0 and no hash.
    pub fn genesis() -> Self {
        Self {
            seqno: Seqno::GENESIS,
            hash: None,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.seqno == Seqno::GENESIS && self.hash.is_none()
    }

    /// Check a claimed high skip against the one computed by walking the chain.
    pub fn assert_equals_expected(&self, expected: &HighSkip) -> Result<(), ChainLinkError> {
        if self.seqno != expected.seqno {
            return Err(ChainLinkError::HighSkipSeqnoMismatch(format!(
                "expected {}, got {}",
                expected.seqno, self.seqno
            )));
        }
        if self.hash != expected.hash {
            return Err(ChainLinkError::HighSkipHashMismatch(format!(
                "expected {:?}, got {:?}",
                expected.hash, self.hash
            )));
        }
        Ok(())
    }
}

/// The identity a chain is declared to belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOwner {
    pub uid: Uid,
    pub username: String,
}

impl ChainOwner {
    pub fn new(uid: Uid, username: impl Into<String>) -> Self {
        Self {
            uid,
            username: username.into(),
        }
    }

    /// Usernames compare case-insensitively.
    pub fn username_matches(&self, other: &str) -> bool {
        self.username.eq_ignore_ascii_case(other)
    }
}
