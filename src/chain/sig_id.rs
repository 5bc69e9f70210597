//! Signature ids and the NaCl signature packet they are computed over.

use std::fmt;

use rmpv::Value;
use sha2::{Digest, Sha256};

use crate::chain::error::ChainLinkError;
use crate::chain::outer::encode_value;
use crate::chain::types::Kid;

/// Signature algorithm code for EdDSA over the payload.
const SIG_TYPE_EDDSA: u8 = 32;

/// Hash algorithm code carried in NaCl packets (SHA-512).
const HASH_TYPE_SHA512: u8 = 10;

/// Packet tag for a signature.
const TAG_SIGNATURE: u16 = 514;

const PACKET_VERSION: u8 = 1;

pub const ED25519_SIG_LEN: usize = 64;

/// Hash of the signature body, before the type-dependent suffix is attached.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SigIdBase([u8; 32]);

impl SigIdBase {
    /// Hash a signature body.
    pub fn compute(body: &[u8]) -> Self {
        let digest = Sha256::digest(body);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        SigIdBase(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_sig_id(&self, params: &SigIdSuffixParameters) -> String {
        format!("{}{}", self.to_hex(), params.suffix())
    }

    /// PGP and early NaCl links always use the legacy `0f` suffix.
    pub fn to_sig_id_legacy(&self) -> String {
        format!("{}0f", self.to_hex())
    }
}

impl fmt::Debug for SigIdBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigIdBase({})", self.to_hex())
    }
}

/// Inputs that decide which suffix a sig id gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigIdSuffixParameters {
    pub is_user_sig: bool,
    pub is_wallet_stellar: bool,
    pub sig_version: u8,
}

impl SigIdSuffixParameters {
    /// Team links have type names starting with `teams.`; everything else is
    /// a user signature.
    pub fn from_type_and_version(link_type: &str, sig_version: u8) -> Self {
        Self {
            is_user_sig: !link_type.starts_with("teams."),
            is_wallet_stellar: link_type == "wallet.stellar",
            sig_version,
        }
    }

    pub fn suffix(&self) -> &'static str {
        if self.is_wallet_stellar && self.sig_version == 2 {
            return "22";
        }
        if self.is_user_sig {
            return "0f";
        }
        match self.sig_version {
            2 => "22",
            3 => "38",
            _ => "0f",
        }
    }
}

/// A detached NaCl signature over a payload, in the packet form the sig id is
/// computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaclSigInfo {
    pub kid: Kid,
    pub payload: Vec<u8>,
    pub sig: [u8; ED25519_SIG_LEN],
}

impl NaclSigInfo {
    /// Encode the signature packet as a msgpack map with keys in sorted order.
    pub fn encode_packet(&self) -> Result<Vec<u8>, ChainLinkError> {
        let key = |s: &str| Value::from(s);
        let body = Value::Map(vec![
            (key("detached"), Value::Boolean(true)),
            (key("hash_type"), Value::from(HASH_TYPE_SHA512)),
            (key("key"), Value::Binary(self.kid.as_bytes().to_vec())),
            (key("payload"), Value::Binary(self.payload.clone())),
            (key("sig"), Value::Binary(self.sig.to_vec())),
            (key("sig_type"), Value::from(SIG_TYPE_EDDSA)),
        ]);
        let packet = Value::Map(vec![
            (key("body"), body),
            (key("tag"), Value::from(TAG_SIGNATURE)),
            (key("version"), Value::from(PACKET_VERSION)),
        ]);
        encode_value(&packet)
    }

    /// Sig id base of the encoded packet.
    pub fn sig_id_base(&self) -> Result<SigIdBase, ChainLinkError> {
        Ok(SigIdBase::compute(&self.encode_packet()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_rules() {
        let user = SigIdSuffixParameters::from_type_and_version("sibkey", 2);
        assert_eq!(user.suffix(), "0f");

        let stellar = SigIdSuffixParameters::from_type_and_version("wallet.stellar", 2);
        assert_eq!(stellar.suffix(), "22");
        let stellar_v1 = SigIdSuffixParameters::from_type_and_version("wallet.stellar", 1);
        assert_eq!(stellar_v1.suffix(), "0f");

        let team_v2 = SigIdSuffixParameters::from_type_and_version("teams.root", 2);
        assert_eq!(team_v2.suffix(), "22");
        let team_v3 = SigIdSuffixParameters::from_type_and_version("teams.root", 3);
        assert_eq!(team_v3.suffix(), "38");
        let team_v1 = SigIdSuffixParameters::from_type_and_version("teams.root", 1);
        assert_eq!(team_v1.suffix(), "0f");
    }

    #[test]
    fn test_sig_id_format() {
        let base = SigIdBase::compute(b"body");
        let id = base.to_sig_id_legacy();
        assert_eq!(id.len(), 66);
        assert!(id.ends_with("0f"));
        assert_eq!(&id[..64], base.to_hex());
    }

    #[test]
    fn test_packet_hash_depends_on_payload() {
        let kid = Kid::from_hex(&format!("0120{}0a", "11".repeat(32))).unwrap();
        let a = NaclSigInfo {
            kid: kid.clone(),
            payload: b"{\"a\":1}".to_vec(),
            sig: [5; ED25519_SIG_LEN],
        };
        let mut b = a.clone();
        b.payload = b"{\"a\":2}".to_vec();
        assert_eq!(a.sig_id_base().unwrap(), a.sig_id_base().unwrap());
        assert_ne!(a.sig_id_base().unwrap(), b.sig_id_base().unwrap());
    }

    #[test]
    fn test_packet_layout() {
        let kid = Kid::from_hex(&format!("0120{}0a", "11".repeat(32))).unwrap();
        let info = NaclSigInfo {
            kid,
            payload: b"{}".to_vec(),
            sig: [5; ED25519_SIG_LEN],
        };
        let raw = info.encode_packet().unwrap();
        // fixmap(3), fixstr "body", fixmap(6), fixstr "detached", true
        assert_eq!(&raw[..5], &[0x83, 0xa4, b'b', b'o', b'd']);
        assert_eq!(raw[6], 0x86);
        assert_eq!(&raw[7..16], b"\xa8detached");
        assert_eq!(raw[16], 0xc3);
        // tag 514 as uint16, version 1 as fixint
        assert!(raw.ends_with(b"\xa3tag\xcd\x02\x02\xa7version\x01"));
    }
}
