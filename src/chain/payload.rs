//! Read-only access to a link's inner JSON payload.
//!
//! The payload bytes are kept exactly as received, since they are what gets
//! hashed; fields are read from a parsed copy.

use serde_json::Value;

use crate::chain::error::ChainLinkError;
use crate::chain::types::{HighSkip, Kid, LinkId, SeqType, Seqno, Uid};

#[derive(Debug, Clone, PartialEq)]
pub struct PayloadJson {
    bytes: Vec<u8>,
    value: Value,
}

fn missing(path: &[&str]) -> ChainLinkError {
    ChainLinkError::Malformed(format!("missing or invalid field {}", path.join(".")))
}

impl PayloadJson {
    /// Parse payload bytes, which must be a JSON object with no leading junk.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, ChainLinkError> {
        if bytes.first() != Some(&b'{') {
            return Err(ChainLinkError::Malformed(
                "JSON payload has leading garbage".to_string(),
            ));
        }
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| ChainLinkError::Malformed(format!("invalid payload JSON: {}", e)))?;
        if !value.is_object() {
            return Err(ChainLinkError::Malformed(
                "chain link is not a JSON object".to_string(),
            ));
        }
        Ok(Self { bytes, value })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    fn get(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.value, |v, key| v.get(*key))
    }

    fn get_str(&self, path: &[&str]) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    fn get_i64(&self, path: &[&str]) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    /// `body.version`: the signature version the payload claims.
    pub fn version(&self) -> Result<i64, ChainLinkError> {
        self.get_i64(&["body", "version"])
            .ok_or_else(|| missing(&["body", "version"]))
    }

    pub fn seqno(&self) -> Result<Seqno, ChainLinkError> {
        let seqno = self.get_i64(&["seqno"]).ok_or_else(|| missing(&["seqno"]))?;
        u64::try_from(seqno)
            .map(Seqno)
            .map_err(|_| ChainLinkError::Malformed(format!("negative seqno {}", seqno)))
    }

    /// `prev` is null for the first link and a hex link id otherwise.
    pub fn prev(&self) -> Result<Option<LinkId>, ChainLinkError> {
        match self.get(&["prev"]) {
            Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => LinkId::from_hex(s).map(Some),
            Some(_) => Err(ChainLinkError::Malformed(
                "bad JSON type for prev".to_string(),
            )),
            None => Err(missing(&["prev"])),
        }
    }

    /// Like [`PayloadJson::prev`], but a missing field reads as no prev.
    pub fn prev_if_present(&self) -> Result<Option<LinkId>, ChainLinkError> {
        match self.get(&["prev"]) {
            None => Ok(None),
            Some(_) => self.prev(),
        }
    }

    /// `body.key.kid`, when the payload asserts one.
    pub fn kid(&self) -> Result<Option<Kid>, ChainLinkError> {
        self.get_str(&["body", "key", "kid"])
            .map(Kid::from_hex)
            .transpose()
    }

    pub fn eldest_kid(&self) -> Result<Option<Kid>, ChainLinkError> {
        self.get_str(&["body", "key", "eldest_kid"])
            .map(Kid::from_hex)
            .transpose()
    }

    pub fn uid(&self) -> Result<Uid, ChainLinkError> {
        let s = self
            .get_str(&["body", "key", "uid"])
            .ok_or_else(|| missing(&["body", "key", "uid"]))?;
        Uid::from_hex(s)
    }

    pub fn username(&self) -> Result<&str, ChainLinkError> {
        self.get_str(&["body", "key", "username"])
            .ok_or_else(|| missing(&["body", "key", "username"]))
    }

    /// `body.type`: the v1 type name.
    pub fn type_name(&self) -> Result<&str, ChainLinkError> {
        self.get_str(&["body", "type"])
            .ok_or_else(|| missing(&["body", "type"]))
    }

    pub fn ctime(&self) -> Result<i64, ChainLinkError> {
        self.get_i64(&["ctime"]).ok_or_else(|| missing(&["ctime"]))
    }

    pub fn expire_in(&self) -> Result<i64, ChainLinkError> {
        self.get_i64(&["expire_in"])
            .ok_or_else(|| missing(&["expire_in"]))
    }

    /// Defaults to public when absent.
    pub fn seq_type(&self) -> SeqType {
        self.get_i64(&["seq_type"])
            .and_then(|v| u8::try_from(v).ok())
            .map(SeqType)
            .unwrap_or(SeqType::PUBLIC)
    }

    /// Defaults to false when absent.
    pub fn ignore_if_unsupported(&self) -> bool {
        self.get(&["ignore_if_unsupported"])
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether `body.revoke` revokes anything, in any of its four shapes:
    /// a single sig id, a list of sig ids, a single kid, or a list of kids.
    pub fn has_revocations(&self) -> bool {
        let revoke = match self.get(&["body", "revoke"]) {
            Some(r) => r,
            None => return false,
        };
        revoke.get("sig_id").is_some()
            || revoke
                .get("sig_ids")
                .and_then(|v| v.get(0))
                .is_some()
            || revoke.get("kid").is_some()
            || revoke.get("kids").and_then(|v| v.get(0)).is_some()
    }

    /// Sig ids revoked by this payload.
    pub fn revoked_sig_ids(&self) -> Vec<String> {
        self.revoked_strings("sig_id", "sig_ids")
    }

    /// KIDs revoked by this payload. Entries that do not parse are skipped.
    pub fn revoked_kids(&self) -> Vec<Kid> {
        self.revoked_strings("kid", "kids")
            .iter()
            .filter_map(|s| Kid::from_hex(s).ok())
            .collect()
    }

    fn revoked_strings(&self, single: &str, list: &str) -> Vec<String> {
        let revoke = match self.get(&["body", "revoke"]) {
            Some(r) => r,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        if let Some(s) = revoke.get(single).and_then(Value::as_str) {
            out.push(s.to_string());
        }
        if let Some(items) = revoke.get(list).and_then(Value::as_array) {
            out.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
        }
        out
    }

    /// The key delegated by a `sibkey`, `subkey` or `pgp_update` section.
    pub fn delegated_kid(&self, section: &str) -> Result<Option<Kid>, ChainLinkError> {
        self.get_str(&["body", section, "kid"])
            .map(Kid::from_hex)
            .transpose()
    }

    /// `high_skip` is optional, but must be an object when present. Its hash
    /// is either a hex link id or null (when pointing at genesis).
    pub fn high_skip(&self) -> Result<Option<HighSkip>, ChainLinkError> {
        let hs = match self.get(&["high_skip"]) {
            None => return Ok(None),
            Some(Value::Object(hs)) => hs,
            Some(other) => {
                return Err(ChainLinkError::Malformed(format!(
                    "When provided, expected high_skip to be a JSON object, was {}",
                    other
                )))
            }
        };
        let seqno = hs
            .get("seqno")
            .and_then(Value::as_u64)
            .ok_or_else(|| missing(&["high_skip", "seqno"]))?;
        let hash = match hs.get("hash") {
            Some(Value::Null) => None,
            Some(Value::String(s)) => Some(LinkId::from_hex(s)?),
            _ => {
                return Err(ChainLinkError::Malformed(
                    "high_skip.hash was neither a valid string nor null".to_string(),
                ))
            }
        };
        Ok(Some(HighSkip::new(Seqno(seqno), hash)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> PayloadJson {
        PayloadJson::parse(s.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn test_rejects_leading_garbage_and_non_objects() {
        assert!(PayloadJson::parse(b" {}".to_vec()).is_err());
        assert!(PayloadJson::parse(b"[1]".to_vec()).is_err());
        assert!(PayloadJson::parse(b"{".to_vec()).is_err());
    }

    #[test]
    fn test_has_revocations_all_four_shapes() {
        assert!(!parse(r#"{"body":{}}"#).has_revocations());
        assert!(!parse(r#"{"body":{"revoke":{}}}"#).has_revocations());
        assert!(!parse(r#"{"body":{"revoke":{"sig_ids":[]}}}"#).has_revocations());

        assert!(parse(r#"{"body":{"revoke":{"sig_id":"aa"}}}"#).has_revocations());
        assert!(parse(r#"{"body":{"revoke":{"sig_ids":["aa"]}}}"#).has_revocations());
        assert!(parse(r#"{"body":{"revoke":{"kid":"01"}}}"#).has_revocations());
        assert!(parse(r#"{"body":{"revoke":{"kids":["01"]}}}"#).has_revocations());
    }

    #[test]
    fn test_prev_null_and_hex() {
        assert_eq!(parse(r#"{"prev":null}"#).prev().unwrap(), None);
        let hex = "ab".repeat(32);
        let p = parse(&format!(r#"{{"prev":"{}"}}"#, hex));
        assert_eq!(p.prev().unwrap().unwrap().to_hex(), hex);
        assert!(parse(r#"{"prev":5}"#).prev().is_err());
        assert!(parse(r#"{}"#).prev().is_err());
        assert_eq!(parse(r#"{}"#).prev_if_present().unwrap(), None);
    }

    #[test]
    fn test_high_skip_shapes() {
        assert_eq!(parse(r#"{}"#).high_skip().unwrap(), None);
        assert_eq!(
            parse(r#"{"high_skip":{"seqno":0,"hash":null}}"#)
                .high_skip()
                .unwrap(),
            Some(HighSkip::genesis())
        );
        let hex = "cd".repeat(32);
        let hs = parse(&format!(r#"{{"high_skip":{{"seqno":3,"hash":"{}"}}}}"#, hex))
            .high_skip()
            .unwrap()
            .unwrap();
        assert_eq!(hs.seqno, Seqno(3));
        assert_eq!(hs.hash.unwrap().to_hex(), hex);

        assert!(parse(r#"{"high_skip":5}"#).high_skip().is_err());
        assert!(parse(r#"{"high_skip":{"seqno":1,"hash":7}}"#)
            .high_skip()
            .is_err());
    }

    #[test]
    fn test_defaults() {
        let p = parse(r#"{}"#);
        assert_eq!(p.seq_type(), SeqType::PUBLIC);
        assert!(!p.ignore_if_unsupported());
    }

    #[test]
    fn test_revoked_lists() {
        let kid = format!("0120{}0a", "22".repeat(32));
        let p = parse(&format!(
            r#"{{"body":{{"revoke":{{"sig_id":"s1","sig_ids":["s2","s3"],"kids":["{}","bogus"]}}}}}}"#,
            kid
        ));
        assert_eq!(p.revoked_sig_ids(), vec!["s1", "s2", "s3"]);
        assert_eq!(p.revoked_kids().len(), 1);
    }
}
