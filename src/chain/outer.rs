//! The V2 outer link envelope.
//!
//! A V2 signature covers a small outer link rather than the JSON payload. The
//! outer link hoists the essential payload fields (seqno, prev, type, high
//! skip) and points at the payload by hash in `curr`, so the two must agree.
//! On the wire the envelope is a msgpack array. Links exist in the wild that
//! stop after the type, after the seq type, or after the ignore flag; the
//! array is therefore allowed to carry between 5 and 9 fields.

use rmpv::{Integer, Value};

use crate::chain::error::ChainLinkError;
use crate::chain::types::{HighSkip, Kid, LinkId, SeqType, Seqno, SigVersion};

/// Fields up to and including the link type are always present.
pub const MIN_OUTER_FIELDS: usize = 5;

/// Fields with seq type and ignore flag, before high skips existed.
pub const PRE_HIGH_SKIP_FIELDS: usize = 7;

/// All fields, including the high skip pair.
pub const MAX_OUTER_FIELDS: usize = 9;

/// Integer code for a link's type, as signed into the outer link.
///
/// Codes for types this build does not know are carried through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LinkType(pub u8);

impl LinkType {
    pub const NONE: LinkType = LinkType(0);
    pub const ELDEST: LinkType = LinkType(1);
    pub const WEB_SERVICE_BINDING: LinkType = LinkType(2);
    pub const TRACK: LinkType = LinkType(3);
    pub const UNTRACK: LinkType = LinkType(4);
    pub const REVOKE: LinkType = LinkType(5);
    pub const CRYPTOCURRENCY: LinkType = LinkType(6);
    pub const ANNOUNCEMENT: LinkType = LinkType(7);
    pub const DEVICE: LinkType = LinkType(8);
    pub const WEB_SERVICE_BINDING_WITH_REVOKE: LinkType = LinkType(9);
    pub const CRYPTOCURRENCY_WITH_REVOKE: LinkType = LinkType(10);
    pub const SIBKEY: LinkType = LinkType(11);
    pub const SUBKEY: LinkType = LinkType(12);
    pub const PGP_UPDATE: LinkType = LinkType(13);
    pub const PER_USER_KEY: LinkType = LinkType(14);
    pub const WALLET_STELLAR: LinkType = LinkType(15);

    pub const TEAM_ROOT: LinkType = LinkType(33);
    pub const TEAM_NEW_SUBTEAM: LinkType = LinkType(34);
    pub const TEAM_CHANGE_MEMBERSHIP: LinkType = LinkType(35);
    pub const TEAM_ROTATE_KEY: LinkType = LinkType(36);
    pub const TEAM_LEAVE: LinkType = LinkType(37);
    pub const TEAM_SUBTEAM_HEAD: LinkType = LinkType(38);
    pub const TEAM_RENAME_SUBTEAM: LinkType = LinkType(39);
    pub const TEAM_INVITE: LinkType = LinkType(40);
    pub const TEAM_RENAME_UP_POINTER: LinkType = LinkType(41);
    pub const TEAM_DELETE_ROOT: LinkType = LinkType(42);
    pub const TEAM_DELETE_SUBTEAM: LinkType = LinkType(43);
    pub const TEAM_DELETE_UP_POINTER: LinkType = LinkType(44);
    // 45 is retired.
    pub const TEAM_SETTINGS: LinkType = LinkType(46);
    pub const TEAM_KBFS_SETTINGS: LinkType = LinkType(47);
    pub const TEAM_BOT_SETTINGS: LinkType = LinkType(48);

    pub fn is_supported_user_type(self) -> bool {
        self.0 <= LinkType::WALLET_STELLAR.0
    }

    pub fn is_supported_team_type(self) -> bool {
        matches!(self.0, 33..=44 | 46..=48)
    }

    pub fn is_supported_type(self) -> bool {
        self.is_supported_user_type() || self.is_supported_team_type()
    }

    /// Whether a link of this type may be delivered without its payload.
    /// Unsupported types may always be stubbed so older clients keep working.
    pub fn allow_stubbing(self) -> bool {
        if !self.is_supported_user_type() {
            return true;
        }
        matches!(
            self,
            LinkType::TRACK | LinkType::UNTRACK | LinkType::ANNOUNCEMENT
        )
    }

    /// Whether this link type carries a revocation.
    pub fn is_revoking(self) -> bool {
        matches!(
            self,
            LinkType::REVOKE
                | LinkType::WEB_SERVICE_BINDING_WITH_REVOKE
                | LinkType::CRYPTOCURRENCY_WITH_REVOKE
        )
    }

    /// Map a v1 type name (the payload's `body.type`) to its v2 code.
    ///
    /// `web_service_binding` and `cryptocurrency` have a distinct code when
    /// the payload revokes something. Unknown names map to [`LinkType::NONE`]
    /// if the link may be ignored, and are an error otherwise.
    pub fn from_v1_type_and_revocations(
        name: &str,
        has_revocations: bool,
        ignore_if_unsupported: bool,
    ) -> Result<LinkType, ChainLinkError> {
        let ret = match name {
            "eldest" => LinkType::ELDEST,
            "web_service_binding" if has_revocations => LinkType::WEB_SERVICE_BINDING_WITH_REVOKE,
            "web_service_binding" => LinkType::WEB_SERVICE_BINDING,
            "track" => LinkType::TRACK,
            "untrack" => LinkType::UNTRACK,
            "revoke" => LinkType::REVOKE,
            "cryptocurrency" if has_revocations => LinkType::CRYPTOCURRENCY_WITH_REVOKE,
            "cryptocurrency" => LinkType::CRYPTOCURRENCY,
            "announcement" => LinkType::ANNOUNCEMENT,
            "device" => LinkType::DEVICE,
            "sibkey" => LinkType::SIBKEY,
            "subkey" => LinkType::SUBKEY,
            "pgp_update" => LinkType::PGP_UPDATE,
            "per_user_key" => LinkType::PER_USER_KEY,
            "wallet.stellar" => LinkType::WALLET_STELLAR,
            other => match Self::from_v1_team_type(other) {
                Some(t) => t,
                None if ignore_if_unsupported => LinkType::NONE,
                None => {
                    return Err(ChainLinkError::Malformed(format!(
                        "Unknown sig v1 type: {}",
                        other
                    )))
                }
            },
        };

        if ret.allow_stubbing() && has_revocations {
            return Err(ChainLinkError::Malformed(format!(
                "invalid chain link of type {} with a revocation",
                ret.0
            )));
        }
        Ok(ret)
    }

    fn from_v1_team_type(name: &str) -> Option<LinkType> {
        let ret = match name {
            "team.root" => LinkType::TEAM_ROOT,
            "team.new_subteam" => LinkType::TEAM_NEW_SUBTEAM,
            "team.change_membership" => LinkType::TEAM_CHANGE_MEMBERSHIP,
            "team.rotate_key" => LinkType::TEAM_ROTATE_KEY,
            "team.leave" => LinkType::TEAM_LEAVE,
            "team.subteam_head" => LinkType::TEAM_SUBTEAM_HEAD,
            "team.rename_subteam" => LinkType::TEAM_RENAME_SUBTEAM,
            "team.invite" => LinkType::TEAM_INVITE,
            "team.rename_up_pointer" => LinkType::TEAM_RENAME_UP_POINTER,
            "team.delete_root" => LinkType::TEAM_DELETE_ROOT,
            "team.delete_subteam" => LinkType::TEAM_DELETE_SUBTEAM,
            "team.delete_up_pointer" => LinkType::TEAM_DELETE_UP_POINTER,
            "team.settings" => LinkType::TEAM_SETTINGS,
            "team.kbfs" => LinkType::TEAM_KBFS_SETTINGS,
            "team.bot_settings" => LinkType::TEAM_BOT_SETTINGS,
            _ => return None,
        };
        Some(ret)
    }
}

/// The V2 outer link, as signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OuterLinkV2 {
    pub version: u8,
    pub seqno: Seqno,
    pub prev: Option<LinkId>,
    pub curr: Option<LinkId>,
    pub link_type: LinkType,
    pub seq_type: SeqType,
    pub ignore_if_unsupported: bool,
    pub high_skip_seqno: Option<Seqno>,
    pub high_skip_hash: Option<LinkId>,
}

/// Values derived independently from the payload, which the outer link must
/// agree with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedOuterFields {
    pub version: SigVersion,
    pub seqno: Seqno,
    pub prev: Option<LinkId>,
    pub curr: LinkId,
    pub link_type: LinkType,
    pub seq_type: SeqType,
    pub ignore_if_unsupported: bool,
    pub high_skip: Option<HighSkip>,
}

fn mismatch(msg: String) -> ChainLinkError {
    ChainLinkError::MismatchedField(msg)
}

fn fmt_link(id: &Option<LinkId>) -> String {
    id.map(|l| l.to_hex()).unwrap_or_else(|| "null".to_string())
}

impl OuterLinkV2 {
    /// The high skip carried by the envelope, if any. A seqno without a hash
    /// is valid (and required) when pointing at genesis.
    pub fn high_skip(&self) -> Option<HighSkip> {
        self.high_skip_seqno
            .map(|seqno| HighSkip::new(seqno, self.high_skip_hash))
    }

    /// Number of fields a full encoding of this envelope writes.
    pub fn natural_field_count(&self) -> usize {
        if self.high_skip_seqno.is_some() || self.high_skip_hash.is_some() {
            MAX_OUTER_FIELDS
        } else {
            PRE_HIGH_SKIP_FIELDS
        }
    }

    fn to_values(&self) -> Vec<Value> {
        let opt_link = |l: &Option<LinkId>| match l {
            Some(id) => Value::Binary(id.as_bytes().to_vec()),
            None => Value::Nil,
        };
        vec![
            Value::from(self.version),
            Value::from(self.seqno.0),
            opt_link(&self.prev),
            opt_link(&self.curr),
            Value::from(self.link_type.0),
            Value::from(self.seq_type.0),
            Value::Boolean(self.ignore_if_unsupported),
            match self.high_skip_seqno {
                Some(s) => Value::from(s.0),
                None => Value::Nil,
            },
            opt_link(&self.high_skip_hash),
        ]
    }

    /// Encode the envelope with its natural field count.
    pub fn encode(&self) -> Result<Vec<u8>, ChainLinkError> {
        self.encode_partial(self.natural_field_count())
    }

    /// Encode only the first `num_fields` fields, reproducing envelopes that
    /// were signed before later fields existed.
    pub fn encode_partial(&self, num_fields: usize) -> Result<Vec<u8>, ChainLinkError> {
        if !(MIN_OUTER_FIELDS..=MAX_OUTER_FIELDS).contains(&num_fields) {
            return Err(ChainLinkError::Malformed(format!(
                "outer link cannot be encoded with {} fields",
                num_fields
            )));
        }
        let mut values = self.to_values();
        values.truncate(num_fields);
        encode_value(&Value::Array(values))
    }

    /// Decode an envelope from its msgpack array form.
    pub fn decode(raw: &[u8]) -> Result<Self, ChainLinkError> {
        let value = decode_single_array(raw)?;
        Self::from_value(value)
    }

    pub(crate) fn from_value(value: Value) -> Result<Self, ChainLinkError> {
        let fields = match value {
            Value::Array(fields) => fields,
            _ => return Err(malformed("outer link is not an array")),
        };
        if !(MIN_OUTER_FIELDS..=MAX_OUTER_FIELDS).contains(&fields.len()) {
            return Err(malformed(&format!(
                "outer link has {} fields",
                fields.len()
            )));
        }
        // Missing trailing fields read as nil.
        let get = |i: usize| fields.get(i).cloned().unwrap_or(Value::Nil);

        Ok(OuterLinkV2 {
            version: value_u8(&get(0), "version")?,
            seqno: Seqno(value_u64(&get(1), "seqno")?),
            prev: value_opt_link_id(&get(2), "prev")?,
            curr: value_opt_link_id(&get(3), "curr")?,
            link_type: LinkType(value_u8(&get(4), "type")?),
            seq_type: SeqType(value_opt_u8(&get(5), "seqtype")?.unwrap_or(0)),
            ignore_if_unsupported: value_opt_bool(&get(6), "ignore_if_unsupported")?
                .unwrap_or(false),
            high_skip_seqno: value_opt_u64(&get(7), "high_skip_seqno")?.map(Seqno),
            high_skip_hash: value_opt_link_id(&get(8), "high_skip_hash")?,
        })
    }

    /// Assert that every hoisted field equals the value derived from the
    /// payload. The first disagreement is returned.
    pub fn assert_fields(&self, expected: &ExpectedOuterFields) -> Result<(), ChainLinkError> {
        if self.version != expected.version.as_u8() {
            return Err(mismatch(format!(
                "version field ({} != {})",
                self.version,
                expected.version.as_u8()
            )));
        }
        if self.seqno != expected.seqno {
            return Err(mismatch(format!(
                "seqno field: ({} != {})",
                self.seqno, expected.seqno
            )));
        }
        if self.prev != expected.prev {
            return Err(mismatch(format!(
                "prev pointer: ({} != {})",
                fmt_link(&self.prev),
                fmt_link(&expected.prev)
            )));
        }
        if self.curr != Some(expected.curr) {
            return Err(mismatch(format!(
                "curr pointer: ({} != {})",
                fmt_link(&self.curr),
                expected.curr
            )));
        }
        let skip_type_check =
            expected.link_type == LinkType::NONE && expected.ignore_if_unsupported;
        if !skip_type_check && self.link_type != expected.link_type {
            return Err(mismatch(format!(
                "link type: ({} != {})",
                self.link_type.0, expected.link_type.0
            )));
        }
        if self.seq_type != expected.seq_type {
            return Err(mismatch(format!(
                "seq type: ({} != {})",
                self.seq_type.0, expected.seq_type.0
            )));
        }
        if self.ignore_if_unsupported != expected.ignore_if_unsupported {
            return Err(mismatch(format!(
                "ignore_if_unsupported: ({} != {})",
                self.ignore_if_unsupported, expected.ignore_if_unsupported
            )));
        }
        self.assert_high_skip(expected.high_skip.as_ref())
    }

    fn assert_high_skip(&self, high_skip: Option<&HighSkip>) -> Result<(), ChainLinkError> {
        let high_skip = match high_skip {
            Some(hs) => hs,
            None => {
                if let Some(seqno) = self.high_skip_seqno {
                    return Err(mismatch(format!(
                        "provided HighSkipSeqno ({}) in outer link but not in inner link",
                        seqno
                    )));
                }
                if let Some(hash) = self.high_skip_hash {
                    return Err(mismatch(format!(
                        "provided HighSkipHash ({}) in outer link but not in inner link",
                        hash
                    )));
                }
                return Ok(());
            }
        };

        let outer_seqno = self.high_skip_seqno.ok_or_else(|| {
            mismatch(
                "provided HighSkip in inner link but not HighSkipSeqno in outer link".to_string(),
            )
        })?;
        if outer_seqno != high_skip.seqno {
            return Err(mismatch(format!(
                "highSkip.Seqno field outer ({})/inner ({}) mismatch",
                outer_seqno, high_skip.seqno
            )));
        }
        match (self.high_skip_hash, high_skip.hash) {
            (None, Some(_)) => Err(mismatch(
                "provided HighSkip.Hash in inner link but not outer".to_string(),
            )),
            (Some(_), None) => Err(mismatch(
                "provided HighSkip.Hash in outer link but not inner".to_string(),
            )),
            (Some(outer), Some(inner)) if outer != inner => Err(mismatch(format!(
                "highSkip.Hash field outer ({})/inner ({}) mismatch",
                outer, inner
            ))),
            _ => Ok(()),
        }
    }

}

/// An outer link together with the exact bytes it was decoded from or
/// encoded to, and the signature metadata that came with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedOuterLink {
    pub outer: OuterLinkV2,
    pub raw: Vec<u8>,
    pub sig_id: Option<String>,
    pub sig: Option<String>,
    pub kid: Option<Kid>,
}

fn malformed(msg: &str) -> ChainLinkError {
    ChainLinkError::Malformed(msg.to_string())
}

pub(crate) fn encode_value(value: &Value) -> Result<Vec<u8>, ChainLinkError> {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, value)
        .map_err(|e| ChainLinkError::Malformed(format!("Failed to encode msgpack: {}", e)))?;
    Ok(bytes)
}

/// Whether `raw` opens with a msgpack array marker (fixarray, array 16 or
/// array 32).
pub(crate) fn is_encoded_msgpack_array(raw: &[u8]) -> bool {
    matches!(raw.first(), Some(0x90..=0x9f | 0xdc | 0xdd))
}

/// Decode exactly one msgpack array, rejecting leading junk and trailing bytes.
pub(crate) fn decode_single_array(raw: &[u8]) -> Result<Value, ChainLinkError> {
    if !is_encoded_msgpack_array(raw) {
        return Err(malformed("expected a msgpack array but got leading junk"));
    }
    let mut reader = raw;
    let value = rmpv::decode::read_value(&mut reader)
        .map_err(|e| ChainLinkError::Malformed(format!("Failed to decode msgpack: {}", e)))?;
    if !reader.is_empty() {
        return Err(malformed("trailing bytes after msgpack array"));
    }
    Ok(value)
}

fn value_integer(v: &Value, field: &str) -> Result<Integer, ChainLinkError> {
    match v {
        Value::Integer(i) => Ok(*i),
        _ => Err(ChainLinkError::Malformed(format!(
            "outer link field {} is not an integer",
            field
        ))),
    }
}

pub(crate) fn value_u64(v: &Value, field: &str) -> Result<u64, ChainLinkError> {
    value_integer(v, field)?.as_u64().ok_or_else(|| {
        ChainLinkError::Malformed(format!("outer link field {} out of range", field))
    })
}

fn value_u8(v: &Value, field: &str) -> Result<u8, ChainLinkError> {
    u8::try_from(value_u64(v, field)?).map_err(|_| {
        ChainLinkError::Malformed(format!("outer link field {} out of range", field))
    })
}

fn value_opt_u64(v: &Value, field: &str) -> Result<Option<u64>, ChainLinkError> {
    match v {
        Value::Nil => Ok(None),
        other => value_u64(other, field).map(Some),
    }
}

fn value_opt_u8(v: &Value, field: &str) -> Result<Option<u8>, ChainLinkError> {
    match v {
        Value::Nil => Ok(None),
        other => value_u8(other, field).map(Some),
    }
}

fn value_opt_bool(v: &Value, field: &str) -> Result<Option<bool>, ChainLinkError> {
    match v {
        Value::Nil => Ok(None),
        Value::Boolean(b) => Ok(Some(*b)),
        _ => Err(ChainLinkError::Malformed(format!(
            "outer link field {} is not a bool",
            field
        ))),
    }
}

fn value_opt_link_id(v: &Value, field: &str) -> Result<Option<LinkId>, ChainLinkError> {
    match v {
        Value::Nil => Ok(None),
        Value::Binary(b) => LinkId::from_slice(b).map(Some),
        _ => Err(ChainLinkError::Malformed(format!(
            "outer link field {} is not a link id",
            field
        ))),
    }
}
