//! Decoding of chain link records as returned by the server.
//!
//! A record is a JSON object in one of four shapes, told apart by which
//! fields it carries:
//!
//! | shape          | discriminant                         | link id hashes        |
//! |----------------|--------------------------------------|-----------------------|
//! | V2 stubbed     | non-empty `s2`                       | the outer envelope    |
//! | V1 PGP         | `sig_version` 1, armored PGP `sig`   | the payload (+fixups) |
//! | V1 NaCl        | `sig_version` 1, no PGP `sig`        | the payload           |
//! | V2 unstubbed   | `sig_version` 2, no PGP `sig`        | the outer envelope    |

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::debug;
use rmpv::Value as MsgpackValue;
use serde_json::Value;

use crate::chain::error::ChainLinkError;
use crate::chain::link::{ChainLink, UnpackedPayload};
use crate::chain::link_id::{compute_link_id, compute_link_id_with_fixups};
use crate::chain::outer::{
    decode_single_array, value_u64, ExpectedOuterFields, LinkType, OuterLinkV2, SignedOuterLink,
};
use crate::chain::payload::PayloadJson;
use crate::chain::pgp::{is_pgp_sig, PgpMessage};
use crate::chain::sig_id::{NaclSigInfo, SigIdBase, SigIdSuffixParameters, ED25519_SIG_LEN};
use crate::chain::types::{Kid, LinkId, SeqType, Seqno, SigVersion, Uid};

/// The four wire shapes of a server chain link record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    V2Stubbed,
    V1Pgp,
    V1Nacl,
    V2Unstubbed,
}

impl WireKind {
    /// Pick the wire shape of a record. Records that declare no usable
    /// signature version, or an impossible version/signature combination,
    /// are rejected here.
    pub fn of(record: &Value) -> Result<WireKind, ChainLinkError> {
        if non_empty_str(record, "s2").is_some() {
            return Ok(WireKind::V2Stubbed);
        }
        let version = sig_version_hint(record)?;
        let pgp = pgp_sig(record).is_some();
        match (SigVersion::from_i64(version), pgp) {
            (Some(SigVersion::V1), true) => Ok(WireKind::V1Pgp),
            (Some(SigVersion::V1), false) => Ok(WireKind::V1Nacl),
            (Some(SigVersion::V2), false) => Ok(WireKind::V2Unstubbed),
            _ => Err(ChainLinkError::BadVersion(format!(
                "bad link back from server; version={}; pgp={}",
                version, pgp
            ))),
        }
    }
}

/// What each wire-specific import hands to the shared unpacking step.
struct Imported {
    link_id: LinkId,
    kid: Kid,
    sig_id: String,
    sig: String,
    payload: PayloadJson,
    outer: Option<SignedOuterLink>,
    link_type: Option<LinkType>,
}

fn non_empty_str<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn sig_version_hint(record: &Value) -> Result<i64, ChainLinkError> {
    match record.get("sig_version").and_then(Value::as_i64) {
        Some(v) if v != 0 => Ok(v),
        _ => Err(ChainLinkError::Malformed(
            "cannot read signature version from server".to_string(),
        )),
    }
}

fn pgp_sig(record: &Value) -> Option<&str> {
    non_empty_str(record, "sig").filter(|s| is_pgp_sig(s))
}

fn decode_base64(s: &str, what: &str) -> Result<Vec<u8>, ChainLinkError> {
    STANDARD
        .decode(s.as_bytes())
        .map_err(|e| ChainLinkError::Malformed(format!("bad base64 in {}: {}", what, e)))
}

fn decode_nacl_sig(bytes: &[u8]) -> Result<[u8; ED25519_SIG_LEN], ChainLinkError> {
    bytes.try_into().map_err(|_| {
        ChainLinkError::Malformed(format!(
            "NaCl signature has {} bytes, expected {}",
            bytes.len(),
            ED25519_SIG_LEN
        ))
    })
}

/// The payload travels as a JSON string inside the record.
fn payload_from_record(record: &Value) -> Result<PayloadJson, ChainLinkError> {
    let payload = record
        .get("payload_json")
        .and_then(Value::as_str)
        .ok_or_else(|| ChainLinkError::Malformed("no payload_json in server link".to_string()))?;
    PayloadJson::parse(payload.as_bytes().to_vec())
}

fn expect_inner_version(payload: &PayloadJson, want: SigVersion) -> Result<(), ChainLinkError> {
    let version = payload.version()?;
    if version != want.as_u8() as i64 {
        return Err(ChainLinkError::BadVersion(format!(
            "inner chainlink showed wrong version {}, while expecting {}",
            version,
            want.as_u8()
        )));
    }
    Ok(())
}

fn required_kid(payload: &PayloadJson) -> Result<Kid, ChainLinkError> {
    payload
        .kid()?
        .ok_or_else(|| ChainLinkError::Malformed("payload carries no body.key.kid".to_string()))
}

fn suffix_params(payload: &PayloadJson) -> Result<SigIdSuffixParameters, ChainLinkError> {
    let version = payload.version()?;
    Ok(SigIdSuffixParameters::from_type_and_version(
        payload.type_name()?,
        u8::try_from(version).unwrap_or(0),
    ))
}

/// Decode one server record, given as raw JSON bytes.
///
/// `self_uid` is the identity of the local user; links it signed keep their
/// full proof text.
///
/// User chains only: there is no parent chain argument. Team links, which
/// are checked against their parent team's chain, are decoded here like any
/// other link but never linked to a parent.
pub fn import_link(raw: &[u8], self_uid: Option<&Uid>) -> Result<ChainLink, ChainLinkError> {
    let record: Value = serde_json::from_slice(raw)
        .map_err(|e| ChainLinkError::Malformed(format!("server link is not JSON: {}", e)))?;
    import_link_value(&record, self_uid)
}

/// Decode one server record that has already been parsed.
pub fn import_link_value(
    record: &Value,
    self_uid: Option<&Uid>,
) -> Result<ChainLink, ChainLinkError> {
    let kind = WireKind::of(record)?;
    let imported = match kind {
        WireKind::V2Stubbed => {
            let s2 = non_empty_str(record, "s2").unwrap_or_default();
            return import_v2_stubbed(s2);
        }
        WireKind::V1Pgp => {
            let armored = pgp_sig(record).unwrap_or_default();
            import_v1_pgp(armored, record)?
        }
        WireKind::V1Nacl => import_v1_nacl(record)?,
        WireKind::V2Unstubbed => import_v2_unstubbed(record)?,
    };
    let sig_version = match kind {
        WireKind::V1Pgp | WireKind::V1Nacl => SigVersion::V1,
        _ => SigVersion::V2,
    };
    finish_unstubbed(record, imported, sig_version, self_uid)
}

fn import_v2_stubbed(s2: &str) -> Result<ChainLink, ChainLinkError> {
    let raw = decode_base64(s2, "s2")?;
    let mut outer = OuterLinkV2::decode(&raw)?;
    outer.seq_type = outer.seq_type.fixup();

    if !outer.ignore_if_unsupported && !outer.link_type.is_supported_type() {
        return Err(ChainLinkError::StubbedUnsupported(format!(
            "Stubbed link with type {} is unknown and not marked with IgnoreIfUnsupported",
            outer.link_type.0
        )));
    }
    let sig_version = SigVersion::from_i64(outer.version as i64).ok_or_else(|| {
        ChainLinkError::BadVersion(format!("stubbed link has version {}", outer.version))
    })?;

    let id = compute_link_id(&raw);
    debug!("Imported stubbed link {} at seqno {}", id.short(), outer.seqno);

    Ok(ChainLink {
        id,
        seqno: outer.seqno,
        prev: outer.prev,
        sig_version,
        seq_type: outer.seq_type,
        ignore_if_unsupported: outer.ignore_if_unsupported,
        // A null hash is valid when pointing at genesis, so only the seqno
        // decides whether the link carries a high skip.
        high_skip: outer.high_skip(),
        link_type: Some(outer.link_type),
        kid: None,
        sig: None,
        sig_id: None,
        outer: Some(SignedOuterLink {
            outer,
            raw,
            sig_id: None,
            sig: None,
            kid: None,
        }),
        unpacked: None,
        hash_verified: false,
        payload_verified: false,
        chain_verified: false,
        computed_high_skip: None,
    })
}

fn import_v1_nacl(record: &Value) -> Result<Imported, ChainLinkError> {
    let si1 = non_empty_str(record, "si1")
        .ok_or_else(|| ChainLinkError::Malformed("no si1 field as expected".to_string()))?;
    let sig = decode_nacl_sig(&decode_base64(si1, "si1")?)?;

    let payload = payload_from_record(record)?;
    expect_inner_version(&payload, SigVersion::V1)?;
    let link_id = compute_link_id(payload.bytes());
    let kid = required_kid(&payload)?;

    let sig_info = NaclSigInfo {
        kid: kid.clone(),
        payload: payload.bytes().to_vec(),
        sig,
    };
    let packet = sig_info.encode_packet()?;
    let sig_id = SigIdBase::compute(&packet).to_sig_id(&suffix_params(&payload)?);

    Ok(Imported {
        link_id,
        kid,
        sig_id,
        sig: STANDARD.encode(&packet),
        payload,
        outer: None,
        link_type: None,
    })
}

fn import_v1_pgp(armored: &str, record: &Value) -> Result<Imported, ChainLinkError> {
    let msg = PgpMessage::dearmor(armored)?;
    let payload_bytes = msg.literal_data()?;
    let sig_id = msg.sig_id_base().to_sig_id_legacy();
    let link_id = compute_link_id_with_fixups(&payload_bytes)?;
    let payload = PayloadJson::parse(payload_bytes)?;

    // Very old PGP signatures carry no KID in the body, so the server always
    // supplies one; the body must agree when it does name a key.
    let payload_kid = payload.kid().ok().flatten();
    let raw_server_kid = record
        .get("kid")
        .and_then(Value::as_str)
        .ok_or_else(|| ChainLinkError::Malformed("server returned no KID for PGP key".to_string()))?;
    let server_kid = Kid::from_hex(raw_server_kid).map_err(|_| {
        ChainLinkError::Malformed("server returned an invalid KID for PGP key".to_string())
    })?;
    if let Some(payload_kid) = payload_kid {
        if payload_kid != server_kid {
            return Err(ChainLinkError::KidMismatch(
                "server returned a bad KID that didn't match PGP body".to_string(),
            ));
        }
    }

    Ok(Imported {
        link_id,
        kid: server_kid,
        sig_id,
        sig: armored.to_string(),
        payload,
        outer: None,
        link_type: None,
    })
}

/// `si2` is a msgpack array of the signature, a partially filled outer link,
/// and the number of outer fields that were signed.
fn decode_sig2_imploded(
    si2: &str,
) -> Result<([u8; ED25519_SIG_LEN], OuterLinkV2, usize), ChainLinkError> {
    let raw = decode_base64(si2, "si2")?;
    let mut items = match decode_single_array(&raw)? {
        MsgpackValue::Array(items) if items.len() == 3 => items,
        _ => {
            return Err(ChainLinkError::Malformed(
                "si2 is not a three element array".to_string(),
            ))
        }
    };
    let num_fields = value_u64(&items[2], "num_fields")? as usize;
    let outer = OuterLinkV2::from_value(items.remove(1))?;
    let sig = match &items[0] {
        MsgpackValue::Binary(b) => decode_nacl_sig(b)?,
        _ => {
            return Err(ChainLinkError::Malformed(
                "si2 signature is not a byte string".to_string(),
            ))
        }
    };
    Ok((sig, outer, num_fields))
}

fn import_v2_unstubbed(record: &Value) -> Result<Imported, ChainLinkError> {
    let si2 = non_empty_str(record, "si2")
        .ok_or_else(|| ChainLinkError::Malformed("no si2 field as expected".to_string()))?;
    let payload = payload_from_record(record)?;
    expect_inner_version(&payload, SigVersion::V2)?;
    let inner_link_id = compute_link_id(payload.bytes());

    let (sig, mut outer, num_fields) = decode_sig2_imploded(si2)?;
    let prev = payload.prev()?;
    let seqno = payload.seqno()?;
    outer.curr = Some(inner_link_id);
    outer.prev = prev;
    outer.seqno = seqno;
    outer.seq_type = outer.seq_type.fixup();

    let outer_raw = outer.encode_partial(num_fields).map_err(|e| {
        debug!("EncodePartial failed on input si2={}", si2);
        e
    })?;
    let link_id = compute_link_id(&outer_raw);
    let kid = required_kid(&payload)?;

    let sig_info = NaclSigInfo {
        kid: kid.clone(),
        payload: outer_raw.clone(),
        sig,
    };
    let packet = sig_info.encode_packet()?;
    let sig_id = SigIdBase::compute(&packet).to_sig_id(&suffix_params(&payload)?);
    let sig_b64 = STANDARD.encode(&packet);

    let link_type = LinkType::from_v1_type_and_revocations(
        payload.type_name()?,
        payload.has_revocations(),
        outer.ignore_if_unsupported,
    )?;
    outer.assert_fields(&ExpectedOuterFields {
        version: SigVersion::V2,
        seqno,
        prev,
        curr: inner_link_id,
        link_type,
        seq_type: outer.seq_type,
        ignore_if_unsupported: outer.ignore_if_unsupported,
        high_skip: payload.high_skip()?,
    })?;

    Ok(Imported {
        link_id,
        kid: kid.clone(),
        sig_id: sig_id.clone(),
        sig: sig_b64.clone(),
        payload,
        outer: Some(SignedOuterLink {
            outer,
            raw: outer_raw,
            sig_id: Some(sig_id),
            sig: Some(sig_b64),
            kid: Some(kid),
        }),
        link_type: Some(link_type),
    })
}

fn finish_unstubbed(
    record: &Value,
    imported: Imported,
    sig_version: SigVersion,
    self_uid: Option<&Uid>,
) -> Result<ChainLink, ChainLinkError> {
    let payload = imported.payload;

    let uid = payload.uid()?;
    let username = payload.username()?.to_string();
    let type_name = payload.type_name()?.to_string();
    let ctime = payload.ctime()?;
    let expire_in = payload.expire_in()?;
    let seqno = payload.seqno()?;
    let prev = payload.prev_if_present()?;
    let high_skip = payload.high_skip()?;
    let has_revocations = payload.has_revocations();
    let seq_type: SeqType = payload.seq_type();
    let ignore_if_unsupported = payload.ignore_if_unsupported();
    let eldest_kid = payload.eldest_kid()?;
    let payload_kid = payload.kid().ok().flatten();

    let payload_version = payload.version()?;
    if payload_version != sig_version.as_u8() as i64 {
        return Err(ChainLinkError::BadVersion(format!(
            "Bad sigchain version hint from server: {} != {}",
            sig_version.as_u8(),
            payload_version
        )));
    }

    let link_type = imported.link_type.or_else(|| {
        LinkType::from_v1_type_and_revocations(&type_name, has_revocations, ignore_if_unsupported)
            .ok()
    });

    let proof_text = if self_uid == Some(&uid) {
        record
            .get("proof_text_full")
            .and_then(Value::as_str)
            .map(str::to_string)
    } else {
        None
    };
    let first_appeared = record
        .get("merkle_seqno")
        .and_then(Value::as_u64)
        .map(Seqno);

    debug!(
        "Imported link {} at seqno {} ({})",
        imported.link_id.short(),
        seqno,
        type_name
    );

    Ok(ChainLink {
        id: imported.link_id,
        seqno,
        prev,
        sig_version,
        seq_type,
        ignore_if_unsupported,
        high_skip,
        link_type,
        kid: Some(imported.kid),
        sig: Some(imported.sig),
        sig_id: Some(imported.sig_id),
        outer: imported.outer,
        unpacked: Some(UnpackedPayload {
            payload,
            uid,
            username,
            type_name,
            ctime,
            expire_in,
            kid: payload_kid,
            eldest_kid,
            has_revocations,
            proof_text,
            first_appeared_merkle_seqno_unverified: first_appeared,
        }),
        hash_verified: true,
        payload_verified: true,
        chain_verified: false,
        computed_high_skip: None,
    })
}
