#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rmpv::Value as MsgpackValue;
use serde_json::{json, Value};

use sigchain::chain::{
    compute_link_id, ApiClient, ApiError, Clock, LinkId, LinkType, MerkleClient, MerkleLeaf,
    MerkleRoot, OuterLinkV2, SeqType, Seqno, SessionRequirement, Uid,
};

pub const USERNAME: &str = "alice";

pub fn uid() -> Uid {
    Uid::from_hex("7a5e2b4d7d6c1e3a8f1b9c0d2e4f6a19").unwrap()
}

pub fn kid_hex(fill: u8) -> String {
    format!("0120{}0a", hex::encode([fill; 32]))
}

/// One link as the server would deliver it, plus what went into it.
#[derive(Debug, Clone)]
pub struct WireLink {
    pub record: Value,
    pub payload: String,
    pub outer: OuterLinkV2,
    pub num_fields: usize,
    pub link_id: LinkId,
}

impl WireLink {
    /// The same link with its payload withheld.
    pub fn stubbed(&self) -> Value {
        let raw = self.outer.encode_partial(self.num_fields).unwrap();
        json!({ "seqno": self.outer.seqno.0, "s2": STANDARD.encode(raw) })
    }

    /// Edit the payload without re-signing the envelope.
    pub fn tamper_payload(&mut self, edit: impl FnOnce(&mut Value)) {
        let mut payload: Value = serde_json::from_str(&self.payload).unwrap();
        edit(&mut payload);
        self.payload = payload.to_string();
        self.record["payload_json"] = Value::String(self.payload.clone());
    }
}

struct PendingLink {
    type_name: String,
    body: Value,
}

/// Builds a chain of V2 records owned by one user.
pub struct ChainBuilder {
    uid: Uid,
    username: String,
    high_skips: bool,
    pending: Vec<PendingLink>,
}

fn is_high_type(type_name: &str) -> bool {
    matches!(type_name, "eldest" | "sibkey" | "pgp_update" | "revoke")
}

impl ChainBuilder {
    pub fn new(uid: Uid, username: &str) -> Self {
        Self {
            uid,
            username: username.to_string(),
            high_skips: false,
            pending: Vec::new(),
        }
    }

    /// An eldest link followed by `n - 1` web service bindings.
    pub fn linear(n: usize) -> Self {
        let mut builder = Self::new(uid(), USERNAME).link("eldest");
        for _ in 1..n {
            builder = builder.link("web_service_binding");
        }
        builder
    }

    pub fn with_high_skips(mut self) -> Self {
        self.high_skips = true;
        self
    }

    pub fn link(self, type_name: &str) -> Self {
        self.link_with_body(type_name, json!({}))
    }

    /// Add a link whose `body` carries extra sections (e.g. `sibkey`).
    pub fn link_with_body(mut self, type_name: &str, body: Value) -> Self {
        self.pending.push(PendingLink {
            type_name: type_name.to_string(),
            body,
        });
        self
    }

    pub fn build(&self) -> Vec<WireLink> {
        let mut out: Vec<WireLink> = Vec::new();
        let mut prev: Option<LinkId> = None;
        let mut last_high = (0u64, None::<LinkId>);

        for (i, link) in self.pending.iter().enumerate() {
            let seqno = i as u64 + 1;

            let mut body = json!({
                "key": {
                    "kid": kid_hex(0x11),
                    "eldest_kid": kid_hex(0x11),
                    "uid": self.uid.to_hex(),
                    "username": self.username,
                },
                "type": link.type_name,
                "version": 2,
            });
            if let Value::Object(extra) = &link.body {
                for (k, v) in extra {
                    body[k] = v.clone();
                }
            }
            let mut payload = json!({
                "body": body,
                "ctime": 1_500_000_000 + seqno,
                "expire_in": 314_496_000,
                "prev": prev.map(|p| p.to_hex()),
                "seqno": seqno,
                "tag": "signature",
            });
            if self.high_skips {
                payload["high_skip"] = json!({
                    "seqno": last_high.0,
                    "hash": last_high.1.map(|h| h.to_hex()),
                });
            }
            let payload = payload.to_string();

            let has_revocations = link.body.get("revoke").is_some();
            let link_type =
                LinkType::from_v1_type_and_revocations(&link.type_name, has_revocations, false)
                    .unwrap();
            let outer = OuterLinkV2 {
                version: 2,
                seqno: Seqno(seqno),
                prev,
                curr: Some(compute_link_id(payload.as_bytes())),
                link_type,
                seq_type: SeqType::PUBLIC,
                ignore_if_unsupported: false,
                high_skip_seqno: self.high_skips.then_some(Seqno(last_high.0)),
                high_skip_hash: if self.high_skips { last_high.1 } else { None },
            };
            let num_fields = if self.high_skips { 9 } else { 7 };
            let outer_raw = outer.encode_partial(num_fields).unwrap();
            let link_id = compute_link_id(&outer_raw);

            let record = json!({
                "seqno": seqno,
                "sig_version": 2,
                "si2": si2(&outer_raw, num_fields),
                "payload_json": payload,
            });

            if seqno == 1 || is_high_type(&link.type_name) || has_revocations {
                last_high = (seqno, Some(link_id));
            }
            prev = Some(link_id);
            out.push(WireLink {
                record,
                payload,
                outer,
                num_fields,
                link_id,
            });
        }
        out
    }
}

fn si2(outer_raw: &[u8], num_fields: usize) -> String {
    let partial = rmpv::decode::read_value(&mut &outer_raw[..]).unwrap();
    let arr = MsgpackValue::Array(vec![
        MsgpackValue::Binary(vec![7; 64]),
        partial,
        MsgpackValue::from(num_fields as u64),
    ]);
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &arr).unwrap();
    STANDARD.encode(bytes)
}

pub fn records(links: &[WireLink]) -> Vec<Value> {
    links.iter().map(|l| l.record.clone()).collect()
}

/// Clock the test moves by hand.
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Mutex::new(start))
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.0.lock().unwrap() = t;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Merkle tree that reports a settable tip for every user.
pub struct MockMerkle {
    pub tip_seqno: AtomicU64,
    pub tip_hash: Mutex<LinkId>,
    pub calls: AtomicUsize,
    pub fail: Mutex<bool>,
}

impl MockMerkle {
    pub fn new(seqno: u64, hash: LinkId) -> Self {
        Self {
            tip_seqno: AtomicU64::new(seqno),
            tip_hash: Mutex::new(hash),
            calls: AtomicUsize::new(0),
            fail: Mutex::new(false),
        }
    }

    pub fn set_tip(&self, seqno: u64, hash: LinkId) {
        self.tip_seqno.store(seqno, Ordering::SeqCst);
        *self.tip_hash.lock().unwrap() = hash;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MerkleClient for MockMerkle {
    async fn lookup_leaf_at_seqno(
        &self,
        uid: &Uid,
        _seqno: Seqno,
    ) -> Result<(Option<MerkleLeaf>, MerkleRoot), ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock().unwrap() {
            return Err(ApiError::Transport("merkle down".to_string()));
        }
        let seqno = self.tip_seqno.load(Ordering::SeqCst);
        let leaf = (seqno > 0).then(|| MerkleLeaf {
            uid: *uid,
            seqno: Seqno(seqno),
            sig_id: None,
            chain_tip_hash: *self.tip_hash.lock().unwrap(),
        });
        Ok((leaf, self.last_root().await?))
    }

    async fn last_root(&self) -> Result<MerkleRoot, ApiError> {
        Ok(MerkleRoot {
            seqno: Seqno(1000),
            hash: vec![0xAA; 32],
            ctime: Utc::now(),
        })
    }
}

/// API server holding one user's chain.
pub struct MockApi {
    pub username: String,
    pub sigs: Mutex<Vec<Value>>,
    pub status: Mutex<i64>,
    pub calls: AtomicUsize,
}

impl MockApi {
    pub fn new(username: &str, sigs: Vec<Value>) -> Self {
        Self {
            username: username.to_string(),
            sigs: Mutex::new(sigs),
            status: Mutex::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn status(&self) -> Value {
        json!({ "code": *self.status.lock().unwrap(), "desc": "mock status" })
    }
}

#[async_trait]
impl ApiClient for MockApi {
    async fn get_decode(
        &self,
        endpoint: &str,
        _args: &[(&str, String)],
        _session: SessionRequirement,
    ) -> Result<Value, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match endpoint {
            "user/lookup" => Ok(json!({
                "status": self.status(),
                "them": { "basics": { "username": self.username } },
            })),
            "sig/get" => Ok(json!({
                "status": self.status(),
                "sigs": self.sigs.lock().unwrap().clone(),
            })),
            other => Err(ApiError::Transport(format!("no route for {}", other))),
        }
    }

    async fn post_decode(
        &self,
        endpoint: &str,
        _args: &[(&str, String)],
        _session: SessionRequirement,
    ) -> Result<Value, ApiError> {
        Err(ApiError::Transport(format!("no route for {}", endpoint)))
    }
}
