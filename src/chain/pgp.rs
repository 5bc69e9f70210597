//! Minimal reading of ASCII-armored PGP messages.
//!
//! Only what link import needs: dearmor, walk the packet stream, and pull out
//! the literal data (the signed payload). Signatures themselves are checked
//! elsewhere; compressed messages are rejected.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::chain::error::ChainLinkError;
use crate::chain::sig_id::SigIdBase;

const ARMOR_BEGIN: &str = "-----BEGIN PGP MESSAGE-----";
const ARMOR_END: &str = "-----END PGP MESSAGE-----";

const TAG_SIGNATURE: u8 = 2;
const TAG_ONE_PASS_SIGNATURE: u8 = 4;
const TAG_COMPRESSED: u8 = 8;
const TAG_LITERAL: u8 = 11;

const CRC24_INIT: u32 = 0x00B7_04CE;
const CRC24_POLY: u32 = 0x0186_4CFB;

fn malformed(msg: impl Into<String>) -> ChainLinkError {
    ChainLinkError::Malformed(msg.into())
}

/// Whether a signature string is an armored PGP message.
pub fn is_pgp_sig(sig: &str) -> bool {
    sig.trim_start().starts_with(ARMOR_BEGIN)
}

/// A dearmored PGP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgpMessage {
    raw: Vec<u8>,
}

impl PgpMessage {
    pub fn dearmor(armored: &str) -> Result<Self, ChainLinkError> {
        let mut lines = armored.lines().map(str::trim_end);
        lines
            .by_ref()
            .find(|l| l.trim_start() == ARMOR_BEGIN)
            .ok_or_else(|| malformed("no PGP armor header"))?;

        // Armor headers end at the first blank line.
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            if !line.contains(": ") {
                return Err(malformed(format!("bad armor header line: {}", line)));
            }
        }

        let mut body = String::new();
        let mut checksum = None;
        let mut ended = false;
        for line in lines {
            if line == ARMOR_END {
                ended = true;
                break;
            }
            if let Some(sum) = line.strip_prefix('=') {
                checksum = Some(sum.to_string());
                continue;
            }
            body.push_str(line.trim());
        }
        if !ended {
            return Err(malformed("PGP armor is not terminated"));
        }

        let raw = STANDARD
            .decode(body.as_bytes())
            .map_err(|e| malformed(format!("bad armor base64: {}", e)))?;

        if let Some(sum) = checksum {
            let expected = STANDARD
                .decode(sum.as_bytes())
                .map_err(|e| malformed(format!("bad armor checksum: {}", e)))?;
            let actual = crc24(&raw).to_be_bytes();
            if expected.as_slice() != &actual[1..] {
                return Err(malformed("armor checksum mismatch"));
            }
        }
        Ok(Self { raw })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Sig ids of PGP links hash the dearmored message.
    pub fn sig_id_base(&self) -> SigIdBase {
        SigIdBase::compute(&self.raw)
    }

    /// The literal data carried by the message. The message must also carry a
    /// signature packet.
    pub fn literal_data(&self) -> Result<Vec<u8>, ChainLinkError> {
        let mut literal = None;
        let mut saw_signature = false;
        let mut rest = self.raw.as_slice();
        while !rest.is_empty() {
            let (packet, remaining) = next_packet(rest)?;
            rest = remaining;
            match packet.tag {
                TAG_COMPRESSED => {
                    return Err(malformed("compressed PGP messages are not supported"))
                }
                TAG_LITERAL => {
                    if literal.is_some() {
                        return Err(malformed("more than one literal data packet"));
                    }
                    literal = Some(parse_literal(&packet.body)?);
                }
                TAG_SIGNATURE => saw_signature = true,
                TAG_ONE_PASS_SIGNATURE => {}
                other => {
                    return Err(malformed(format!("unexpected PGP packet tag {}", other)))
                }
            }
        }
        if !saw_signature {
            return Err(malformed("PGP message carries no signature"));
        }
        literal.ok_or_else(|| malformed("PGP message carries no literal data"))
    }
}

struct Packet {
    tag: u8,
    body: Vec<u8>,
}

fn take(input: &[u8], n: usize) -> Result<(&[u8], &[u8]), ChainLinkError> {
    if input.len() < n {
        return Err(malformed("truncated PGP packet"));
    }
    Ok(input.split_at(n))
}

fn be_len(bytes: &[u8]) -> usize {
    bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize)
}

fn next_packet(input: &[u8]) -> Result<(Packet, &[u8]), ChainLinkError> {
    let (header, mut rest) = take(input, 1)?;
    let header = header[0];
    if header & 0x80 == 0 {
        return Err(malformed("bad PGP packet header"));
    }

    if header & 0x40 == 0 {
        // Old format.
        let tag = (header >> 2) & 0x0f;
        let len = match header & 0x03 {
            0 => {
                let (l, r) = take(rest, 1)?;
                rest = r;
                be_len(l)
            }
            1 => {
                let (l, r) = take(rest, 2)?;
                rest = r;
                be_len(l)
            }
            2 => {
                let (l, r) = take(rest, 4)?;
                rest = r;
                be_len(l)
            }
            _ => rest.len(),
        };
        let (body, rest) = take(rest, len)?;
        return Ok((
            Packet {
                tag,
                body: body.to_vec(),
            },
            rest,
        ));
    }

    // New format, possibly split into partial body chunks.
    let tag = header & 0x3f;
    let mut body = Vec::new();
    loop {
        let (first, r) = take(rest, 1)?;
        rest = r;
        let first = first[0] as usize;
        let (len, partial) = match first {
            0..=191 => (first, false),
            192..=223 => {
                let (second, r) = take(rest, 1)?;
                rest = r;
                (((first - 192) << 8) + second[0] as usize + 192, false)
            }
            255 => {
                let (l, r) = take(rest, 4)?;
                rest = r;
                (be_len(l), false)
            }
            _ => (1usize << (first & 0x1f), true),
        };
        let (chunk, r) = take(rest, len)?;
        rest = r;
        body.extend_from_slice(chunk);
        if !partial {
            break;
        }
    }
    Ok((Packet { tag, body }, rest))
}

/// Literal data: format byte, filename, four-byte date, then the data.
fn parse_literal(body: &[u8]) -> Result<Vec<u8>, ChainLinkError> {
    let (_format, rest) = take(body, 1)?;
    let (name_len, rest) = take(rest, 1)?;
    let (_name, rest) = take(rest, name_len[0] as usize)?;
    let (_date, data) = take(rest, 4)?;
    Ok(data.to_vec())
}

fn crc24(data: &[u8]) -> u32 {
    let mut crc = CRC24_INIT;
    for &b in data {
        crc ^= (b as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24_POLY;
            }
        }
    }
    crc & 0x00FF_FFFF
}
