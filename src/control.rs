//! Control message bodies: capability records, ACK/NACK, PING/PONG, and
//! clarification exchanges.
//!
//! Control bodies carry either the compact binary form (body codec
//! BINARY_STRUCT) or the JSON fallback (body codec JSON); both peers must
//! support both. Binary is the default on the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{get_varuint, put_varuint};
use crate::constants::{codec_id, DEFAULT_MAX_FRAME_BYTES};
use crate::error::{Result, XcpError};
use crate::schema::SchemaRange;

/// Peer-advertised capabilities, exchanged in HELLO and CAPS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    /// Supported codec ids.
    pub codecs: Vec<u16>,
    /// Largest frame payload the peer accepts.
    pub max_frame_bytes: u32,
    /// Schema ranges the peer accepts inbound.
    #[serde(default)]
    pub accepted: Vec<SchemaRange>,
    /// Schema ranges the peer may emit.
    #[serde(default)]
    pub emitted: Vec<SchemaRange>,
    /// Whether the peer can consume `shm://` attachments.
    #[serde(default)]
    pub shared_mem: bool,
}

impl Default for CapabilityRecord {
    fn default() -> Self {
        Self {
            codecs: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            accepted: Vec::new(),
            emitted: Vec::new(),
            shared_mem: false,
        }
    }
}

/// Outcome of capability negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Codec ids both sides support, in local preference order.
    pub codecs: Vec<u16>,
    /// `min(local, peer)` frame budget.
    pub max_frame_bytes: u32,
    /// Both sides can hand off shared-memory attachments.
    pub shared_mem: bool,
}

/// Intersect local and peer capabilities.
///
/// The result's codec set is `local ∩ peer`, ordered by the local list.
/// An empty intersection is the caller's problem to surface
/// (`ERR_CODEC_UNSUPPORTED` + close).
pub fn negotiate(local: &CapabilityRecord, peer: &CapabilityRecord) -> Negotiated {
    let codecs = local
        .codecs
        .iter()
        .copied()
        .filter(|id| peer.codecs.contains(id))
        .collect();
    Negotiated {
        codecs,
        max_frame_bytes: local.max_frame_bytes.min(peer.max_frame_bytes),
        shared_mem: local.shared_mem && peer.shared_mem,
    }
}

/// A control body with both wire forms.
pub trait ControlBody: Serialize + DeserializeOwned + Sized {
    fn encode_binary(&self) -> Vec<u8>;
    fn decode_binary(bytes: &[u8]) -> Result<Self>;

    /// Encode under the given body codec id.
    fn encode(&self, body_codec: u16) -> Result<Vec<u8>> {
        match body_codec {
            codec_id::BINARY_STRUCT => Ok(self.encode_binary()),
            codec_id::JSON => Ok(serde_json::to_vec(self)?),
            other => Err(XcpError::UnknownCodec(other)),
        }
    }

    /// Decode under the given body codec id.
    fn decode(body_codec: u16, bytes: &[u8]) -> Result<Self> {
        match body_codec {
            codec_id::BINARY_STRUCT => Self::decode_binary(bytes),
            codec_id::JSON => {
                serde_json::from_slice(bytes).map_err(|e| XcpError::DecodeFailed(e.to_string()))
            }
            other => Err(XcpError::UnknownCodec(other)),
        }
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_varuint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn get_str(buf: &[u8], at: &mut usize) -> Result<String> {
    let len = get_varuint(buf, at)? as usize;
    let end = at
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| XcpError::DecodeFailed("string truncated".into()))?;
    let s = std::str::from_utf8(&buf[*at..end])
        .map_err(|_| XcpError::DecodeFailed("string is not UTF-8".into()))?
        .to_string();
    *at = end;
    Ok(s)
}

impl ControlBody for CapabilityRecord {
    fn encode_binary(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        put_varuint(&mut buf, self.codecs.len() as u64);
        for id in &self.codecs {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        buf.extend_from_slice(&self.max_frame_bytes.to_le_bytes());
        for ranges in [&self.accepted, &self.emitted] {
            put_varuint(&mut buf, ranges.len() as u64);
            for range in ranges.iter() {
                range.write_to(&mut buf);
            }
        }
        buf.push(u8::from(self.shared_mem));
        buf
    }

    fn decode_binary(bytes: &[u8]) -> Result<Self> {
        let mut at = 0;
        let codec_count = get_varuint(bytes, &mut at)? as usize;
        let mut codecs = Vec::with_capacity(codec_count.min(256));
        for _ in 0..codec_count {
            let end = at + 2;
            if end > bytes.len() {
                return Err(XcpError::DecodeFailed("codec list truncated".into()));
            }
            codecs.push(u16::from_le_bytes(
                bytes[at..end].try_into().expect("len checked"),
            ));
            at = end;
        }
        if at + 4 > bytes.len() {
            return Err(XcpError::DecodeFailed("max_frame_bytes truncated".into()));
        }
        let max_frame_bytes =
            u32::from_le_bytes(bytes[at..at + 4].try_into().expect("len checked"));
        at += 4;

        let mut range_lists = [Vec::new(), Vec::new()];
        for list in &mut range_lists {
            let count = get_varuint(bytes, &mut at)? as usize;
            for _ in 0..count {
                let range = SchemaRange::read_from(&bytes[at..])
                    .ok_or_else(|| XcpError::DecodeFailed("schema range truncated".into()))?;
                at += SchemaRange::WIRE_LEN;
                list.push(range);
            }
        }
        let [accepted, emitted] = range_lists;

        let shared_mem = *bytes
            .get(at)
            .ok_or_else(|| XcpError::DecodeFailed("shared_mem flag truncated".into()))?
            != 0;
        Ok(Self {
            codecs,
            max_frame_bytes,
            accepted,
            emitted,
            shared_mem,
        })
    }
}

/// ACK body: `{ msg_id }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    pub msg_id: u64,
}

impl ControlBody for AckBody {
    fn encode_binary(&self) -> Vec<u8> {
        self.msg_id.to_le_bytes().to_vec()
    }

    fn decode_binary(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 8 {
            return Err(XcpError::DecodeFailed("ack body must be 8 bytes".into()));
        }
        Ok(Self {
            msg_id: u64::from_le_bytes(bytes.try_into().expect("len checked")),
        })
    }
}

/// NACK body: `{ msg_id, error_code, retry_after_ms? }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NackBody {
    pub msg_id: u64,
    pub error_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ControlBody for NackBody {
    fn encode_binary(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(19);
        buf.extend_from_slice(&self.msg_id.to_le_bytes());
        buf.extend_from_slice(&self.error_code.to_le_bytes());
        match self.retry_after_ms {
            Some(ms) => {
                buf.push(1);
                buf.extend_from_slice(&ms.to_le_bytes());
            }
            None => buf.push(0),
        }
        buf
    }

    fn decode_binary(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 11 {
            return Err(XcpError::DecodeFailed("nack body truncated".into()));
        }
        let msg_id = u64::from_le_bytes(bytes[0..8].try_into().expect("len checked"));
        let error_code = u16::from_le_bytes(bytes[8..10].try_into().expect("len checked"));
        let retry_after_ms = match bytes[10] {
            0 if bytes.len() == 11 => None,
            1 if bytes.len() == 19 => Some(u64::from_le_bytes(
                bytes[11..19].try_into().expect("len checked"),
            )),
            _ => return Err(XcpError::DecodeFailed("malformed nack body".into())),
        };
        Ok(Self {
            msg_id,
            error_code,
            retry_after_ms,
        })
    }
}

/// PING/PONG body: `{ nonce }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingBody {
    pub nonce: u64,
}

impl ControlBody for PingBody {
    fn encode_binary(&self) -> Vec<u8> {
        self.nonce.to_le_bytes().to_vec()
    }

    fn decode_binary(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 8 {
            return Err(XcpError::DecodeFailed("ping body must be 8 bytes".into()));
        }
        Ok(Self {
            nonce: u64::from_le_bytes(bytes.try_into().expect("len checked")),
        })
    }
}

/// CLARIFY_REQ body: `{ reason, fields }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarifyReqBody {
    pub reason: String,
    pub fields: Vec<String>,
}

impl ControlBody for ClarifyReqBody {
    fn encode_binary(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_str(&mut buf, &self.reason);
        put_varuint(&mut buf, self.fields.len() as u64);
        for field in &self.fields {
            put_str(&mut buf, field);
        }
        buf
    }

    fn decode_binary(bytes: &[u8]) -> Result<Self> {
        let mut at = 0;
        let reason = get_str(bytes, &mut at)?;
        let count = get_varuint(bytes, &mut at)? as usize;
        let mut fields = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            fields.push(get_str(bytes, &mut at)?);
        }
        Ok(Self { reason, fields })
    }
}

/// CLARIFY_RES body: `{ fields }`; the frame's `in_reply_to` links it to
/// the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarifyResBody {
    pub fields: Vec<(String, String)>,
}

impl ControlBody for ClarifyResBody {
    fn encode_binary(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_varuint(&mut buf, self.fields.len() as u64);
        for (key, value) in &self.fields {
            put_str(&mut buf, key);
            put_str(&mut buf, value);
        }
        buf
    }

    fn decode_binary(bytes: &[u8]) -> Result<Self> {
        let mut at = 0;
        let count = get_varuint(bytes, &mut at)? as usize;
        let mut fields = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let key = get_str(bytes, &mut at)?;
            let value = get_str(bytes, &mut at)?;
            fields.push((key, value));
        }
        Ok(Self { fields })
    }
}
