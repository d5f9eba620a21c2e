//! Wire format for the frame preamble and header.
//!
//! Every frame starts with a fixed 8-byte preamble:
//!
//! ```text
//! ┌──────────┬─────────┬────────┬──────────┐
//! │ MAGIC    │ VERSION │ FLAGS  │ HLEN     │
//! │ 4 bytes  │ 1 byte  │ 1 byte │ 2 bytes  │
//! │ u32 LE   │         │        │ u16 LE   │
//! └──────────┴─────────┴────────┴──────────┘
//! ```
//!
//! followed by `HLEN` header bytes, a payload length field (4 bytes, or
//! 8 when the LARGE flag is set), the payload, and a 4-byte CRC32C
//! trailer. All multibyte integers are little-endian.
//!
//! The header itself has two wire forms. The normative form is a compact
//! binary struct introduced by [`HEADER_TAG_BINARY`]; a JSON object form
//! (leading byte `{`) is an interop fallback. Any other leading byte is
//! malformed.

use serde::{Deserialize, Serialize};

use crate::constants::{flags, MAGIC, MAJOR, VERSION_BYTE};
use crate::error::{Result, XcpError};
use crate::schema::SchemaKey;

/// Preamble size in bytes (fixed, exactly 8).
pub const PREAMBLE_LEN: usize = 8;

/// CRC32C trailer size in bytes.
pub const CRC_LEN: usize = 4;

/// Leading byte of a binary-form header. Must differ from `{` (0x7B) so
/// parsers can tell the two forms apart from the first byte.
pub const HEADER_TAG_BINARY: u8 = 0xB1;

/// Fixed portion of a binary header: tag, channel, type, codec, schema
/// key, msg_id, in_reply_to, tag count.
pub const HEADER_FIXED_LEN: usize = 1 + 4 + 2 + 2 + SchemaKey::WIRE_LEN + 8 + 8 + 2;

/// Decoded frame preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub version: u8,
    pub flags: u8,
    pub hlen: u16,
}

impl Preamble {
    /// Encode a preamble for the given flags and header length.
    pub fn encode(frame_flags: u8, hlen: u16) -> [u8; PREAMBLE_LEN] {
        let mut buf = [0u8; PREAMBLE_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4] = VERSION_BYTE;
        buf[5] = frame_flags;
        buf[6..8].copy_from_slice(&hlen.to_le_bytes());
        buf
    }

    /// Decode and validate a preamble.
    ///
    /// Checks the magic, the protocol major version, and the reserved
    /// flag bits. All three are connection-fatal on mismatch.
    pub fn decode(buf: &[u8; PREAMBLE_LEN]) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("fixed slice"));
        if magic != MAGIC {
            return Err(XcpError::BadMagic { found: magic });
        }
        let version = buf[4];
        if version >> 4 != MAJOR {
            return Err(XcpError::UnsupportedVersion {
                found: version,
                local_major: MAJOR,
            });
        }
        let frame_flags = buf[5];
        if frame_flags & flags::RESERVED_MASK != 0 {
            return Err(XcpError::HeaderMalformed(format!(
                "reserved flag bits set: {frame_flags:#04X}"
            )));
        }
        Ok(Self {
            version,
            flags: frame_flags,
            hlen: u16::from_le_bytes(buf[6..8].try_into().expect("fixed slice")),
        })
    }
}

/// Semantic frame header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameHeader {
    /// Independent ordered substream within the connection.
    pub channel_id: u32,
    /// Message type; `0x0000..=0x00FF` control, `0x0100+` data.
    pub msg_type: u16,
    /// Codec id used for the payload body.
    pub body_codec: u16,
    /// Schema identity; all-zero for control frames.
    #[serde(default)]
    pub schema_key: SchemaKey,
    /// Sender-allocated id, strictly monotonic per connection; 0 = unset.
    pub msg_id: u64,
    /// `msg_id` this frame responds to; 0 = none.
    #[serde(default)]
    pub in_reply_to: u64,
    /// Ordered key/value annotations.
    #[serde(default)]
    pub tags: Vec<(String, String)>,
}

impl FrameHeader {
    /// Header for a control frame (zero schema key).
    pub fn control(msg_type: u16, body_codec: u16, msg_id: u64) -> Self {
        Self {
            channel_id: 0,
            msg_type,
            body_codec,
            schema_key: SchemaKey::ZERO,
            msg_id,
            in_reply_to: 0,
            tags: Vec::new(),
        }
    }

    /// Header for a data frame.
    pub fn data(channel_id: u32, body_codec: u16, schema_key: SchemaKey, msg_id: u64) -> Self {
        Self {
            channel_id,
            msg_type: crate::constants::msg_type::DATA,
            body_codec,
            schema_key,
            msg_id,
            in_reply_to: 0,
            tags: Vec::new(),
        }
    }

    /// Check whether this is a control frame.
    #[inline]
    pub fn is_control(&self) -> bool {
        crate::constants::msg_type::is_control(self.msg_type)
    }

    /// Encode to the normative binary form.
    pub fn encode_binary(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_FIXED_LEN + self.tags.len() * 16);
        buf.push(HEADER_TAG_BINARY);
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        buf.extend_from_slice(&self.msg_type.to_le_bytes());
        buf.extend_from_slice(&self.body_codec.to_le_bytes());
        self.schema_key.write_to(&mut buf);
        buf.extend_from_slice(&self.msg_id.to_le_bytes());
        buf.extend_from_slice(&self.in_reply_to.to_le_bytes());
        buf.extend_from_slice(&(self.tags.len() as u16).to_le_bytes());
        for (key, value) in &self.tags {
            write_tag_str(&mut buf, key);
            write_tag_str(&mut buf, value);
        }
        buf
    }

    /// Encode to the JSON fallback form.
    pub fn encode_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode either wire form, detected by the leading byte.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        match buf.first() {
            Some(&HEADER_TAG_BINARY) => Self::decode_binary(buf),
            Some(&b'{') => {
                serde_json::from_slice(buf).map_err(|e| XcpError::HeaderMalformed(e.to_string()))
            }
            Some(&b) => Err(XcpError::HeaderMalformed(format!(
                "unrecognized header form (leading byte {b:#04X})"
            ))),
            None => Err(XcpError::HeaderMalformed("empty header".into())),
        }
    }

    fn decode_binary(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_FIXED_LEN {
            return Err(XcpError::HeaderMalformed(format!(
                "binary header needs {HEADER_FIXED_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let mut at = 1;
        let channel_id = read_u32(buf, &mut at);
        let msg_type = read_u16(buf, &mut at);
        let body_codec = read_u16(buf, &mut at);
        let schema_key = SchemaKey::read_from(&buf[at..])
            .ok_or_else(|| XcpError::HeaderMalformed("schema key truncated".into()))?;
        at += SchemaKey::WIRE_LEN;
        let msg_id = read_u64(buf, &mut at);
        let in_reply_to = read_u64(buf, &mut at);
        let tag_count = read_u16(buf, &mut at) as usize;

        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            let key = read_tag_str(buf, &mut at)?;
            let value = read_tag_str(buf, &mut at)?;
            tags.push((key, value));
        }
        if at != buf.len() {
            return Err(XcpError::HeaderMalformed(format!(
                "{} trailing bytes after header",
                buf.len() - at
            )));
        }
        Ok(Self {
            channel_id,
            msg_type,
            body_codec,
            schema_key,
            msg_id,
            in_reply_to,
            tags,
        })
    }
}

fn write_tag_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn read_tag_str(buf: &[u8], at: &mut usize) -> Result<String> {
    if buf.len() < *at + 2 {
        return Err(XcpError::HeaderMalformed("tag length truncated".into()));
    }
    let len = read_u16(buf, at) as usize;
    if buf.len() < *at + len {
        return Err(XcpError::HeaderMalformed("tag body truncated".into()));
    }
    let s = std::str::from_utf8(&buf[*at..*at + len])
        .map_err(|_| XcpError::HeaderMalformed("tag is not UTF-8".into()))?
        .to_string();
    *at += len;
    Ok(s)
}

#[inline]
fn read_u16(buf: &[u8], at: &mut usize) -> u16 {
    let v = u16::from_le_bytes(buf[*at..*at + 2].try_into().expect("bounds checked"));
    *at += 2;
    v
}

#[inline]
fn read_u32(buf: &[u8], at: &mut usize) -> u32 {
    let v = u32::from_le_bytes(buf[*at..*at + 4].try_into().expect("bounds checked"));
    *at += 4;
    v
}

#[inline]
fn read_u64(buf: &[u8], at: &mut usize) -> u64 {
    let v = u64::from_le_bytes(buf[*at..*at + 8].try_into().expect("bounds checked"));
    *at += 8;
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::msg_type;

    fn sample_header() -> FrameHeader {
        let mut h = FrameHeader::data(3, 0x0001, SchemaKey::for_kind("text", 1, 0), 42);
        h.in_reply_to = 7;
        h.tags.push(("priority".into(), "high".into()));
        h.tags.push(("trace".into(), "abc123".into()));
        h
    }

    #[test]
    fn test_preamble_layout() {
        let buf = Preamble::encode(flags::MORE, 55);
        // Magic little-endian: 10 7A A1 A9.
        assert_eq!(&buf[0..4], &[0x10, 0x7A, 0xA1, 0xA9]);
        assert_eq!(buf[4], VERSION_BYTE);
        assert_eq!(buf[5], flags::MORE);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 55);
    }

    #[test]
    fn test_preamble_roundtrip() {
        let buf = Preamble::encode(flags::COMP | flags::LARGE, 1234);
        let p = Preamble::decode(&buf).unwrap();
        assert_eq!(p.flags, flags::COMP | flags::LARGE);
        assert_eq!(p.hlen, 1234);
        assert_eq!(p.version, VERSION_BYTE);
    }

    #[test]
    fn test_preamble_bad_magic() {
        let mut buf = Preamble::encode(0, 10);
        buf[0] ^= 0xFF;
        let err = Preamble::decode(&buf).unwrap_err();
        assert!(matches!(err, XcpError::BadMagic { .. }));
    }

    #[test]
    fn test_preamble_version_mismatch() {
        let mut buf = Preamble::encode(0, 10);
        buf[4] = 0x12; // major 1
        let err = Preamble::decode(&buf).unwrap_err();
        assert!(matches!(
            err,
            XcpError::UnsupportedVersion { found: 0x12, .. }
        ));
    }

    #[test]
    fn test_preamble_minor_skew_accepted() {
        let mut buf = Preamble::encode(0, 10);
        buf[4] = 0x03; // same major, newer minor
        assert!(Preamble::decode(&buf).is_ok());
    }

    #[test]
    fn test_preamble_reserved_flags_rejected() {
        let mut buf = Preamble::encode(0, 10);
        buf[5] = 0x10;
        let err = Preamble::decode(&buf).unwrap_err();
        assert!(matches!(err, XcpError::HeaderMalformed(_)));
    }

    #[test]
    fn test_binary_header_roundtrip() {
        let header = sample_header();
        let encoded = header.encode_binary();
        assert_eq!(encoded[0], HEADER_TAG_BINARY);
        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_binary_header_no_tags() {
        let header = FrameHeader::control(msg_type::PING, 0x0008, 5);
        let encoded = header.encode_binary();
        assert_eq!(encoded.len(), HEADER_FIXED_LEN);
        assert_eq!(FrameHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_json_header_roundtrip() {
        let header = sample_header();
        let encoded = header.encode_json().unwrap();
        assert_eq!(encoded[0], b'{');
        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_json_header_defaults() {
        // Minimal JSON header; omitted fields take their zero defaults.
        let json = br#"{"channelId":1,"msgType":256,"bodyCodec":1,"msgId":9}"#;
        let decoded = FrameHeader::decode(json).unwrap();
        assert_eq!(decoded.msg_id, 9);
        assert_eq!(decoded.in_reply_to, 0);
        assert!(decoded.schema_key.is_zero());
        assert!(decoded.tags.is_empty());
    }

    #[test]
    fn test_unknown_header_form_rejected() {
        let err = FrameHeader::decode(&[0x55, 0, 0]).unwrap_err();
        assert!(matches!(err, XcpError::HeaderMalformed(_)));
        let err = FrameHeader::decode(&[]).unwrap_err();
        assert!(matches!(err, XcpError::HeaderMalformed(_)));
    }

    #[test]
    fn test_truncated_binary_header_rejected() {
        let header = sample_header();
        let encoded = header.encode_binary();
        for cut in [1, HEADER_FIXED_LEN - 1, encoded.len() - 1] {
            let err = FrameHeader::decode(&encoded[..cut]).unwrap_err();
            assert!(matches!(err, XcpError::HeaderMalformed(_)), "cut {cut}");
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut encoded = sample_header().encode_binary();
        encoded.push(0x00);
        let err = FrameHeader::decode(&encoded).unwrap_err();
        assert!(matches!(err, XcpError::HeaderMalformed(_)));
    }

    #[test]
    fn test_control_header_zero_schema() {
        let h = FrameHeader::control(msg_type::ACK, 0x0008, 11);
        assert!(h.is_control());
        assert!(h.schema_key.is_zero());
        let d = FrameHeader::decode(&h.encode_binary()).unwrap();
        assert!(d.schema_key.is_zero());
    }
}
