//! BINARY_STRUCT codec (0x0008): compact tag-length-value encoding of an
//! Ether for control bodies and small data frames.
//!
//! Layout, all integers little-endian, lengths as varuints:
//!
//! ```text
//! kind: str
//! schema_version: varuint
//! payload: map
//! metadata: map
//! extra_fields: map
//! attachments: varuint count, then per attachment:
//!   id str, locator (0x00 uri str | 0x01 inline bytes),
//!   media_type str, codec str,
//!   shape (0x00 absent | 0x01 + varuint count + u32 dims),
//!   dtype str, size_bytes varuint
//! ```
//!
//! Values are one type byte followed by the body; integers are
//! zigzag-varint, floats 8-byte LE, bytes raw (never base64).

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::constants::codec_id;
use crate::error::{Result, XcpError};
use crate::ether::{Attachment, AttachmentData, Ether, Value};

use super::EtherCodec;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_MAP: u8 = 0x07;

const LOCATOR_URI: u8 = 0x00;
const LOCATOR_INLINE: u8 = 0x01;

// ---------------------------------------------------------------------------
// varint primitives (shared with the tensor codecs)
// ---------------------------------------------------------------------------

/// Append a LEB128 varuint.
pub(crate) fn put_varuint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read a LEB128 varuint, at most 10 bytes.
pub(crate) fn get_varuint(buf: &[u8], at: &mut usize) -> Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*at)
            .ok_or_else(|| XcpError::DecodeFailed("varuint truncated".into()))?;
        *at += 1;
        if shift >= 64 {
            return Err(XcpError::DecodeFailed("varuint overflow".into()));
        }
        v |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}

#[inline]
fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
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

fn put_raw(buf: &mut Vec<u8>, data: &[u8]) {
    put_varuint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

fn get_raw(buf: &[u8], at: &mut usize) -> Result<Bytes> {
    let len = get_varuint(buf, at)? as usize;
    let end = at
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| XcpError::DecodeFailed("byte field truncated".into()))?;
    let b = Bytes::copy_from_slice(&buf[*at..end]);
    *at = end;
    Ok(b)
}

// ---------------------------------------------------------------------------
// value encoding
// ---------------------------------------------------------------------------

fn put_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*b));
        }
        Value::Int(i) => {
            buf.push(TAG_INT);
            put_varuint(buf, zigzag(*i));
        }
        Value::Float(f) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        Value::Str(s) => {
            buf.push(TAG_STR);
            put_str(buf, s);
        }
        Value::Bytes(b) => {
            buf.push(TAG_BYTES);
            put_raw(buf, b);
        }
        Value::List(items) => {
            buf.push(TAG_LIST);
            put_varuint(buf, items.len() as u64);
            for item in items {
                put_value(buf, item);
            }
        }
        Value::Map(map) => {
            buf.push(TAG_MAP);
            put_map(buf, map);
        }
    }
}

fn get_value(buf: &[u8], at: &mut usize) -> Result<Value> {
    let tag = *buf
        .get(*at)
        .ok_or_else(|| XcpError::DecodeFailed("value tag truncated".into()))?;
    *at += 1;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => {
            let b = *buf
                .get(*at)
                .ok_or_else(|| XcpError::DecodeFailed("bool truncated".into()))?;
            *at += 1;
            Ok(Value::Bool(b != 0))
        }
        TAG_INT => Ok(Value::Int(unzigzag(get_varuint(buf, at)?))),
        TAG_FLOAT => {
            let end = *at + 8;
            if end > buf.len() {
                return Err(XcpError::DecodeFailed("float truncated".into()));
            }
            let f = f64::from_le_bytes(buf[*at..end].try_into().expect("len checked"));
            *at = end;
            Ok(Value::Float(f))
        }
        TAG_STR => Ok(Value::Str(get_str(buf, at)?)),
        TAG_BYTES => Ok(Value::Bytes(get_raw(buf, at)?)),
        TAG_LIST => {
            let count = get_varuint(buf, at)? as usize;
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(get_value(buf, at)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => Ok(Value::Map(get_map(buf, at)?)),
        other => Err(XcpError::DecodeFailed(format!(
            "unknown value tag {other:#04X}"
        ))),
    }
}

fn put_map(buf: &mut Vec<u8>, map: &BTreeMap<String, Value>) {
    put_varuint(buf, map.len() as u64);
    for (key, value) in map {
        put_str(buf, key);
        put_value(buf, value);
    }
}

fn get_map(buf: &[u8], at: &mut usize) -> Result<BTreeMap<String, Value>> {
    let count = get_varuint(buf, at)? as usize;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = get_str(buf, at)?;
        map.insert(key, get_value(buf, at)?);
    }
    Ok(map)
}

// ---------------------------------------------------------------------------
// attachments
// ---------------------------------------------------------------------------

fn put_attachment(buf: &mut Vec<u8>, a: &Attachment) {
    put_str(buf, &a.id);
    match &a.data {
        AttachmentData::Uri(uri) => {
            buf.push(LOCATOR_URI);
            put_str(buf, uri);
        }
        AttachmentData::Inline(bytes) => {
            buf.push(LOCATOR_INLINE);
            put_raw(buf, bytes);
        }
    }
    put_str(buf, &a.media_type);
    put_str(buf, &a.codec);
    match &a.shape {
        None => buf.push(0x00),
        Some(dims) => {
            buf.push(0x01);
            put_varuint(buf, dims.len() as u64);
            for d in dims {
                buf.extend_from_slice(&d.to_le_bytes());
            }
        }
    }
    put_str(buf, &a.dtype);
    put_varuint(buf, a.size_bytes);
}

fn get_attachment(buf: &[u8], at: &mut usize) -> Result<Attachment> {
    let id = get_str(buf, at)?;
    let locator = *buf
        .get(*at)
        .ok_or_else(|| XcpError::DecodeFailed("attachment locator truncated".into()))?;
    *at += 1;
    let data = match locator {
        LOCATOR_URI => AttachmentData::Uri(get_str(buf, at)?),
        LOCATOR_INLINE => AttachmentData::Inline(get_raw(buf, at)?),
        other => {
            return Err(XcpError::DecodeFailed(format!(
                "unknown attachment locator {other:#04X}"
            )))
        }
    };
    let media_type = get_str(buf, at)?;
    let codec = get_str(buf, at)?;
    let shape = match *buf
        .get(*at)
        .ok_or_else(|| XcpError::DecodeFailed("attachment shape marker truncated".into()))?
    {
        0x00 => {
            *at += 1;
            None
        }
        0x01 => {
            *at += 1;
            let count = get_varuint(buf, at)? as usize;
            let mut dims = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                let end = *at + 4;
                if end > buf.len() {
                    return Err(XcpError::DecodeFailed("shape dim truncated".into()));
                }
                dims.push(u32::from_le_bytes(
                    buf[*at..end].try_into().expect("len checked"),
                ));
                *at = end;
            }
            Some(dims)
        }
        other => {
            return Err(XcpError::DecodeFailed(format!(
                "bad shape marker {other:#04X}"
            )))
        }
    };
    let dtype = get_str(buf, at)?;
    let size_bytes = get_varuint(buf, at)?;
    Ok(Attachment {
        id,
        data,
        media_type,
        codec,
        shape,
        dtype,
        size_bytes,
    })
}

// ---------------------------------------------------------------------------
// codec
// ---------------------------------------------------------------------------

/// Binary struct codec for control and small data messages.
pub struct BinaryStructCodec;

impl EtherCodec for BinaryStructCodec {
    fn id(&self) -> u16 {
        codec_id::BINARY_STRUCT
    }

    fn name(&self) -> &'static str {
        "binary_struct"
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn encode(&self, ether: &Ether) -> Result<Vec<u8>> {
        ether.validate()?;
        let mut buf = Vec::with_capacity(128);
        put_str(&mut buf, &ether.kind);
        put_varuint(&mut buf, u64::from(ether.schema_version));
        put_map(&mut buf, &ether.payload);
        put_map(&mut buf, &ether.metadata);
        put_map(&mut buf, &ether.extra_fields);
        put_varuint(&mut buf, ether.attachments.len() as u64);
        for attachment in &ether.attachments {
            put_attachment(&mut buf, attachment);
        }
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ether> {
        let mut at = 0;
        let kind = get_str(bytes, &mut at)?;
        let schema_version = u32::try_from(get_varuint(bytes, &mut at)?)
            .map_err(|_| XcpError::DecodeFailed("schema_version out of range".into()))?;
        let payload = get_map(bytes, &mut at)?;
        let metadata = get_map(bytes, &mut at)?;
        let extra_fields = get_map(bytes, &mut at)?;
        let count = get_varuint(bytes, &mut at)? as usize;
        let mut attachments = Vec::new();
        for _ in 0..count {
            attachments.push(get_attachment(bytes, &mut at)?);
        }
        if at != bytes.len() {
            return Err(XcpError::DecodeFailed(format!(
                "{} trailing bytes",
                bytes.len() - at
            )));
        }
        let ether = Ether {
            kind,
            schema_version,
            payload,
            metadata,
            extra_fields,
            attachments,
        };
        if ether.schema_version == 0 || ether.kind.is_empty() {
            return Err(XcpError::DecodeFailed("invalid envelope fields".into()));
        }
        Ok(ether)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> BinaryStructCodec {
        BinaryStructCodec
    }

    #[test]
    fn test_varuint_roundtrip() {
        let mut buf = Vec::new();
        for v in [0u64, 1, 127, 128, 300, 1 << 20, u64::MAX] {
            buf.clear();
            put_varuint(&mut buf, v);
            let mut at = 0;
            assert_eq!(get_varuint(&buf, &mut at).unwrap(), v);
            assert_eq!(at, buf.len());
        }
    }

    #[test]
    fn test_varuint_truncated() {
        let mut at = 0;
        assert!(get_varuint(&[0x80], &mut at).is_err());
    }

    #[test]
    fn test_zigzag() {
        for v in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
    }

    #[test]
    fn test_simple_roundtrip() {
        let ether = Ether::text("hello binary");
        let encoded = codec().encode(&ether).unwrap();
        assert_eq!(codec().decode(&encoded).unwrap(), ether);
    }

    #[test]
    fn test_value_types_roundtrip() {
        let ether = Ether::new("mixed", 2)
            .with_payload("null", Value::Null)
            .with_payload("flag", Value::Bool(true))
            .with_payload("count", Value::Int(-42))
            .with_payload("ratio", Value::Float(0.125))
            .with_payload("name", Value::Str("x".into()))
            .with_payload("blob", Value::Bytes(Bytes::from_static(b"\x00\x01\xFF")))
            .with_payload(
                "list",
                Value::List(vec![Value::Int(1), Value::Str("two".into())]),
            );
        let encoded = codec().encode(&ether).unwrap();
        assert_eq!(codec().decode(&encoded).unwrap(), ether);
    }

    #[test]
    fn test_int_float_not_conflated() {
        let ether = Ether::new("nums", 1)
            .with_payload("int", Value::Int(1))
            .with_payload("float", Value::Float(1.0));
        let decoded = codec().decode(&codec().encode(&ether).unwrap()).unwrap();
        assert_eq!(decoded.payload["int"], Value::Int(1));
        assert_eq!(decoded.payload["float"], Value::Float(1.0));
    }

    #[test]
    fn test_bytes_are_raw_not_base64() {
        let blob = Bytes::from_static(b"\x00\x01\x02\x03");
        let ether = Ether::new("raw", 1).with_payload("data", Value::Bytes(blob.clone()));
        let encoded = codec().encode(&ether).unwrap();
        // The raw bytes appear verbatim in the encoding.
        assert!(encoded
            .windows(blob.len())
            .any(|w| w == &blob[..]));
    }

    #[test]
    fn test_attachments_roundtrip() {
        let ether = Ether::new("attached", 1)
            .with_attachment({
                let mut a = Attachment::inline("inline-blob", Bytes::from_static(b"abc"));
                a.media_type = "application/octet-stream".into();
                a.codec = "tensor_f32".into();
                a.shape = Some(vec![2, 3]);
                a.dtype = "f32".into();
                a
            })
            .with_attachment(Attachment::by_uri("shm-blob", "shm://pool/x#0,1024", 1024));
        let decoded = codec().decode(&codec().encode(&ether).unwrap()).unwrap();
        assert_eq!(decoded, ether);
        assert_eq!(decoded.attachments[1].uri(), Some("shm://pool/x#0,1024"));
    }

    #[test]
    fn test_nested_map_roundtrip() {
        let mut inner = BTreeMap::new();
        inner.insert("deep".to_string(), Value::Int(7));
        let ether = Ether::new("nested", 1).with_payload("outer", Value::Map(inner));
        let decoded = codec().decode(&codec().encode(&ether).unwrap()).unwrap();
        assert_eq!(decoded, ether);
    }

    #[test]
    fn test_decode_truncated_fails() {
        let encoded = codec().encode(&Ether::text("hello")).unwrap();
        for cut in [0, 1, encoded.len() / 2, encoded.len() - 1] {
            assert!(codec().decode(&encoded[..cut]).is_err(), "cut {cut}");
        }
    }

    #[test]
    fn test_decode_trailing_garbage_fails() {
        let mut encoded = codec().encode(&Ether::text("hello")).unwrap();
        encoded.push(0xFF);
        assert!(codec().decode(&encoded).is_err());
    }

    #[test]
    fn test_encode_rejects_invalid_envelope() {
        assert!(codec().encode(&Ether::new("", 1)).is_err());
        assert!(codec().encode(&Ether::new("x", 0)).is_err());
    }
}
