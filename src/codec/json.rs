//! JSON codec (0x0001): canonical UTF-8 JSON encoding of an Ether.
//!
//! Binary blobs have no native JSON form, so byte values encode as the
//! tagged object `{"$b64": "<base64>"}` and inline attachment bytes are
//! base64 strings. Integers and floats stay distinct through
//! `serde_json::Number`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde_json::{json, Map};

use crate::constants::codec_id;
use crate::error::{Result, XcpError};
use crate::ether::{Attachment, AttachmentData, Ether, Value};

use super::EtherCodec;

/// Tag key marking a base64-encoded byte value.
const BYTES_KEY: &str = "$b64";

/// JSON codec for human-readable debug and small messages.
pub struct JsonCodec;

impl EtherCodec for JsonCodec {
    fn id(&self) -> u16 {
        codec_id::JSON
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn is_binary(&self) -> bool {
        false
    }

    fn encode(&self, ether: &Ether) -> Result<Vec<u8>> {
        ether.validate()?;
        let mut obj = Map::new();
        obj.insert("kind".into(), json!(ether.kind));
        obj.insert("schema_version".into(), json!(ether.schema_version));
        obj.insert("payload".into(), map_to_json(&ether.payload));
        obj.insert("metadata".into(), map_to_json(&ether.metadata));
        if !ether.extra_fields.is_empty() {
            obj.insert("extra_fields".into(), map_to_json(&ether.extra_fields));
        }
        if !ether.attachments.is_empty() {
            let list: Vec<serde_json::Value> =
                ether.attachments.iter().map(attachment_to_json).collect();
            obj.insert("attachments".into(), serde_json::Value::Array(list));
        }
        Ok(serde_json::to_vec(&serde_json::Value::Object(obj))?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ether> {
        let root: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| XcpError::DecodeFailed(e.to_string()))?;
        let obj = root
            .as_object()
            .ok_or_else(|| XcpError::DecodeFailed("top level is not an object".into()))?;

        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| XcpError::DecodeFailed("missing kind".into()))?
            .to_string();
        let schema_version = obj
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .filter(|&v| v >= 1)
            .ok_or_else(|| XcpError::DecodeFailed("missing or invalid schema_version".into()))?;

        let payload = json_to_map(obj.get("payload"), "payload")?;
        let metadata = json_to_map(obj.get("metadata"), "metadata")?;
        let extra_fields = match obj.get("extra_fields") {
            Some(v) => json_to_map(Some(v), "extra_fields")?,
            None => Default::default(),
        };

        let mut attachments = Vec::new();
        if let Some(list) = obj.get("attachments") {
            let list = list
                .as_array()
                .ok_or_else(|| XcpError::DecodeFailed("attachments is not a list".into()))?;
            for item in list {
                attachments.push(attachment_from_json(item)?);
            }
        }

        Ok(Ether {
            kind,
            schema_version,
            payload,
            metadata,
            extra_fields,
            attachments,
        })
    }
}

fn map_to_json(map: &std::collections::BTreeMap<String, Value>) -> serde_json::Value {
    let mut obj = Map::new();
    for (key, value) in map {
        obj.insert(key.clone(), value_to_json(value));
    }
    serde_json::Value::Object(obj)
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Str(s) => json!(s),
        Value::Bytes(b) => json!({ "$b64": BASE64.encode(b) }),
        Value::List(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
        Value::Map(map) => map_to_json(map),
    }
}

fn json_to_map(
    value: Option<&serde_json::Value>,
    field: &str,
) -> Result<std::collections::BTreeMap<String, Value>> {
    let obj = value
        .and_then(|v| v.as_object())
        .ok_or_else(|| XcpError::DecodeFailed(format!("missing or non-object {field}")))?;
    let mut map = std::collections::BTreeMap::new();
    for (key, v) in obj {
        map.insert(key.clone(), json_to_value(v)?);
    }
    Ok(map)
}

fn json_to_value(value: &serde_json::Value) -> Result<Value> {
    Ok(match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(XcpError::DecodeFailed(format!("unrepresentable number {n}")));
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(json_to_value(item)?);
            }
            Value::List(list)
        }
        serde_json::Value::Object(obj) => {
            // {"$b64": "..."} is the tagged byte form.
            if obj.len() == 1 {
                if let Some(serde_json::Value::String(encoded)) = obj.get(BYTES_KEY) {
                    let raw = BASE64
                        .decode(encoded)
                        .map_err(|e| XcpError::DecodeFailed(format!("bad base64: {e}")))?;
                    return Ok(Value::Bytes(Bytes::from(raw)));
                }
            }
            let mut map = std::collections::BTreeMap::new();
            for (key, v) in obj {
                map.insert(key.clone(), json_to_value(v)?);
            }
            Value::Map(map)
        }
    })
}

fn attachment_to_json(a: &Attachment) -> serde_json::Value {
    let mut obj = Map::new();
    obj.insert("id".into(), json!(a.id));
    match &a.data {
        AttachmentData::Uri(uri) => {
            obj.insert("uri".into(), json!(uri));
        }
        AttachmentData::Inline(bytes) => {
            obj.insert("uri".into(), json!("inline"));
            obj.insert("inline_bytes".into(), json!(BASE64.encode(bytes)));
        }
    }
    obj.insert("media_type".into(), json!(a.media_type));
    obj.insert("codec".into(), json!(a.codec));
    if let Some(shape) = &a.shape {
        obj.insert("shape".into(), json!(shape));
    }
    obj.insert("dtype".into(), json!(a.dtype));
    obj.insert("size_bytes".into(), json!(a.size_bytes));
    serde_json::Value::Object(obj)
}

fn attachment_from_json(value: &serde_json::Value) -> Result<Attachment> {
    let obj = value
        .as_object()
        .ok_or_else(|| XcpError::DecodeFailed("attachment is not an object".into()))?;
    let id = obj
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| XcpError::DecodeFailed("attachment missing id".into()))?
        .to_string();
    let uri = obj
        .get("uri")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let inline_bytes = match obj.get("inline_bytes") {
        Some(serde_json::Value::String(encoded)) => Some(Bytes::from(
            BASE64
                .decode(encoded)
                .map_err(|e| XcpError::DecodeFailed(format!("bad base64: {e}")))?,
        )),
        Some(_) => {
            return Err(XcpError::DecodeFailed(
                "inline_bytes is not a string".into(),
            ))
        }
        None => None,
    };

    let mut attachment = Attachment::from_parts(id, uri, inline_bytes)?;
    if let Some(media_type) = obj.get("media_type").and_then(|v| v.as_str()) {
        attachment.media_type = media_type.to_string();
    }
    if let Some(codec) = obj.get("codec").and_then(|v| v.as_str()) {
        attachment.codec = codec.to_string();
    }
    if let Some(shape) = obj.get("shape").and_then(|v| v.as_array()) {
        let mut dims = Vec::with_capacity(shape.len());
        for d in shape {
            dims.push(
                d.as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| XcpError::DecodeFailed("bad shape dim".into()))?,
            );
        }
        attachment.shape = Some(dims);
    }
    if let Some(dtype) = obj.get("dtype").and_then(|v| v.as_str()) {
        attachment.dtype = dtype.to_string();
    }
    if let Some(size) = obj.get("size_bytes").and_then(|v| v.as_u64()) {
        attachment.size_bytes = size;
    }
    Ok(attachment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> JsonCodec {
        JsonCodec
    }

    #[test]
    fn test_text_roundtrip() {
        let ether = Ether::text("hi");
        let encoded = codec().encode(&ether).unwrap();
        assert_eq!(codec().decode(&encoded).unwrap(), ether);
    }

    #[test]
    fn test_encoding_is_utf8_json() {
        let encoded = codec().encode(&Ether::text("héllo")).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(parsed["kind"], "text");
        assert_eq!(parsed["payload"]["text"], "héllo");
        // No BOM.
        assert_ne!(&encoded[..3], &[0xEF, 0xBB, 0xBF]);
    }

    #[test]
    fn test_int_float_distinction_survives() {
        let ether = Ether::new("nums", 1)
            .with_payload("int", Value::Int(3))
            .with_payload("float", Value::Float(3.5))
            .with_payload("whole_float", Value::Float(4.0));
        let decoded = codec().decode(&codec().encode(&ether).unwrap()).unwrap();
        assert_eq!(decoded.payload["int"], Value::Int(3));
        assert_eq!(decoded.payload["float"], Value::Float(3.5));
        // serde_json keeps "4.0" as a float literal, so even whole floats
        // survive the trip.
        assert_eq!(decoded.payload["whole_float"], Value::Float(4.0));
    }

    #[test]
    fn test_bytes_base64_tagged() {
        let ether =
            Ether::new("blob", 1).with_payload("data", Value::Bytes(Bytes::from_static(b"\x01\x02")));
        let encoded = codec().encode(&ether).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(parsed["payload"]["data"]["$b64"], BASE64.encode(b"\x01\x02"));
        assert_eq!(codec().decode(&encoded).unwrap(), ether);
    }

    #[test]
    fn test_inline_attachment_is_base64() {
        let ether = Ether::new("attached", 1)
            .with_attachment(Attachment::inline("a", Bytes::from_static(b"\xDE\xAD")));
        let encoded = codec().encode(&ether).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(parsed["attachments"][0]["uri"], "inline");
        assert_eq!(
            parsed["attachments"][0]["inline_bytes"],
            BASE64.encode(b"\xDE\xAD")
        );
        assert_eq!(codec().decode(&encoded).unwrap(), ether);
    }

    #[test]
    fn test_uri_attachment_roundtrip() {
        let ether = Ether::new("attached", 1).with_attachment({
            let mut a = Attachment::by_uri("t", "shm://pool/x#0,64", 64);
            a.dtype = "f32".into();
            a.shape = Some(vec![4, 4]);
            a
        });
        assert_eq!(
            codec().decode(&codec().encode(&ether).unwrap()).unwrap(),
            ether
        );
    }

    #[test]
    fn test_nested_structures() {
        let ether = Ether::new("nested", 1).with_payload(
            "list",
            Value::List(vec![
                Value::Null,
                Value::Bool(false),
                Value::List(vec![Value::Int(-1)]),
            ]),
        );
        assert_eq!(
            codec().decode(&codec().encode(&ether).unwrap()).unwrap(),
            ether
        );
    }

    #[test]
    fn test_decode_minimal_envelope() {
        let raw =
            br#"{"kind":"text","schema_version":1,"payload":{"text":"hi"},"metadata":{}}"#;
        let ether = codec().decode(raw).unwrap();
        assert_eq!(ether.kind, "text");
        assert_eq!(ether.schema_version, 1);
        assert_eq!(ether.payload["text"].as_str(), Some("hi"));
        assert!(ether.metadata.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_envelopes() {
        assert!(codec().decode(b"[]").is_err());
        assert!(codec().decode(b"{\"kind\":\"x\"}").is_err());
        assert!(codec()
            .decode(br#"{"kind":"x","schema_version":0,"payload":{},"metadata":{}}"#)
            .is_err());
        assert!(codec().decode(b"not json").is_err());
    }

    #[test]
    fn test_decode_rejects_both_uri_and_bytes() {
        let raw = br#"{"kind":"x","schema_version":1,"payload":{},"metadata":{},
            "attachments":[{"id":"a","uri":"shm://p/n#0,1","inline_bytes":"QQ=="}]}"#;
        assert!(codec().decode(raw).is_err());
    }
}
