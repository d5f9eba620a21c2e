//! The Ether envelope: self-describing data exchanged between agents.
//!
//! Payload and metadata are text-keyed mappings of tagged [`Value`]s so
//! codecs can preserve numeric precision and carry binary blobs without
//! guessing. Attachments reference large bodies either inline or through
//! a URI, never both.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{Result, XcpError};

/// Reserved metadata keys.
pub mod meta_keys {
    pub const TRACE_ID: &str = "trace_id";
    pub const PRODUCER: &str = "producer";
    pub const CREATED_AT: &str = "created_at";
    pub const LINEAGE: &str = "lineage";
}

/// A tagged value inside an Ether mapping.
///
/// Integers and floats are distinct variants; blobs are raw bytes, not
/// strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// Where an attachment's bytes live: external URI or inline.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentData {
    /// External reference, e.g. `shm://pool/block#0,1024`.
    Uri(String),
    /// Bytes carried inside the envelope.
    Inline(Bytes),
}

/// Binary attachment referenced by an Ether.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub id: String,
    pub data: AttachmentData,
    pub media_type: String,
    /// Registry codec name describing the body, e.g. `tensor_f32`.
    pub codec: String,
    pub shape: Option<Vec<u32>>,
    pub dtype: String,
    pub size_bytes: u64,
}

impl Attachment {
    /// Inline attachment; `size_bytes` derived from the data.
    pub fn inline(id: impl Into<String>, data: Bytes) -> Self {
        let size_bytes = data.len() as u64;
        Self {
            id: id.into(),
            data: AttachmentData::Inline(data),
            media_type: String::new(),
            codec: String::new(),
            shape: None,
            dtype: String::new(),
            size_bytes,
        }
    }

    /// URI-referenced attachment.
    pub fn by_uri(id: impl Into<String>, uri: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id: id.into(),
            data: AttachmentData::Uri(uri.into()),
            media_type: String::new(),
            codec: String::new(),
            shape: None,
            dtype: String::new(),
            size_bytes,
        }
    }

    /// Build from decoded optional fields, rejecting the uri/inline
    /// combinations the envelope model does not allow.
    pub fn from_parts(
        id: String,
        uri: Option<String>,
        inline_bytes: Option<Bytes>,
    ) -> Result<Self> {
        let data = match (uri, inline_bytes) {
            (Some(u), None) => AttachmentData::Uri(u),
            (None, Some(b)) => AttachmentData::Inline(b),
            // `uri = "inline"` is the wire marker for inline bodies.
            (Some(u), Some(b)) if u == "inline" => AttachmentData::Inline(b),
            (Some(_), Some(_)) => {
                return Err(XcpError::Attachment(format!(
                    "attachment {id:?} carries both uri and inline bytes"
                )))
            }
            (None, None) => {
                return Err(XcpError::Attachment(format!(
                    "attachment {id:?} carries neither uri nor inline bytes"
                )))
            }
        };
        Ok(Self {
            id,
            data,
            media_type: String::new(),
            codec: String::new(),
            shape: None,
            dtype: String::new(),
            size_bytes: 0,
        })
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.data {
            AttachmentData::Uri(u) => Some(u),
            AttachmentData::Inline(_) => None,
        }
    }

    pub fn inline_bytes(&self) -> Option<&Bytes> {
        match &self.data {
            AttachmentData::Inline(b) => Some(b),
            AttachmentData::Uri(_) => None,
        }
    }
}

/// Self-describing data envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Ether {
    /// Logical type identifier, e.g. `text` or `embedding`.
    pub kind: String,
    /// Additive integer version, at least 1.
    pub schema_version: u32,
    /// Kind-defined data.
    pub payload: BTreeMap<String, Value>,
    /// Free-form metadata; see [`meta_keys`] for reserved keys.
    pub metadata: BTreeMap<String, Value>,
    /// Unclassified data carried through verbatim.
    pub extra_fields: BTreeMap<String, Value>,
    /// Binary attachments.
    pub attachments: Vec<Attachment>,
}

impl Ether {
    /// New envelope with empty mappings.
    pub fn new(kind: impl Into<String>, schema_version: u32) -> Self {
        Self {
            kind: kind.into(),
            schema_version,
            payload: BTreeMap::new(),
            metadata: BTreeMap::new(),
            extra_fields: BTreeMap::new(),
            attachments: Vec::new(),
        }
    }

    /// Text envelope.
    pub fn text(text: impl Into<String>) -> Self {
        let mut e = Self::new("text", 1);
        e.payload.insert("text".into(), Value::Str(text.into()));
        e
    }

    /// Token-id envelope with an optional attention mask.
    pub fn tokens(token_ids: Vec<i64>, mask: Option<Vec<bool>>) -> Self {
        let mut e = Self::new("tokens", 1);
        e.payload.insert(
            "token_ids".into(),
            Value::List(token_ids.into_iter().map(Value::Int).collect()),
        );
        if let Some(mask) = mask {
            e.payload.insert(
                "mask".into(),
                Value::List(mask.into_iter().map(Value::Bool).collect()),
            );
        }
        e
    }

    /// Embedding envelope.
    pub fn embedding(values: Vec<f64>, dim: u32) -> Self {
        let mut e = Self::new("embedding", 1);
        e.payload.insert(
            "values".into(),
            Value::List(values.into_iter().map(Value::Float).collect()),
        );
        e.payload.insert("dim".into(), Value::from(dim));
        e
    }

    /// Image envelope with raw pixel data.
    pub fn image(height: u32, width: u32, channels: u32, data: Bytes) -> Self {
        let mut e = Self::new("image", 1);
        e.payload.insert("height".into(), Value::from(height));
        e.payload.insert("width".into(), Value::from(width));
        e.payload.insert("channels".into(), Value::from(channels));
        e.payload.insert("data".into(), Value::Bytes(data));
        e
    }

    /// Insert a payload entry, builder-style.
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Insert a metadata entry, builder-style.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Append an attachment, builder-style.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Structural validation: non-empty kind, version at least 1.
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(XcpError::EncodeFailed("ether kind is empty".into()));
        }
        if self.schema_version == 0 {
            return Err(XcpError::EncodeFailed(
                "ether schema_version must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
