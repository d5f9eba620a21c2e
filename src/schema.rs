//! Schema identity: composite `SchemaKey` and the hashes it is built from.
//!
//! A schema key identifies the semantic shape of a data frame. Equality
//! uses all five fields; compatibility uses `(ns_hash, kind_id, major)`
//! with `minor` compared by ordering.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 32-bit FNV-1a over a byte string.
pub const fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    let mut i = 0;
    while i < data.len() {
        hash ^= data[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += 1;
    }
    hash
}

/// Baseline Ether kind hashes.
pub const KIND_TEXT: u32 = fnv1a_32(b"text");
pub const KIND_TOKENS: u32 = fnv1a_32(b"tokens");
pub const KIND_EMBEDDING: u32 = fnv1a_32(b"embedding");
pub const KIND_IMAGE: u32 = fnv1a_32(b"image");

/// Default namespace for keys derived without an explicit namespace.
pub const DEFAULT_NAMESPACE: &str = "xcp";

/// Composite schema identity carried in data frame headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaKey {
    /// FNV-1a of the namespace string.
    pub ns_hash: u32,
    /// FNV-1a of the kind string.
    pub kind_id: u32,
    /// Major schema version; differing majors are incompatible.
    pub major: u16,
    /// Minor schema version; additive.
    pub minor: u16,
    /// First 128 bits of SHA-256 over the canonical schema JSON.
    pub hash128: [u8; 16],
}

impl SchemaKey {
    /// Encoded length of a schema key inside a binary frame header.
    pub const WIRE_LEN: usize = 28;

    /// The all-zero key used by control frames.
    pub const ZERO: SchemaKey = SchemaKey {
        ns_hash: 0,
        kind_id: 0,
        major: 0,
        minor: 0,
        hash128: [0u8; 16],
    };

    /// Derive a key from namespace, kind, and version.
    ///
    /// The 128-bit hash is taken over a canonical JSON rendering of the
    /// identifying fields, so two peers deriving a key from the same
    /// inputs agree bit-for-bit.
    pub fn derive(namespace: &str, kind: &str, major: u16, minor: u16) -> Self {
        let canonical = format!(
            "{{\"kind\":{},\"major\":{},\"minor\":{},\"ns\":{}}}",
            serde_json::Value::from(kind),
            major,
            minor,
            serde_json::Value::from(namespace),
        );
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hash128 = [0u8; 16];
        hash128.copy_from_slice(&digest[..16]);
        Self {
            ns_hash: fnv1a_32(namespace.as_bytes()),
            kind_id: fnv1a_32(kind.as_bytes()),
            major,
            minor,
            hash128,
        }
    }

    /// Derive a key in the default namespace.
    pub fn for_kind(kind: &str, major: u16, minor: u16) -> Self {
        Self::derive(DEFAULT_NAMESPACE, kind, major, minor)
    }

    /// True for the control-frame zero key.
    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Compatibility: same namespace, kind, and major version.
    ///
    /// Minors are additive; `other` is compatible when its minor is at
    /// least `self.minor`.
    pub fn is_compatible_with(&self, other: &SchemaKey) -> bool {
        self.ns_hash == other.ns_hash
            && self.kind_id == other.kind_id
            && self.major == other.major
            && other.minor >= self.minor
    }

    /// Serialize to the binary header layout (little-endian).
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ns_hash.to_le_bytes());
        buf.extend_from_slice(&self.kind_id.to_le_bytes());
        buf.extend_from_slice(&self.major.to_le_bytes());
        buf.extend_from_slice(&self.minor.to_le_bytes());
        buf.extend_from_slice(&self.hash128);
    }

    /// Parse from the binary header layout.
    ///
    /// Returns `None` if the slice is shorter than [`Self::WIRE_LEN`].
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_LEN {
            return None;
        }
        let mut hash128 = [0u8; 16];
        hash128.copy_from_slice(&buf[12..28]);
        Some(Self {
            ns_hash: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            kind_id: u32::from_le_bytes(buf[4..8].try_into().ok()?),
            major: u16::from_le_bytes(buf[8..10].try_into().ok()?),
            minor: u16::from_le_bytes(buf[10..12].try_into().ok()?),
            hash128,
        })
    }
}

impl Default for SchemaKey {
    fn default() -> Self {
        Self::ZERO
    }
}

/// An accepted or emitted schema range in a capability record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRange {
    pub ns_hash: u32,
    pub kind_id: u32,
    pub major: u16,
    pub min_minor: u16,
    pub max_minor: u16,
}

impl SchemaRange {
    /// Encoded length in a binary capability record.
    pub const WIRE_LEN: usize = 14;

    /// Check whether a key falls inside this range.
    pub fn contains(&self, key: &SchemaKey) -> bool {
        self.ns_hash == key.ns_hash
            && self.kind_id == key.kind_id
            && self.major == key.major
            && (self.min_minor..=self.max_minor).contains(&key.minor)
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ns_hash.to_le_bytes());
        buf.extend_from_slice(&self.kind_id.to_le_bytes());
        buf.extend_from_slice(&self.major.to_le_bytes());
        buf.extend_from_slice(&self.min_minor.to_le_bytes());
        buf.extend_from_slice(&self.max_minor.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            ns_hash: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            kind_id: u32::from_le_bytes(buf[4..8].try_into().ok()?),
            major: u16::from_le_bytes(buf[8..10].try_into().ok()?),
            min_minor: u16::from_le_bytes(buf[10..12].try_into().ok()?),
            max_minor: u16::from_le_bytes(buf[12..14].try_into().ok()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vectors() {
        // Published FNV-1a 32-bit test vectors.
        assert_eq!(fnv1a_32(b""), 0x811C_9DC5);
        assert_eq!(fnv1a_32(b"a"), 0xE40C_292C);
        assert_eq!(fnv1a_32(b"foobar"), 0xBF9C_F968);
    }

    #[test]
    fn test_kind_constants_match_runtime_hash() {
        assert_eq!(KIND_TEXT, fnv1a_32("text".as_bytes()));
        assert_eq!(KIND_EMBEDDING, fnv1a_32("embedding".as_bytes()));
        assert_ne!(KIND_TEXT, KIND_TOKENS);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let a = SchemaKey::derive("agents", "text", 1, 0);
        let b = SchemaKey::derive("agents", "text", 1, 0);
        assert_eq!(a, b);
        assert_eq!(a.kind_id, KIND_TEXT);

        let c = SchemaKey::derive("agents", "text", 1, 1);
        assert_ne!(a, c);
        assert_ne!(a.hash128, c.hash128);
    }

    #[test]
    fn test_equality_uses_all_fields() {
        let a = SchemaKey::derive("agents", "text", 1, 0);
        let mut b = a;
        b.hash128[0] ^= 1;
        assert_ne!(a, b);
        // But compatibility ignores the content hash.
        assert!(a.is_compatible_with(&b));
    }

    #[test]
    fn test_compatibility_minor_ordering() {
        let v1_0 = SchemaKey::derive("agents", "text", 1, 0);
        let v1_2 = SchemaKey::derive("agents", "text", 1, 2);
        let v2_0 = SchemaKey::derive("agents", "text", 2, 0);

        assert!(v1_0.is_compatible_with(&v1_2));
        assert!(!v1_2.is_compatible_with(&v1_0));
        assert!(!v1_0.is_compatible_with(&v2_0));
    }

    #[test]
    fn test_wire_roundtrip() {
        let key = SchemaKey::derive("agents", "embedding", 3, 7);
        let mut buf = Vec::new();
        key.write_to(&mut buf);
        assert_eq!(buf.len(), SchemaKey::WIRE_LEN);
        assert_eq!(SchemaKey::read_from(&buf), Some(key));
        assert_eq!(SchemaKey::read_from(&buf[..10]), None);
    }

    #[test]
    fn test_zero_key() {
        let mut buf = Vec::new();
        SchemaKey::ZERO.write_to(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
        assert!(SchemaKey::ZERO.is_zero());
        assert!(!SchemaKey::for_kind("text", 1, 0).is_zero());
    }

    #[test]
    fn test_schema_range_contains() {
        let key = SchemaKey::derive("agents", "text", 1, 3);
        let range = SchemaRange {
            ns_hash: key.ns_hash,
            kind_id: key.kind_id,
            major: 1,
            min_minor: 0,
            max_minor: 5,
        };
        assert!(range.contains(&key));

        let outside = SchemaKey::derive("agents", "text", 1, 6);
        assert!(!range.contains(&outside));
        let other_major = SchemaKey::derive("agents", "text", 2, 3);
        assert!(!range.contains(&other_major));
    }

    #[test]
    fn test_schema_range_roundtrip() {
        let range = SchemaRange {
            ns_hash: 0xDEAD_BEEF,
            kind_id: KIND_IMAGE,
            major: 2,
            min_minor: 1,
            max_minor: 9,
        };
        let mut buf = Vec::new();
        range.write_to(&mut buf);
        assert_eq!(buf.len(), SchemaRange::WIRE_LEN);
        assert_eq!(SchemaRange::read_from(&buf), Some(range));
    }
}
