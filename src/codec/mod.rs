//! Codec module: Ether serialization and the process-wide registry.
//!
//! Codecs register under a numeric id. The registry starts with the
//! built-ins, may be extended before any session is opened, and freezes
//! on first session open. Senders pick a codec from the negotiated set
//! according to the configured [`CodecPolicy`].

mod binary;
mod json;
mod tensor;

pub use binary::BinaryStructCodec;
pub(crate) use binary::{get_varuint, put_varuint};
pub use json::JsonCodec;
pub use tensor::{
    f16_bits_to_f32, f32_to_f16_bits, tensor_ether, tensor_from_f32, tensor_from_f32_as_f16,
    DlpackCodec, MixedLatentCodec, TensorCodec, TensorDtype, TensorHeader, TENSOR_HEADER_LEN,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::constants::codec_id;
use crate::error::{Result, XcpError};
use crate::ether::{Ether, Value};

/// A payload codec: encodes an Ether to bytes and back.
pub trait EtherCodec: Send + Sync {
    /// Numeric wire id.
    fn id(&self) -> u16;
    /// Registry name, e.g. `tensor_f32`.
    fn name(&self) -> &'static str;
    /// Whether the encoding is binary (vs. human-readable).
    fn is_binary(&self) -> bool;
    /// Whether this codec can represent the given envelope.
    fn can_encode(&self, _ether: &Ether) -> bool {
        true
    }
    /// Whether decoded envelopes carry their own `kind`. Raw-body codecs
    /// (tensors, capsules) reconstruct a generic kind instead, so the
    /// frame's schema key is the only kind authority for them.
    fn carries_kind(&self) -> bool {
        true
    }
    fn encode(&self, ether: &Ether) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Ether>;
}

/// Sender-side codec selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecPolicy {
    /// Smallest-overhead representable codec from the negotiated set.
    #[default]
    Auto,
    /// Always JSON.
    JsonOnly,
    /// Never JSON for data frames.
    BinaryRequired,
}

/// Process-wide codec table, frozen after the first session opens.
pub struct CodecRegistry {
    by_id: RwLock<HashMap<u16, Arc<dyn EtherCodec>>>,
    frozen: AtomicBool,
}

impl CodecRegistry {
    /// Registry pre-populated with the built-in codecs.
    fn with_builtins() -> Self {
        let registry = Self {
            by_id: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        };
        for codec in [
            Arc::new(JsonCodec) as Arc<dyn EtherCodec>,
            Arc::new(BinaryStructCodec),
            Arc::new(TensorCodec::f32()),
            Arc::new(TensorCodec::f16()),
            Arc::new(TensorCodec::qnt8()),
            Arc::new(MixedLatentCodec),
            Arc::new(DlpackCodec),
        ] {
            registry
                .register(codec)
                .expect("built-in codec ids are unique");
        }
        registry
    }

    /// The process-global registry.
    pub fn global() -> &'static CodecRegistry {
        static GLOBAL: OnceLock<CodecRegistry> = OnceLock::new();
        GLOBAL.get_or_init(CodecRegistry::with_builtins)
    }

    /// Register a codec. Idempotent for the same implementation;
    /// re-registering an id under a different name is an error, as is any
    /// registration after the registry froze.
    pub fn register(&self, codec: Arc<dyn EtherCodec>) -> Result<()> {
        let mut by_id = self.by_id.write().expect("registry lock poisoned");
        if let Some(existing) = by_id.get(&codec.id()) {
            if existing.name() == codec.name() {
                return Ok(());
            }
            return Err(XcpError::Registry(format!(
                "id {:#06X} already registered as {:?}",
                codec.id(),
                existing.name()
            )));
        }
        if self.frozen.load(Ordering::Acquire) {
            return Err(XcpError::Registry(
                "registry is frozen; register codecs before opening a session".into(),
            ));
        }
        by_id.insert(codec.id(), codec);
        Ok(())
    }

    /// Freeze the registry. Called on first session open; idempotent.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Look up a codec by wire id.
    pub fn get(&self, id: u16) -> Option<Arc<dyn EtherCodec>> {
        self.by_id
            .read()
            .expect("registry lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Look up a codec by registry name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn EtherCodec>> {
        self.by_id
            .read()
            .expect("registry lock poisoned")
            .values()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// All registered codec ids.
    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .by_id
            .read()
            .expect("registry lock poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Payload-size threshold below which Auto prefers JSON.
const JSON_SIZE_CEILING: usize = 2 * 1024;

/// Rough size of an envelope, for policy tie-breaking only.
fn estimate_size(ether: &Ether) -> usize {
    fn value_size(value: &Value) -> usize {
        match value {
            Value::Null | Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::Str(s) => s.len(),
            Value::Bytes(b) => b.len(),
            Value::List(items) => items.iter().map(value_size).sum(),
            Value::Map(map) => map.iter().map(|(k, v)| k.len() + value_size(v)).sum(),
        }
    }
    let maps = ether
        .payload
        .iter()
        .chain(&ether.metadata)
        .chain(&ether.extra_fields)
        .map(|(k, v)| k.len() + value_size(v))
        .sum::<usize>();
    let attachments = ether
        .attachments
        .iter()
        .map(|a| a.inline_bytes().map_or(64, |b| b.len()))
        .sum::<usize>();
    maps + attachments + ether.kind.len()
}

/// Pick the codec for an outbound data frame.
///
/// `negotiated` is the id intersection agreed at handshake; the result is
/// always a member of it.
pub fn select_codec(
    registry: &CodecRegistry,
    policy: CodecPolicy,
    negotiated: &[u16],
    ether: &Ether,
) -> Result<Arc<dyn EtherCodec>> {
    let available = |id: u16| -> Option<Arc<dyn EtherCodec>> {
        negotiated.contains(&id).then(|| registry.get(id)).flatten()
    };

    match policy {
        CodecPolicy::JsonOnly => {
            return available(codec_id::JSON).ok_or(XcpError::CodecUnsupported)
        }
        CodecPolicy::Auto | CodecPolicy::BinaryRequired => {}
    }

    // Tensor-shaped envelopes go out under the matching tensor codec.
    let tensor_id = ether
        .payload
        .get("dtype")
        .and_then(Value::as_str)
        .and_then(TensorDtype::from_name)
        .map(|dtype| match dtype {
            TensorDtype::F32 => codec_id::TENSOR_F32,
            TensorDtype::F16 => codec_id::TENSOR_F16,
            TensorDtype::Int8 => codec_id::TENSOR_QNT8,
        })
        .unwrap_or(codec_id::TENSOR_F32);
    if let Some(codec) = available(tensor_id) {
        if codec.can_encode(ether) {
            return Ok(codec);
        }
    }
    if let Some(codec) = available(codec_id::MIXED_LATENT) {
        if codec.can_encode(ether) {
            return Ok(codec);
        }
    }
    if let Some(codec) = available(codec_id::DLPACK) {
        if codec.can_encode(ether) {
            return Ok(codec);
        }
    }

    // Small generic envelopes: JSON; everything else: binary struct.
    if policy == CodecPolicy::Auto && estimate_size(ether) <= JSON_SIZE_CEILING {
        if let Some(codec) = available(codec_id::JSON) {
            return Ok(codec);
        }
    }
    if let Some(codec) = available(codec_id::BINARY_STRUCT) {
        return Ok(codec);
    }
    if policy == CodecPolicy::Auto {
        if let Some(codec) = available(codec_id::JSON) {
            return Ok(codec);
        }
    }

    // Last resort: anything negotiated that can represent the envelope.
    for &id in negotiated {
        if let Some(codec) = registry.get(id) {
            let json_fallback = policy == CodecPolicy::BinaryRequired && !codec.is_binary();
            if !json_fallback && codec.can_encode(ether) {
                return Ok(codec);
            }
        }
    }
    Err(XcpError::CodecUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_global_registry_has_builtins() {
        let registry = CodecRegistry::global();
        for id in [
            codec_id::JSON,
            codec_id::BINARY_STRUCT,
            codec_id::TENSOR_F32,
            codec_id::TENSOR_F16,
            codec_id::TENSOR_QNT8,
            codec_id::MIXED_LATENT,
            codec_id::DLPACK,
        ] {
            assert!(registry.get(id).is_some(), "missing codec {id:#06X}");
        }
        assert!(registry.get(codec_id::ARROW_IPC).is_none());
    }

    #[test]
    fn test_lookup_by_name() {
        let registry = CodecRegistry::with_builtins();
        assert_eq!(
            registry.get_by_name("json").unwrap().id(),
            codec_id::JSON
        );
        assert!(registry.get_by_name("nope").is_none());
    }

    #[test]
    fn test_register_idempotent_and_conflicting() {
        let registry = CodecRegistry::with_builtins();
        // Same implementation again: fine.
        assert!(registry.register(Arc::new(JsonCodec)).is_ok());

        // Different implementation under a taken id: error.
        struct Impostor;
        impl EtherCodec for Impostor {
            fn id(&self) -> u16 {
                codec_id::JSON
            }
            fn name(&self) -> &'static str {
                "impostor"
            }
            fn is_binary(&self) -> bool {
                true
            }
            fn encode(&self, _: &Ether) -> Result<Vec<u8>> {
                Ok(vec![])
            }
            fn decode(&self, _: &[u8]) -> Result<Ether> {
                Ok(Ether::text(""))
            }
        }
        assert!(matches!(
            registry.register(Arc::new(Impostor)),
            Err(XcpError::Registry(_))
        ));
    }

    #[test]
    fn test_register_after_freeze_fails() {
        let registry = CodecRegistry::with_builtins();
        registry.freeze();
        assert!(registry.is_frozen());

        struct Late;
        impl EtherCodec for Late {
            fn id(&self) -> u16 {
                0x7000
            }
            fn name(&self) -> &'static str {
                "late"
            }
            fn is_binary(&self) -> bool {
                true
            }
            fn encode(&self, _: &Ether) -> Result<Vec<u8>> {
                Ok(vec![])
            }
            fn decode(&self, _: &[u8]) -> Result<Ether> {
                Ok(Ether::text(""))
            }
        }
        assert!(matches!(
            registry.register(Arc::new(Late)),
            Err(XcpError::Registry(_))
        ));
        // Re-registering an existing implementation is still a no-op.
        assert!(registry.register(Arc::new(JsonCodec)).is_ok());
    }

    #[test]
    fn test_every_builtin_roundtrips_text() {
        // Property: decode(encode(e)) == e for every codec and every
        // envelope it can represent.
        let registry = CodecRegistry::with_builtins();
        let generic = Ether::text("round trip me");
        for id in registry.ids() {
            let codec = registry.get(id).unwrap();
            if codec.can_encode(&generic) && !matches!(id, 0x0002..=0x0004 | 0x0010 | 0x0021) {
                let encoded = codec.encode(&generic).unwrap();
                assert_eq!(codec.decode(&encoded).unwrap(), generic, "codec {id:#06X}");
            }
        }
    }

    #[test]
    fn test_select_json_for_small_payloads() {
        let registry = CodecRegistry::with_builtins();
        let negotiated = vec![codec_id::JSON, codec_id::BINARY_STRUCT];
        let codec = select_codec(
            &registry,
            CodecPolicy::Auto,
            &negotiated,
            &Ether::text("small"),
        )
        .unwrap();
        assert_eq!(codec.id(), codec_id::JSON);
    }

    #[test]
    fn test_select_binary_for_large_payloads() {
        let registry = CodecRegistry::with_builtins();
        let negotiated = vec![codec_id::JSON, codec_id::BINARY_STRUCT];
        let big = Ether::new("bulk", 1).with_payload(
            "blob",
            Value::Bytes(Bytes::from(vec![0u8; 64 * 1024])),
        );
        let codec = select_codec(&registry, CodecPolicy::Auto, &negotiated, &big).unwrap();
        assert_eq!(codec.id(), codec_id::BINARY_STRUCT);
    }

    #[test]
    fn test_select_tensor_codec_for_tensor_kind() {
        let registry = CodecRegistry::with_builtins();
        let negotiated = vec![codec_id::JSON, codec_id::TENSOR_F32];
        let tensor = tensor_from_f32(&[2], &[1.0, 2.0]);
        let codec = select_codec(&registry, CodecPolicy::Auto, &negotiated, &tensor).unwrap();
        assert_eq!(codec.id(), codec_id::TENSOR_F32);
    }

    #[test]
    fn test_binary_required_never_picks_json() {
        let registry = CodecRegistry::with_builtins();
        let small = Ether::text("small");

        let negotiated = vec![codec_id::JSON, codec_id::BINARY_STRUCT];
        let codec =
            select_codec(&registry, CodecPolicy::BinaryRequired, &negotiated, &small).unwrap();
        assert_eq!(codec.id(), codec_id::BINARY_STRUCT);

        // JSON-only peer under BinaryRequired: no usable codec.
        let json_only = vec![codec_id::JSON];
        assert!(matches!(
            select_codec(&registry, CodecPolicy::BinaryRequired, &json_only, &small),
            Err(XcpError::CodecUnsupported)
        ));
    }

    #[test]
    fn test_json_only_policy() {
        let registry = CodecRegistry::with_builtins();
        let negotiated = vec![codec_id::JSON, codec_id::BINARY_STRUCT];
        let codec = select_codec(
            &registry,
            CodecPolicy::JsonOnly,
            &negotiated,
            &Ether::new("bulk", 1)
                .with_payload("blob", Value::Bytes(Bytes::from(vec![0u8; 64 * 1024]))),
        )
        .unwrap();
        assert_eq!(codec.id(), codec_id::JSON);

        assert!(select_codec(
            &registry,
            CodecPolicy::JsonOnly,
            &[codec_id::BINARY_STRUCT],
            &Ether::text("x")
        )
        .is_err());
    }

    #[test]
    fn test_selection_respects_negotiated_set() {
        let registry = CodecRegistry::with_builtins();
        // Tensor envelope, but no tensor codec negotiated: falls back.
        let tensor = tensor_from_f32(&[2], &[1.0, 2.0]);
        let codec = select_codec(
            &registry,
            CodecPolicy::Auto,
            &[codec_id::BINARY_STRUCT],
            &tensor,
        )
        .unwrap();
        assert_eq!(codec.id(), codec_id::BINARY_STRUCT);

        // Empty set: nothing to pick.
        assert!(matches!(
            select_codec(&registry, CodecPolicy::Auto, &[], &tensor),
            Err(XcpError::CodecUnsupported)
        ));
    }
}
