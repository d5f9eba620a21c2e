//! Session configuration.

use std::time::Duration;

use crate::codec::{CodecPolicy, CodecRegistry};
use crate::constants::{
    DEFAULT_ASSEMBLY_TIMEOUT_MS, DEFAULT_DUP_WINDOW_SIZE, DEFAULT_MAX_ASSEMBLED_BYTES,
    DEFAULT_MAX_FRAME_BYTES, DEFAULT_MAX_INFLIGHT_ASSEMBLIES, DEFAULT_PING_TIMEOUT_MS,
    DEFAULT_RETRY_BASE_MS, DEFAULT_RETRY_MAX_ATTEMPTS,
};
use crate::control::CapabilityRecord;
use crate::schema::SchemaRange;
use crate::transform::TransformPipeline;

/// Tunables recognized by the session engine.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on a single frame's payload; advertised in HELLO and
    /// negotiated down to the pairwise minimum.
    pub max_frame_bytes: u32,
    /// Upper bound on a reassembled message.
    pub max_assembled_bytes: u64,
    /// Expiry for stalled reassemblies.
    pub assembly_timeout: Duration,
    /// Sliding-window size for duplicate suppression.
    pub dup_window_size: usize,
    /// Sender-side codec selection policy.
    pub codec_policy: CodecPolicy,
    /// Cap on concurrent inbound reassemblies.
    pub max_inflight_assemblies: usize,
    /// Retry backoff base.
    pub retry_base: Duration,
    /// Maximum automatic retries for NACKs carrying `retry_after_ms`.
    pub retry_max_attempts: u32,
    /// Enable the COMP flag and the zstd pipeline.
    pub compression: bool,
    /// Enable the CRYPT flag with this ChaCha20-Poly1305 static key.
    pub aead_static_key: Option<[u8; 32]>,
    /// PING response deadline.
    pub ping_timeout: Duration,
    /// Advertised codec ids; `None` advertises every registered codec.
    pub codecs: Option<Vec<u16>>,
    /// Schema ranges accepted inbound; empty accepts everything.
    pub accepted: Vec<SchemaRange>,
    /// Schema ranges this side may emit.
    pub emitted: Vec<SchemaRange>,
    /// Advertise shared-memory attachment support.
    pub shared_mem: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_assembled_bytes: DEFAULT_MAX_ASSEMBLED_BYTES,
            assembly_timeout: Duration::from_millis(DEFAULT_ASSEMBLY_TIMEOUT_MS),
            dup_window_size: DEFAULT_DUP_WINDOW_SIZE,
            codec_policy: CodecPolicy::default(),
            max_inflight_assemblies: DEFAULT_MAX_INFLIGHT_ASSEMBLIES,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            compression: false,
            aead_static_key: None,
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
            codecs: None,
            accepted: Vec::new(),
            emitted: Vec::new(),
            shared_mem: false,
        }
    }
}

impl SessionConfig {
    pub fn with_max_frame_bytes(mut self, max: u32) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn with_codec_policy(mut self, policy: CodecPolicy) -> Self {
        self.codec_policy = policy;
        self
    }

    pub fn with_codecs(mut self, codecs: Vec<u16>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    pub fn with_compression(mut self) -> Self {
        self.compression = true;
        self
    }

    pub fn with_aead_static_key(mut self, key: [u8; 32]) -> Self {
        self.aead_static_key = Some(key);
        self
    }

    /// The capability record this side advertises.
    pub fn capability_record(&self, registry: &CodecRegistry) -> CapabilityRecord {
        CapabilityRecord {
            codecs: self.codecs.clone().unwrap_or_else(|| registry.ids()),
            max_frame_bytes: self.max_frame_bytes,
            accepted: self.accepted.clone(),
            emitted: self.emitted.clone(),
            shared_mem: self.shared_mem,
        }
    }

    /// The transform pipeline this configuration implies.
    pub fn pipeline(&self) -> TransformPipeline {
        TransformPipeline::new(self.compression, self.aead_static_key)
    }
}
