//! Error types for the XCP engine.
//!
//! Errors split into three scopes: connection-fatal (the session closes),
//! per-message (the session NACKs and keeps going), and per-call (surfaced
//! only to the caller).

use thiserror::Error;

use crate::constants::ErrorCode;

/// Main error type for all XCP operations.
#[derive(Debug, Error)]
pub enum XcpError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// First 4 bytes of a frame were not the protocol magic.
    #[error("bad magic: expected 0xA9A17A10, found {found:#010X}")]
    BadMagic { found: u32 },

    /// Peer speaks a different protocol major version.
    #[error("unsupported version byte {found:#04X} (local major {local_major})")]
    UnsupportedVersion { found: u8, local_major: u8 },

    /// Stream ended inside the header.
    #[error("frame header truncated")]
    HeaderTruncated,

    /// Header bytes did not decode to a well-formed frame header.
    #[error("malformed frame header: {0}")]
    HeaderMalformed(String),

    /// Stream ended inside the payload.
    #[error("frame payload truncated")]
    PayloadTruncated,

    /// CRC32C trailer did not match the payload bytes as read.
    #[error("CRC mismatch: computed {computed:#010X}, frame carried {stored:#010X}")]
    CrcMismatch { computed: u32, stored: u32 },

    /// Declared payload length exceeds the negotiated frame budget.
    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u64, max: u64 },

    /// `body_codec` names a codec absent from the registry or the
    /// negotiated set.
    #[error("unknown codec id {0:#06X}")]
    UnknownCodec(u16),

    /// Inbound schema key falls outside the locally accepted ranges.
    #[error("unknown schema key (ns {ns_hash:#010X}, kind {kind_id:#010X}, v{major}.{minor})")]
    UnknownSchema {
        ns_hash: u32,
        kind_id: u32,
        major: u16,
        minor: u16,
    },

    /// Payload passed CRC but the named codec could not decode it.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// Decoded envelope kind contradicts the frame's schema key.
    #[error("kind {kind:?} contradicts the schema key kind hash")]
    KindMismatch { kind: String },

    /// Value cannot be represented under the chosen codec.
    #[error("encode failed: {0}")]
    EncodeFailed(String),

    /// Reassembled message exceeded `max_assembled_bytes`, or the inbound
    /// assembly table is full.
    #[error("message too large: {0}")]
    MessageTooLarge(String),

    /// A reassembly saw no new chunk within `assembly_timeout`.
    #[error("assembly for msg_id {0} timed out")]
    AssemblyTimeout(u64),

    /// Protocol violation that is fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer NACKed the message with the given code.
    #[error("peer rejected msg_id {msg_id}: {code:?}")]
    Nacked { msg_id: u64, code: ErrorCode },

    /// Automatic retries exhausted without an ACK or response.
    #[error("delivery failed for msg_id {0} after retries")]
    DeliveryFailed(u64),

    /// Capability intersection with the peer was empty.
    #[error("no common codec with peer")]
    CodecUnsupported,

    /// The session closed while the operation was outstanding.
    #[error("session closed")]
    SessionClosed,

    /// A per-call deadline elapsed. Emits no NACK.
    #[error("operation timed out")]
    Timeout,

    /// Codec registry misuse (duplicate id, registration after freeze).
    #[error("codec registry: {0}")]
    Registry(String),

    /// Malformed `shm://` URI or attachment contract violation.
    #[error("attachment error: {0}")]
    Attachment(String),

    /// Compression pipeline failure.
    #[error("compression error: {0}")]
    Compression(String),

    /// AEAD seal/open failure.
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl XcpError {
    /// Errors that terminate the connection rather than a single message.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::BadMagic { .. }
                | Self::UnsupportedVersion { .. }
                | Self::HeaderTruncated
                | Self::HeaderMalformed(_)
                | Self::PayloadTruncated
                | Self::CrcMismatch { .. }
                | Self::FrameTooLarge { .. }
                | Self::Protocol(_)
        )
    }

    /// The NACK code to emit for a per-message error, if any.
    pub fn nack_code(&self) -> Option<ErrorCode> {
        match self {
            Self::UnknownCodec(_) => Some(ErrorCode::CodecUnsupported),
            Self::UnknownSchema { .. } | Self::DecodeFailed(_) => Some(ErrorCode::SchemaUnknown),
            Self::KindMismatch { .. } => Some(ErrorCode::KindMismatch),
            Self::MessageTooLarge(_) | Self::AssemblyTimeout(_) => Some(ErrorCode::MessageTooLarge),
            _ => None,
        }
    }
}

/// Result type alias using XcpError.
pub type Result<T> = std::result::Result<T, XcpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(XcpError::CrcMismatch {
            computed: 1,
            stored: 2
        }
        .is_connection_fatal());
        assert!(XcpError::HeaderMalformed("x".into()).is_connection_fatal());
        assert!(!XcpError::UnknownCodec(0x9999).is_connection_fatal());
        assert!(!XcpError::Timeout.is_connection_fatal());
    }

    #[test]
    fn test_nack_codes() {
        assert_eq!(
            XcpError::UnknownCodec(0x9999).nack_code(),
            Some(ErrorCode::CodecUnsupported)
        );
        assert_eq!(
            XcpError::AssemblyTimeout(7).nack_code(),
            Some(ErrorCode::MessageTooLarge)
        );
        assert_eq!(
            XcpError::KindMismatch { kind: "text".into() }.nack_code(),
            Some(ErrorCode::KindMismatch)
        );
        assert_eq!(XcpError::Timeout.nack_code(), None);
    }
}
