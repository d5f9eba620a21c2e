//! Protocol constants: magic, version, flags, message types, codec IDs,
//! error codes, and default limits.

/// Frame preamble magic, written little-endian at offset 0.
pub const MAGIC: u32 = 0xA9A1_7A10;

/// Protocol major version (upper nibble of the version byte).
pub const MAJOR: u8 = 0x0;

/// Protocol minor version (lower nibble of the version byte).
pub const MINOR: u8 = 0x2;

/// Version byte on the wire: 4-bit major | 4-bit minor.
pub const VERSION_BYTE: u8 = (MAJOR << 4) | MINOR;

/// Frame flag constants.
pub mod flags {
    /// Payload is zstd-compressed.
    pub const COMP: u8 = 0x01;
    /// Payload is ChaCha20-Poly1305 sealed.
    pub const CRYPT: u8 = 0x02;
    /// More chunks with the same `msg_id` follow.
    pub const MORE: u8 = 0x04;
    /// PLEN field is 8 bytes instead of 4.
    pub const LARGE: u8 = 0x08;

    /// Reserved bits mask (bits 4-7).
    pub const RESERVED_MASK: u8 = 0xF0;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Message type identifiers.
///
/// `0x0000..=0x00FF` is the control range; `0x0100` and above is data.
pub mod msg_type {
    /// Capability advertisement (first frame from the initiator).
    pub const HELLO: u16 = 0x0000;
    /// Acknowledges a `msg_id`.
    pub const ACK: u16 = 0x0001;
    /// Negative acknowledgment with a numeric error code.
    pub const NACK: u16 = 0x0002;
    /// Keep-alive probe carrying a nonce.
    pub const PING: u16 = 0x0003;
    /// Keep-alive response echoing the nonce.
    pub const PONG: u16 = 0x0004;
    /// Ask the peer to supply missing fields.
    pub const CLARIFY_REQ: u16 = 0x0005;
    /// Answer to CLARIFY_REQ; `in_reply_to` set.
    pub const CLARIFY_RES: u16 = 0x0006;
    /// Capability response to HELLO.
    pub const CAPS: u16 = 0x0007;

    /// Ether payload.
    pub const DATA: u16 = 0x0100;

    /// Upper bound (inclusive) of the control range.
    pub const CONTROL_MAX: u16 = 0x00FF;

    /// Check whether a message type is in the control range.
    #[inline]
    pub fn is_control(t: u16) -> bool {
        t <= CONTROL_MAX
    }
}

/// Codec identifiers.
pub mod codec_id {
    /// Human-readable debug / small messages.
    pub const JSON: u16 = 0x0001;
    /// Raw little-endian float32 body with tensor header.
    pub const TENSOR_F32: u16 = 0x0002;
    /// Raw little-endian float16 body with tensor header.
    pub const TENSOR_F16: u16 = 0x0003;
    /// INT8 body with scale, tensor header.
    pub const TENSOR_QNT8: u16 = 0x0004;
    /// Compact binary struct encoding for control and small data.
    pub const BINARY_STRUCT: u16 = 0x0008;
    /// Varuint-delimited tensor segments.
    pub const MIXED_LATENT: u16 = 0x0010;
    /// Columnar batches; reserved, no built-in implementation.
    pub const ARROW_IPC: u16 = 0x0020;
    /// GPU tensor hand-off capsule.
    pub const DLPACK: u16 = 0x0021;
    /// Reserved for future use.
    pub const RESERVED: u16 = 0x00FF;
}

/// Numeric error codes carried in NACK bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Ok = 0x0000,
    SchemaUnknown = 0x0001,
    CodecUnsupported = 0x0002,
    MessageTooLarge = 0x0003,
    KindMismatch = 0x0004,
}

impl ErrorCode {
    /// Parse a wire value; unknown values map to `None`.
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0000 => Some(Self::Ok),
            0x0001 => Some(Self::SchemaUnknown),
            0x0002 => Some(Self::CodecUnsupported),
            0x0003 => Some(Self::MessageTooLarge),
            0x0004 => Some(Self::KindMismatch),
            _ => None,
        }
    }

    /// Wire value of this code.
    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Default maximum payload bytes for a single frame (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 1 << 20;

/// Conservative frame budget for WAN links (512 KiB).
pub const WAN_MAX_FRAME_BYTES: u32 = 512 << 10;

/// Generous frame budget for LAN links (4 MiB).
pub const LAN_MAX_FRAME_BYTES: u32 = 4 << 20;

/// Default upper bound on a reassembled message (256 MiB).
pub const DEFAULT_MAX_ASSEMBLED_BYTES: u64 = 256 << 20;

/// Default expiry for stalled reassemblies.
pub const DEFAULT_ASSEMBLY_TIMEOUT_MS: u64 = 30_000;

/// Default sliding-window size for duplicate suppression.
pub const DEFAULT_DUP_WINDOW_SIZE: usize = 4096;

/// Default cap on concurrent inbound reassemblies.
pub const DEFAULT_MAX_INFLIGHT_ASSEMBLIES: usize = 1024;

/// Default retry backoff base.
pub const DEFAULT_RETRY_BASE_MS: u64 = 50;

/// Default maximum automatic retries for a NACKed message.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Backoff exponent cap: jitter is `rand(0, base * 2^attempt)` with
/// `attempt` clamped here.
pub const RETRY_ATTEMPT_CAP: u32 = 6;

/// Default PING response deadline.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 1_000;

/// `msg_id` value reserved for "unset".
pub const MSG_ID_UNSET: u64 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_byte_packs_nibbles() {
        assert_eq!(VERSION_BYTE, 0x02);
        assert_eq!(VERSION_BYTE >> 4, MAJOR);
        assert_eq!(VERSION_BYTE & 0x0F, MINOR);
    }

    #[test]
    fn test_flags_are_distinct_bits() {
        let all = flags::COMP | flags::CRYPT | flags::MORE | flags::LARGE;
        assert_eq!(all, 0x0F);
        assert_eq!(all & flags::RESERVED_MASK, 0);
    }

    #[test]
    fn test_control_range() {
        assert!(msg_type::is_control(msg_type::HELLO));
        assert!(msg_type::is_control(msg_type::CAPS));
        assert!(msg_type::is_control(0x00FF));
        assert!(!msg_type::is_control(msg_type::DATA));
    }

    #[test]
    fn test_error_code_roundtrip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::SchemaUnknown,
            ErrorCode::CodecUnsupported,
            ErrorCode::MessageTooLarge,
            ErrorCode::KindMismatch,
        ] {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(0x9999), None);
    }
}
