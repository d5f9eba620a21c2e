//! Frame struct with typed accessors, and frame packing.
//!
//! A [`Frame`] is the immutable unit on the wire: preamble, header,
//! length-prefixed payload, CRC32C trailer. Payload bytes are shared
//! zero-copy via `bytes::Bytes`.
//!
//! Packing emits the payload exactly as given; COMP/CRYPT transforms are
//! the session engine's responsibility and must already be applied when
//! the corresponding flags are set.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{flags, msg_type};
use crate::error::Result;

use super::wire_format::{FrameHeader, Preamble, CRC_LEN};

/// Payload sizes above this force the LARGE flag and an 8-byte PLEN.
const LARGE_THRESHOLD: u64 = u32::MAX as u64;

/// Which wire form the header is serialized in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderForm {
    /// Compact binary struct (normative).
    #[default]
    Binary,
    /// JSON object (interop fallback).
    Json,
}

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// Flags byte from the preamble.
    pub flags: u8,
    /// Payload bytes exactly as carried on the wire (post-transform).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header, flags, and payload.
    pub fn new(header: FrameHeader, frame_flags: u8, payload: Bytes) -> Self {
        Self {
            header,
            flags: frame_flags,
            payload,
        }
    }

    #[inline]
    pub fn msg_id(&self) -> u64 {
        self.header.msg_id
    }

    #[inline]
    pub fn msg_type(&self) -> u16 {
        self.header.msg_type
    }

    #[inline]
    pub fn channel_id(&self) -> u32 {
        self.header.channel_id
    }

    /// Check if this frame is in the control range.
    #[inline]
    pub fn is_control(&self) -> bool {
        msg_type::is_control(self.header.msg_type)
    }

    /// Check if this is a data frame.
    #[inline]
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }

    /// More chunks with the same `msg_id` follow.
    #[inline]
    pub fn has_more(&self) -> bool {
        flags::has_flag(self.flags, flags::MORE)
    }

    /// Payload is compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        flags::has_flag(self.flags, flags::COMP)
    }

    /// Payload is AEAD-sealed.
    #[inline]
    pub fn is_encrypted(&self) -> bool {
        flags::has_flag(self.flags, flags::CRYPT)
    }
}

/// Pack a frame into its wire bytes with a binary header.
pub fn pack_frame(header: &FrameHeader, payload: &[u8], frame_flags: u8) -> Result<Bytes> {
    let header_bytes = header.encode_binary();
    Ok(pack_with_header_bytes(&header_bytes, payload, frame_flags))
}

/// Pack a frame with the chosen header form.
pub fn pack_frame_as(
    header: &FrameHeader,
    payload: &[u8],
    frame_flags: u8,
    form: HeaderForm,
) -> Result<Bytes> {
    let header_bytes = match form {
        HeaderForm::Binary => header.encode_binary(),
        HeaderForm::Json => header.encode_json()?,
    };
    Ok(pack_with_header_bytes(&header_bytes, payload, frame_flags))
}

fn pack_with_header_bytes(header_bytes: &[u8], payload: &[u8], mut frame_flags: u8) -> Bytes {
    let large = payload.len() as u64 > LARGE_THRESHOLD || flags::has_flag(frame_flags, flags::LARGE);
    if large {
        frame_flags |= flags::LARGE;
    }
    let plen_width = if large { 8 } else { 4 };

    let mut buf = BytesMut::with_capacity(
        super::wire_format::PREAMBLE_LEN + header_bytes.len() + plen_width + payload.len() + CRC_LEN,
    );
    buf.put_slice(&Preamble::encode(frame_flags, header_bytes.len() as u16));
    buf.put_slice(header_bytes);
    if large {
        buf.put_u64_le(payload.len() as u64);
    } else {
        buf.put_u32_le(payload.len() as u32);
    }
    buf.put_slice(payload);
    buf.put_u32_le(crc32c::crc32c(payload));
    buf.freeze()
}
