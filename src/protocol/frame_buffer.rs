//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a state
//! machine for fragmented frames:
//! - `Preamble`: need the 8 fixed bytes (magic checked as soon as 4 are in)
//! - `Header`: preamble parsed, need `HLEN` header bytes
//! - `PayloadLen`: header parsed, need the 4- or 8-byte PLEN field
//! - `Payload`: need `PLEN` payload bytes plus the CRC32C trailer
//!
//! Any error out of [`FrameBuffer::push`] is connection-fatal; the caller
//! is expected to stop feeding the buffer and close the stream.

use bytes::{Buf, Bytes, BytesMut};

use crate::constants::flags;
use crate::error::{Result, XcpError};

use super::frame::Frame;
use super::wire_format::{FrameHeader, Preamble, CRC_LEN, PREAMBLE_LEN};

/// State machine for frame parsing.
#[derive(Debug)]
enum State {
    /// Waiting for the fixed preamble.
    Preamble,
    /// Preamble parsed, waiting for header bytes.
    Header { preamble: Preamble },
    /// Header parsed, waiting for the payload length field.
    PayloadLen { frame_flags: u8, header: FrameHeader },
    /// Waiting for payload bytes and the CRC trailer.
    Payload {
        frame_flags: u8,
        header: FrameHeader,
        payload_len: u64,
    },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from stream reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size (negotiated `max_frame_bytes`).
    max_payload: u64,
}

impl FrameBuffer {
    /// New frame buffer bounded by the given payload limit.
    pub fn new(max_payload: u64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::Preamble,
            max_payload,
        }
    }

    /// Tighten or relax the payload limit (after negotiation).
    pub fn set_max_payload(&mut self, max_payload: u64) {
        self.max_payload = max_payload;
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered for the next push. Errors indicate a
    /// protocol violation and poison the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Number of buffered bytes not yet consumed.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::Preamble => {
                    // Reject a bad magic as soon as the first 4 bytes are
                    // in, without waiting for the rest of the preamble.
                    if self.buffer.len() >= 4 {
                        let magic =
                            u32::from_le_bytes(self.buffer[0..4].try_into().expect("len checked"));
                        if magic != crate::constants::MAGIC {
                            return Err(XcpError::BadMagic { found: magic });
                        }
                    }
                    if self.buffer.len() < PREAMBLE_LEN {
                        return Ok(None);
                    }
                    let raw: [u8; PREAMBLE_LEN] =
                        self.buffer[..PREAMBLE_LEN].try_into().expect("len checked");
                    let preamble = Preamble::decode(&raw)?;
                    self.buffer.advance(PREAMBLE_LEN);
                    self.state = State::Header { preamble };
                }

                State::Header { preamble } => {
                    let hlen = preamble.hlen as usize;
                    if self.buffer.len() < hlen {
                        return Ok(None);
                    }
                    let header = FrameHeader::decode(&self.buffer[..hlen])?;
                    let frame_flags = preamble.flags;
                    self.buffer.advance(hlen);
                    self.state = State::PayloadLen { frame_flags, header };
                }

                State::PayloadLen { frame_flags, header } => {
                    let wide = flags::has_flag(*frame_flags, flags::LARGE);
                    let width = if wide { 8 } else { 4 };
                    if self.buffer.len() < width {
                        return Ok(None);
                    }
                    let payload_len = if wide {
                        u64::from_le_bytes(self.buffer[..8].try_into().expect("len checked"))
                    } else {
                        u64::from(u32::from_le_bytes(
                            self.buffer[..4].try_into().expect("len checked"),
                        ))
                    };
                    if payload_len > self.max_payload {
                        return Err(XcpError::FrameTooLarge {
                            len: payload_len,
                            max: self.max_payload,
                        });
                    }
                    let frame_flags = *frame_flags;
                    let header = header.clone();
                    self.buffer.advance(width);
                    self.state = State::Payload {
                        frame_flags,
                        header,
                        payload_len,
                    };
                }

                State::Payload {
                    frame_flags,
                    header,
                    payload_len,
                } => {
                    let need = *payload_len as usize + CRC_LEN;
                    if self.buffer.len() < need {
                        return Ok(None);
                    }
                    let payload: Bytes = self.buffer.split_to(*payload_len as usize).freeze();
                    let stored =
                        u32::from_le_bytes(self.buffer[..CRC_LEN].try_into().expect("len checked"));
                    self.buffer.advance(CRC_LEN);

                    let computed = crc32c::crc32c(&payload);
                    if computed != stored {
                        return Err(XcpError::CrcMismatch { computed, stored });
                    }

                    let frame = Frame::new(header.clone(), *frame_flags, payload);
                    self.state = State::Preamble;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_MAX_FRAME_BYTES;
    use crate::protocol::frame::{pack_frame, pack_frame_as, HeaderForm};
    use crate::schema::SchemaKey;

    fn buffer() -> FrameBuffer {
        FrameBuffer::new(u64::from(DEFAULT_MAX_FRAME_BYTES))
    }

    fn data_header(msg_id: u64) -> FrameHeader {
        FrameHeader::data(0, 0x0001, SchemaKey::for_kind("text", 1, 0), msg_id)
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buf = buffer();
        let wire = pack_frame(&data_header(1), b"hello", 0).unwrap();

        let frames = buf.push(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_id(), 1);
        assert_eq!(&frames[0].payload[..], b"hello");
        assert_eq!(buf.pending_bytes(), 0);
    }

    #[test]
    fn test_roundtrip_preserves_header_and_flags() {
        let mut header = data_header(9);
        header.in_reply_to = 4;
        header.tags.push(("k".into(), "v".into()));
        let wire = pack_frame(&header, b"payload", flags::MORE).unwrap();

        let frames = buffer().push(&wire).unwrap();
        assert_eq!(frames[0].header, header);
        assert_eq!(frames[0].flags, flags::MORE);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buf = buffer();
        let mut wire = Vec::new();
        for i in 1..=3u64 {
            wire.extend_from_slice(&pack_frame(&data_header(i), format!("m{i}").as_bytes(), 0).unwrap());
        }

        let frames = buf.push(&wire).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].msg_id(), 3);
        assert_eq!(&frames[2].payload[..], b"m3");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buf = buffer();
        let wire = pack_frame(&data_header(2), b"hi", 0).unwrap();

        let mut all = Vec::new();
        for b in wire.iter() {
            all.extend(buf.push(&[*b]).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(&all[0].payload[..], b"hi");
    }

    #[test]
    fn test_bad_magic_detected_at_four_bytes() {
        let mut buf = buffer();
        // Only 4 bytes pushed; wrong magic must already error.
        let err = buf.push(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap_err();
        assert!(matches!(err, XcpError::BadMagic { .. }));
    }

    #[test]
    fn test_crc_mismatch_on_payload_flip() {
        let wire = pack_frame(&data_header(1), &[0xAB; 1024], 0).unwrap();
        let mut corrupted = wire.to_vec();
        // Flip one payload bit (last payload byte sits before the CRC).
        let idx = corrupted.len() - CRC_LEN - 1;
        corrupted[idx] ^= 0x01;

        let err = buffer().push(&corrupted).unwrap_err();
        assert!(matches!(err, XcpError::CrcMismatch { .. }));
    }

    #[test]
    fn test_crc_mismatch_on_trailer_flip() {
        let wire = pack_frame(&data_header(1), b"payload", 0).unwrap();
        let mut corrupted = wire.to_vec();
        let idx = corrupted.len() - 1;
        corrupted[idx] ^= 0x80;

        let err = buffer().push(&corrupted).unwrap_err();
        assert!(matches!(err, XcpError::CrcMismatch { .. }));
    }

    #[test]
    fn test_frame_too_large_rejected() {
        let mut buf = FrameBuffer::new(16);
        let wire = pack_frame(&data_header(1), &[0u8; 64], 0).unwrap();
        let err = buf.push(&wire).unwrap_err();
        assert!(matches!(err, XcpError::FrameTooLarge { len: 64, max: 16 }));
    }

    #[test]
    fn test_large_flag_roundtrip() {
        let wire = pack_frame(&data_header(1), b"small but wide", flags::LARGE).unwrap();
        let frames = buffer().push(&wire).unwrap();
        assert_eq!(&frames[0].payload[..], b"small but wide");
        assert!(flags::has_flag(frames[0].flags, flags::LARGE));
    }

    #[test]
    fn test_json_header_frame_parses() {
        let header = data_header(5);
        let wire = pack_frame_as(&header, b"body", 0, HeaderForm::Json).unwrap();
        let frames = buffer().push(&wire).unwrap();
        assert_eq!(frames[0].header, header);
    }

    #[test]
    fn test_empty_payload_frame() {
        let wire = pack_frame(&data_header(1), b"", 0).unwrap();
        let frames = buffer().push(&wire).unwrap();
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buf = buffer();
        let first = pack_frame(&data_header(1), b"first", 0).unwrap();
        let second = pack_frame(&data_header(2), b"second", 0).unwrap();

        let mut data = first.to_vec();
        data.extend_from_slice(&second[..5]);

        let frames = buf.push(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_id(), 1);

        let frames = buf.push(&second[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_id(), 2);
    }

    #[test]
    fn test_malformed_header_is_fatal() {
        let wire = pack_frame(&data_header(1), b"x", 0).unwrap();
        let mut corrupted = wire.to_vec();
        // Clobber the header tag byte (first byte after the preamble).
        corrupted[PREAMBLE_LEN] = 0x42;
        let err = buffer().push(&corrupted).unwrap_err();
        assert!(matches!(err, XcpError::HeaderMalformed(_)));
    }

    // Property-style checks over randomized headers and payloads.
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
            prop::collection::vec(any::<u8>(), 0..=4096)
        }

        proptest! {
            /// parse(pack(h, p, f)) == (h, p, f) for in-range inputs.
            #[test]
            fn prop_roundtrip(
                channel in any::<u32>(),
                msg_id in 1u64..u64::MAX,
                payload in arb_payload(),
                more in any::<bool>(),
            ) {
                let header = FrameHeader::data(
                    channel,
                    0x0008,
                    SchemaKey::for_kind("text", 1, 0),
                    msg_id,
                );
                let f = if more { flags::MORE } else { 0 };
                let wire = pack_frame(&header, &payload, f).unwrap();
                let frames = buffer().push(&wire).unwrap();
                prop_assert_eq!(frames.len(), 1);
                prop_assert_eq!(&frames[0].header, &header);
                prop_assert_eq!(&frames[0].payload[..], &payload[..]);
                prop_assert_eq!(frames[0].flags, f);
            }

            /// Flipping any single bit in payload or CRC fails with CrcMismatch.
            #[test]
            fn prop_single_bit_flip_detected(
                payload in prop::collection::vec(any::<u8>(), 1..=256),
                bit in 0usize..8,
                offset_ratio in 0.0f64..1.0,
            ) {
                let header = FrameHeader::data(0, 0x0001, SchemaKey::for_kind("text", 1, 0), 1);
                let wire = pack_frame(&header, &payload, 0).unwrap();
                let mut corrupted = wire.to_vec();

                // Corruptible span: payload bytes plus the CRC trailer.
                let span = payload.len() + CRC_LEN;
                let start = corrupted.len() - span;
                let idx = start + ((span - 1) as f64 * offset_ratio) as usize;
                corrupted[idx] ^= 1 << bit;

                let result = buffer().push(&corrupted);
                let is_crc_mismatch = matches!(result, Err(XcpError::CrcMismatch { .. }));
                prop_assert!(is_crc_mismatch);
            }
        }
    }
}
