//! Protocol module - wire format, framing, and frame types.
//!
//! Implements the binary frame codec:
//! - fixed preamble + dual-form header encoding/decoding
//! - frame packing with the CRC32C trailer
//! - frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{pack_frame, pack_frame_as, Frame, HeaderForm};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    FrameHeader, Preamble, CRC_LEN, HEADER_FIXED_LEN, HEADER_TAG_BINARY, PREAMBLE_LEN,
};
