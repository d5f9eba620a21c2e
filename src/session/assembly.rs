//! Chunk reassembly: buffers payloads sharing a `msg_id` until the final
//! chunk (MORE = 0) arrives.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, XcpError};
use crate::protocol::{Frame, FrameHeader};

/// A message whose chunks have all arrived, body still transformed.
#[derive(Debug)]
pub struct CompleteMessage {
    /// Header of the first chunk (chunks share identity fields).
    pub header: FrameHeader,
    /// Transform flags the chunks carried.
    pub flags: u8,
    /// Concatenated payload bytes, pre-decrypt/decompress.
    pub body: Bytes,
}

/// One in-progress reassembly.
#[derive(Debug)]
struct Assembly {
    header: FrameHeader,
    flags: u8,
    buffer: BytesMut,
    last_chunk_at: Instant,
}

/// Per-session table of in-progress reassemblies.
#[derive(Debug)]
pub struct AssemblyTable {
    assemblies: HashMap<u64, Assembly>,
    max_assembled_bytes: u64,
    max_inflight: usize,
    timeout: Duration,
}

impl AssemblyTable {
    pub fn new(max_assembled_bytes: u64, max_inflight: usize, timeout: Duration) -> Self {
        Self {
            assemblies: HashMap::new(),
            max_assembled_bytes,
            max_inflight,
            timeout,
        }
    }

    /// Feed a data frame. Returns the complete message once the final
    /// chunk arrives.
    ///
    /// On a per-message error the assembly is dropped; the caller NACKs
    /// and moves on.
    pub fn push_chunk(&mut self, frame: Frame) -> Result<Option<CompleteMessage>> {
        let msg_id = frame.msg_id();
        let more = frame.has_more();

        // Fast path: single-frame message with no assembly open.
        if !self.assemblies.contains_key(&msg_id) {
            if frame.payload.len() as u64 > self.max_assembled_bytes {
                return Err(XcpError::MessageTooLarge(format!(
                    "message {} exceeds {} assembled bytes",
                    msg_id, self.max_assembled_bytes
                )));
            }
            if !more {
                return Ok(Some(CompleteMessage {
                    header: frame.header,
                    flags: frame.flags,
                    body: frame.payload,
                }));
            }
            if self.assemblies.len() >= self.max_inflight {
                return Err(XcpError::MessageTooLarge(format!(
                    "assembly table full ({} in flight)",
                    self.assemblies.len()
                )));
            }
            let mut buffer = BytesMut::with_capacity(frame.payload.len() * 2);
            buffer.put_slice(&frame.payload);
            self.assemblies.insert(
                msg_id,
                Assembly {
                    header: frame.header,
                    flags: frame.flags,
                    buffer,
                    last_chunk_at: Instant::now(),
                },
            );
            return Ok(None);
        }

        let assembly = self.assemblies.get_mut(&msg_id).expect("checked above");

        // Chunks of one message share body_codec and schema_key.
        if assembly.header.body_codec != frame.header.body_codec
            || assembly.header.schema_key != frame.header.schema_key
        {
            self.assemblies.remove(&msg_id);
            return Err(XcpError::DecodeFailed(format!(
                "chunk of msg_id {msg_id} changed codec or schema mid-message"
            )));
        }

        let total = assembly.buffer.len() as u64 + frame.payload.len() as u64;
        if total > self.max_assembled_bytes {
            self.assemblies.remove(&msg_id);
            return Err(XcpError::MessageTooLarge(format!(
                "message {} exceeds {} assembled bytes",
                msg_id, self.max_assembled_bytes
            )));
        }

        assembly.buffer.put_slice(&frame.payload);
        assembly.last_chunk_at = Instant::now();

        if more {
            return Ok(None);
        }
        let assembly = self.assemblies.remove(&msg_id).expect("checked above");
        Ok(Some(CompleteMessage {
            header: assembly.header,
            flags: assembly.flags,
            body: assembly.buffer.freeze(),
        }))
    }

    /// Drop assemblies with no new chunk inside the timeout. Returns the
    /// expired message ids for NACKing.
    pub fn expire_stalled(&mut self) -> Vec<u64> {
        let now = Instant::now();
        let timeout = self.timeout;
        let expired: Vec<u64> = self
            .assemblies
            .iter()
            .filter(|(_, a)| now.duration_since(a.last_chunk_at) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in &expired {
            self.assemblies.remove(id);
        }
        expired
    }

    /// Drop everything (session close). Returns the abandoned ids.
    pub fn drain(&mut self) -> Vec<u64> {
        let ids = self.assemblies.keys().copied().collect();
        self.assemblies.clear();
        ids
    }

    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }
}
