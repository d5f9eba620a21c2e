//! Dedicated writer task for frame sending.
//!
//! The session never writes to the stream directly; packed frames go
//! through an mpsc channel to a single writer task. That keeps the write
//! path serialized (one writer per connection) and lets bursts of frames
//! batch into a single vectored write.
//!
//! ```text
//! send()/ack()/nack() ─┐
//! control emission    ─┼─► mpsc::Sender<OutboundFrame> ─► writer task ─► stream
//! chunked transmit    ─┘
//! ```
//!
//! Backpressure: the channel is bounded and an in-flight counter caps
//! queued frames, so senders block once the write side stops keeping up.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, XcpError};

/// Default cap on queued frames before senders start blocking.
pub const DEFAULT_MAX_QUEUED_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default wait before a blocked sender gives up.
pub const DEFAULT_QUEUE_WAIT: Duration = Duration::from_secs(5);

/// Most frames folded into one vectored write.
const MAX_BATCH: usize = 64;

/// A fully packed frame ready for the stream.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Complete wire bytes: preamble, header, PLEN, payload, CRC.
    pub wire: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(wire: Bytes) -> Self {
        Self { wire }
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.wire.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Cap on queued frames before senders block.
    pub max_queued_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// How long a blocked sender waits for the queue to drain.
    pub queue_wait: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_queued_frames: DEFAULT_MAX_QUEUED_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            queue_wait: DEFAULT_QUEUE_WAIT,
        }
    }
}

/// Handle for queueing frames onto a connection's writer task.
///
/// Cheaply cloneable; all clones feed the same serialized writer.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    in_flight: Arc<AtomicUsize>,
    limit: usize,
    queue_wait: Duration,
}

impl WriterHandle {
    /// Queue a frame, waiting out backpressure if necessary.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.in_flight.load(Ordering::Acquire) >= self.limit {
            self.wait_for_capacity().await?;
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).await.map_err(|_| {
            self.in_flight.fetch_sub(1, Ordering::Release);
            XcpError::SessionClosed
        })
    }

    async fn wait_for_capacity(&self) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.in_flight.load(Ordering::Acquire) < self.limit {
                return Ok(());
            }
            if started.elapsed() > self.queue_wait {
                return Err(XcpError::Timeout);
            }
            tokio::time::sleep(Duration::from_micros(100)).await;
        }
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn queued(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether the queue is at capacity.
    #[inline]
    pub fn is_saturated(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) >= self.limit
    }
}

/// Spawn the writer task for a stream's write half.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let in_flight = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        in_flight: in_flight.clone(),
        limit: config.max_queued_frames,
        queue_wait: config.queue_wait,
    };
    let task = tokio::spawn(writer_loop(rx, writer, in_flight));
    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

/// Writer loop: drain the channel, batching ready frames per syscall.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    in_flight: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH);
    loop {
        match rx.recv().await {
            Some(first) => batch.push(first),
            None => return Ok(()), // channel closed, clean shutdown
        }
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let written = batch.len();
        write_batch(&mut writer, &batch).await?;
        in_flight.fetch_sub(written, Ordering::Release);
        batch.clear();
    }
}

/// Write a batch of frames with vectored writes, finishing partial
/// writes byte-exactly.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }
    let total: usize = batch.iter().map(|f| f.size()).sum();

    let mut done = 0;
    while done < total {
        let slices = slices_from(batch, done);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(XcpError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        done += n;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlice array for the unwritten tail of a batch.
fn slices_from(batch: &[OutboundFrame], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut passed = 0;

    for frame in batch {
        let end = passed + frame.size();
        if skip < end {
            let offset = skip.saturating_sub(passed);
            slices.push(IoSlice::new(&frame.wire[offset..]));
        }
        passed = end;
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::duplex;

    fn frame_of(len: usize) -> OutboundFrame {
        OutboundFrame::new(Bytes::from(vec![0xAB; len]))
    }

    #[test]
    fn test_outbound_frame_size() {
        assert_eq!(frame_of(32).size(), 32);
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_queued_frames, DEFAULT_MAX_QUEUED_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.queue_wait, DEFAULT_QUEUE_WAIT);
    }

    #[tokio::test]
    async fn test_send_reaches_stream() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        handle.send(frame_of(16)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut buf = vec![0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(n, 16);
    }

    #[tokio::test]
    async fn test_burst_is_batched() {
        let (client, mut server) = duplex(8192);
        let (handle, _task) = spawn_writer_task_default(client);

        for _ in 0..10 {
            handle.send(frame_of(20)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut buf = vec![0u8; 1024];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(n, 200);
    }

    #[tokio::test]
    async fn test_queue_starts_empty() {
        let (client, _server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);
        assert_eq!(handle.queued(), 0);
        assert!(!handle.is_saturated());
    }

    #[tokio::test]
    async fn test_clean_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);
        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_write_batch_contiguous() {
        let mut buf = Cursor::new(Vec::new());
        let batch = vec![frame_of(5), frame_of(7), frame_of(3)];
        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 15);
    }

    #[test]
    fn test_slices_from_offsets() {
        let batch = vec![frame_of(10), frame_of(10)];

        let all = slices_from(&batch, 0);
        assert_eq!(all.len(), 2);

        let mid_first = slices_from(&batch, 4);
        assert_eq!(mid_first.len(), 2);
        assert_eq!(mid_first[0].len(), 6);

        let into_second = slices_from(&batch, 13);
        assert_eq!(into_second.len(), 1);
        assert_eq!(into_second[0].len(), 7);

        assert!(slices_from(&batch, 20).is_empty());
    }
}
