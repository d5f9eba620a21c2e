//! Session engine: handshake, negotiation, send/recv, correlation,
//! chunking, duplicate suppression, and retries.
//!
//! One connection is owned by one session. The read side is demand-driven
//! (frames are pulled when the caller invokes [`Session::recv`],
//! [`Session::request`], or [`Session::ping`]); the write side goes
//! through the dedicated writer task, so there is exactly one reader and
//! one writer per stream.

mod assembly;
mod dedup;

pub use assembly::{AssemblyTable, CompleteMessage};
pub use dedup::DupWindow;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::task::JoinHandle;

use crate::codec::{select_codec, CodecRegistry};
use crate::config::SessionConfig;
use crate::constants::{flags, msg_type, ErrorCode, RETRY_ATTEMPT_CAP};
use crate::control::{
    negotiate, AckBody, CapabilityRecord, ClarifyReqBody, ClarifyResBody, ControlBody, NackBody,
    Negotiated, PingBody,
};
use crate::error::{Result, XcpError};
use crate::ether::Ether;
use crate::protocol::{pack_frame, Frame, FrameBuffer, FrameHeader};
use crate::schema::{fnv1a_32, SchemaKey};
use crate::shm::SharedMemoryStore;
use crate::transform::TransformPipeline;
use crate::writer::{spawn_writer_task_default, OutboundFrame, WriterHandle};

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Channel to send on.
    pub channel_id: u32,
    /// Codec override; must be in the negotiated set.
    pub codec: Option<u16>,
    /// Schema key override; derived from the kind when absent.
    pub schema_key: Option<SchemaKey>,
    /// `msg_id` this message responds to.
    pub in_reply_to: u64,
    /// Header tags.
    pub tags: Vec<(String, String)>,
}

impl SendOptions {
    pub fn reply_to(msg_id: u64) -> Self {
        Self {
            in_reply_to: msg_id,
            ..Default::default()
        }
    }

    pub fn on_channel(channel_id: u32) -> Self {
        Self {
            channel_id,
            ..Default::default()
        }
    }

    pub fn with_codec(mut self, codec: u16) -> Self {
        self.codec = Some(codec);
        self
    }
}

/// A fully received and decoded data message.
#[derive(Debug)]
pub struct Delivery {
    pub msg_id: u64,
    pub header: FrameHeader,
    pub ether: Ether,
}

/// What [`Session::recv`] yields.
#[derive(Debug)]
pub enum Incoming {
    /// A decoded data message.
    Data(Delivery),
    /// Peer asks for missing fields; answer with
    /// [`Session::clarify_respond`].
    Clarify {
        msg_id: u64,
        body: ClarifyReqBody,
    },
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    HelloSent,
    HelloReceived,
    Open,
    Closing,
    Closed,
}

/// A protocol session over a reliable byte stream.
pub struct Session<S> {
    reader: ReadHalf<S>,
    frames: FrameBuffer,
    /// Frames parsed but not yet processed.
    parsed: VecDeque<Frame>,
    writer: WriterHandle,
    _writer_task: JoinHandle<Result<()>>,
    state: SessionState,
    config: SessionConfig,
    pipeline: TransformPipeline,
    negotiated: Negotiated,
    peer_caps: CapabilityRecord,
    next_msg_id: u64,
    dup_window: DupWindow,
    assemblies: AssemblyTable,
    /// Completed deliveries waiting for the caller.
    inbox: VecDeque<Incoming>,
    /// NACKs received for our outbound messages, by msg_id.
    nacks: HashMap<u64, NackBody>,
    /// PONG nonces not yet claimed by a ping() call.
    pongs: VecDeque<u64>,
    /// CLARIFY_RES bodies by the request msg_id they answer.
    clarify_responses: HashMap<u64, ClarifyResBody>,
    /// Outbound messages not yet ACKed, with any shm URIs they
    /// reference (released on ACK).
    pending_acks: HashMap<u64, Vec<String>>,
    shm_store: Option<Arc<dyn SharedMemoryStore>>,
    read_buf: Vec<u8>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Open a session as the initiating side: emit HELLO, await CAPS.
    pub async fn connect(stream: S, config: SessionConfig) -> Result<Self> {
        let mut session = Self::new(stream, config);
        let registry = CodecRegistry::global();
        registry.freeze();

        let local = session.config.capability_record(registry);
        let hello_id = session.alloc_msg_id();
        session
            .send_control(
                FrameHeader::control(
                    msg_type::HELLO,
                    crate::constants::codec_id::BINARY_STRUCT,
                    hello_id,
                ),
                &local.encode_binary(),
            )
            .await?;
        session.state = SessionState::HelloSent;

        let frame = session.read_frame().await?;
        if frame.msg_type() != msg_type::CAPS {
            return Err(session.fail(XcpError::Protocol(format!(
                "expected CAPS, got msg_type {:#06X}",
                frame.msg_type()
            ))));
        }
        let peer = match CapabilityRecord::decode(frame.header.body_codec, &frame.payload) {
            Ok(peer) => peer,
            Err(e) => return Err(session.fail(XcpError::Protocol(format!("bad CAPS body: {e}")))),
        };
        session.finish_handshake(&local, peer)
    }

    /// Open a session as the accepting side: await HELLO, emit CAPS.
    pub async fn accept(stream: S, config: SessionConfig) -> Result<Self> {
        let mut session = Self::new(stream, config);
        let registry = CodecRegistry::global();
        registry.freeze();

        let frame = session.read_frame().await?;
        if frame.msg_type() != msg_type::HELLO {
            // Anything but HELLO in INIT is a fatal protocol error.
            return Err(session.fail(XcpError::Protocol(format!(
                "expected HELLO, got msg_type {:#06X}",
                frame.msg_type()
            ))));
        }
        session.state = SessionState::HelloReceived;
        let hello_id = frame.msg_id();
        let peer = match CapabilityRecord::decode(frame.header.body_codec, &frame.payload) {
            Ok(peer) => peer,
            Err(e) => return Err(session.fail(XcpError::Protocol(format!("bad HELLO body: {e}")))),
        };

        let local = session.config.capability_record(registry);
        let caps_id = session.alloc_msg_id();
        let mut caps_header = FrameHeader::control(
            msg_type::CAPS,
            crate::constants::codec_id::BINARY_STRUCT,
            caps_id,
        );
        caps_header.in_reply_to = hello_id;
        session
            .send_control(caps_header, &local.encode_binary())
            .await?;

        let negotiated = negotiate(&local, &peer);
        if negotiated.codecs.is_empty() {
            // Tell the peer why before giving up on the connection.
            session
                .emit_nack(hello_id, ErrorCode::CodecUnsupported, None)
                .await?;
            session.state = SessionState::Closed;
            return Err(XcpError::CodecUnsupported);
        }
        session.finish_handshake(&local, peer)
    }

    fn new(stream: S, config: SessionConfig) -> Self {
        let (reader, writer_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task_default(writer_half);
        let pipeline = config.pipeline();
        let frames = FrameBuffer::new(u64::from(config.max_frame_bytes));
        let assemblies = AssemblyTable::new(
            config.max_assembled_bytes,
            config.max_inflight_assemblies,
            config.assembly_timeout,
        );
        let dup_window = DupWindow::new(config.dup_window_size);
        Self {
            reader,
            frames,
            parsed: VecDeque::new(),
            writer,
            _writer_task: writer_task,
            state: SessionState::Init,
            config,
            pipeline,
            negotiated: Negotiated {
                codecs: Vec::new(),
                max_frame_bytes: 0,
                shared_mem: false,
            },
            peer_caps: CapabilityRecord::default(),
            next_msg_id: 1,
            dup_window,
            assemblies,
            inbox: VecDeque::new(),
            nacks: HashMap::new(),
            pongs: VecDeque::new(),
            clarify_responses: HashMap::new(),
            pending_acks: HashMap::new(),
            shm_store: None,
            read_buf: vec![0u8; 64 * 1024],
        }
    }

    fn finish_handshake(mut self, local: &CapabilityRecord, peer: CapabilityRecord) -> Result<Self> {
        let negotiated = negotiate(local, &peer);
        if negotiated.codecs.is_empty() {
            self.state = SessionState::Closed;
            return Err(XcpError::CodecUnsupported);
        }
        tracing::debug!(
            codecs = ?negotiated.codecs,
            max_frame_bytes = negotiated.max_frame_bytes,
            "session open"
        );
        self.frames
            .set_max_payload(u64::from(negotiated.max_frame_bytes));
        self.negotiated = negotiated;
        self.peer_caps = peer;
        self.state = SessionState::Open;
        Ok(self)
    }

    /// Attach the shared-memory collaborator used to release published
    /// regions once their referencing frame is ACKed.
    pub fn set_shm_store(&mut self, store: Arc<dyn SharedMemoryStore>) {
        self.shm_store = Some(store);
    }

    /// Negotiated capabilities.
    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    /// The peer's advertised capability record.
    pub fn peer_caps(&self) -> &CapabilityRecord {
        &self.peer_caps
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn alloc_msg_id(&mut self) -> u64 {
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        id
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Open => Ok(()),
            _ => Err(XcpError::SessionClosed),
        }
    }

    /// Poison the connection; returns the error for convenience.
    fn fail(&mut self, err: XcpError) -> XcpError {
        tracing::error!(error = %err, "closing connection");
        self.state = SessionState::Closed;
        self.release_local_state();
        err
    }

    fn release_local_state(&mut self) {
        let abandoned = self.assemblies.drain();
        if !abandoned.is_empty() {
            tracing::debug!(count = abandoned.len(), "dropped in-flight assemblies");
        }
        self.inbox.clear();
    }

    // -----------------------------------------------------------------
    // send path
    // -----------------------------------------------------------------

    /// Encode, transform, chunk, and transmit an Ether. Returns the
    /// allocated `msg_id`.
    pub async fn send(&mut self, ether: &Ether, options: SendOptions) -> Result<u64> {
        self.ensure_open()?;
        let msg_id = self.alloc_msg_id();
        let plan = self.plan_transmit(ether, &options, msg_id)?;
        self.transmit(&plan).await?;

        let shm_uris: Vec<String> = ether
            .attachments
            .iter()
            .filter_map(|a| a.uri())
            .filter(|u| u.starts_with("shm://"))
            .map(str::to_string)
            .collect();
        self.pending_acks.insert(msg_id, shm_uris);
        Ok(msg_id)
    }

    /// Everything needed to put one message on the wire, kept so a retry
    /// can resend byte-identical frames under the same `msg_id`.
    fn plan_transmit(
        &mut self,
        ether: &Ether,
        options: &SendOptions,
        msg_id: u64,
    ) -> Result<TransmitPlan> {
        let registry = CodecRegistry::global();
        let codec = match options.codec {
            Some(id) => {
                if !self.negotiated.codecs.contains(&id) {
                    return Err(XcpError::UnknownCodec(id));
                }
                registry.get(id).ok_or(XcpError::UnknownCodec(id))?
            }
            None => select_codec(
                registry,
                self.config.codec_policy,
                &self.negotiated.codecs,
                ether,
            )?,
        };
        let schema_key = options
            .schema_key
            .unwrap_or_else(|| SchemaKey::for_kind(&ether.kind, 1, 0));

        let body = codec.encode(ether)?;
        let body = self
            .pipeline
            .outbound(body, msg_id, options.channel_id)?;

        let mut header = FrameHeader::data(options.channel_id, codec.id(), schema_key, msg_id);
        header.in_reply_to = options.in_reply_to;
        header.tags = options.tags.clone();

        Ok(TransmitPlan {
            header,
            body,
            flag_bits: self.pipeline.flag_bits(),
            max_chunk: self.negotiated.max_frame_bytes as usize,
        })
    }

    async fn transmit(&mut self, plan: &TransmitPlan) -> Result<()> {
        let chunks: Vec<&[u8]> = if plan.body.is_empty() {
            vec![&[]]
        } else {
            plan.body.chunks(plan.max_chunk).collect()
        };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let mut frame_flags = plan.flag_bits;
            if i != last {
                frame_flags |= flags::MORE;
            }
            let wire = pack_frame(&plan.header, chunk, frame_flags)?;
            self.writer.send(OutboundFrame::new(wire)).await?;
        }
        Ok(())
    }

    async fn send_control(&mut self, header: FrameHeader, body: &[u8]) -> Result<()> {
        let wire = pack_frame(&header, body, 0)?;
        self.writer.send(OutboundFrame::new(wire)).await
    }

    /// Emit an ACK for a received message.
    pub async fn ack(&mut self, msg_id: u64) -> Result<()> {
        let id = self.alloc_msg_id();
        let mut header = FrameHeader::control(
            msg_type::ACK,
            crate::constants::codec_id::BINARY_STRUCT,
            id,
        );
        header.in_reply_to = msg_id;
        let body = AckBody { msg_id }.encode_binary();
        self.send_control(header, &body).await
    }

    /// Emit a NACK with a numeric error code.
    pub async fn nack(
        &mut self,
        msg_id: u64,
        code: ErrorCode,
        retry_after_ms: Option<u64>,
    ) -> Result<()> {
        self.emit_nack(msg_id, code, retry_after_ms).await
    }

    async fn emit_nack(
        &mut self,
        msg_id: u64,
        code: ErrorCode,
        retry_after_ms: Option<u64>,
    ) -> Result<()> {
        let id = self.alloc_msg_id();
        let mut header = FrameHeader::control(
            msg_type::NACK,
            crate::constants::codec_id::BINARY_STRUCT,
            id,
        );
        header.in_reply_to = msg_id;
        let body = NackBody {
            msg_id,
            error_code: code.as_u16(),
            retry_after_ms,
        }
        .encode_binary();
        self.send_control(header, &body).await
    }

    // -----------------------------------------------------------------
    // receive path
    // -----------------------------------------------------------------

    /// Receive the next data message or surfaced control event.
    pub async fn recv(&mut self) -> Result<Incoming> {
        loop {
            if let Some(incoming) = self.inbox.pop_front() {
                return Ok(incoming);
            }
            self.ensure_open()?;
            self.sweep_expired_assemblies().await?;

            let frame = match self.read_frame().await {
                Ok(frame) => frame,
                Err(err) if err.is_connection_fatal() => {
                    // Best-effort goodbye, then close.
                    let code = err.nack_code().unwrap_or(ErrorCode::Ok);
                    let _ = self.emit_nack(0, code, None).await;
                    return Err(self.fail(err));
                }
                Err(err) => return Err(err),
            };
            if let Some(incoming) = self.process_frame(frame).await? {
                return Ok(incoming);
            }
        }
    }

    /// Send and block until a data frame arrives with
    /// `in_reply_to = msg_id`. NACKs carrying `retry_after_ms` trigger
    /// automatic retries under the same `msg_id`.
    pub async fn request(&mut self, ether: &Ether, options: SendOptions) -> Result<Ether> {
        self.ensure_open()?;
        let msg_id = self.alloc_msg_id();
        let plan = self.plan_transmit(ether, &options, msg_id)?;
        self.transmit(&plan).await?;

        let mut attempt: u32 = 0;
        loop {
            let frame = self.read_frame().await.map_err(|e| {
                if e.is_connection_fatal() {
                    self.fail(e)
                } else {
                    e
                }
            })?;
            if let Some(incoming) = self.process_frame(frame).await? {
                match incoming {
                    Incoming::Data(delivery) if delivery.header.in_reply_to == msg_id => {
                        return Ok(delivery.ether);
                    }
                    other => self.inbox.push_back(other),
                }
            }

            if let Some(nack) = self.nacks.remove(&msg_id) {
                match nack.retry_after_ms {
                    Some(retry_after_ms) if attempt < self.config.retry_max_attempts => {
                        let wait = Duration::from_millis(retry_after_ms)
                            + backoff_jitter(self.config.retry_base, attempt);
                        tracing::debug!(msg_id, attempt, ?wait, "retrying after NACK");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        self.transmit(&plan).await?;
                    }
                    Some(_) => return Err(XcpError::DeliveryFailed(msg_id)),
                    None => {
                        let code =
                            ErrorCode::from_u16(nack.error_code).unwrap_or(ErrorCode::Ok);
                        return Err(XcpError::Nacked { msg_id, code });
                    }
                }
            }
        }
    }

    /// [`Session::request`] with a per-call deadline. A timeout is a pure
    /// local cancel; no NACK is emitted.
    pub async fn request_timeout(
        &mut self,
        ether: &Ether,
        options: SendOptions,
        deadline: Duration,
    ) -> Result<Ether> {
        match tokio::time::timeout(deadline, self.request(ether, options)).await {
            Ok(result) => result,
            Err(_) => Err(XcpError::Timeout),
        }
    }

    /// Round-trip probe. Returns the observed latency.
    pub async fn ping(&mut self) -> Result<Duration> {
        self.ensure_open()?;
        let nonce = rand_u64();
        let id = self.alloc_msg_id();
        let header = FrameHeader::control(
            msg_type::PING,
            crate::constants::codec_id::BINARY_STRUCT,
            id,
        );
        let body = PingBody { nonce }.encode_binary();
        self.send_control(header, &body).await?;
        let started = Instant::now();

        let deadline = self.config.ping_timeout;
        loop {
            if let Some(pos) = self.pongs.iter().position(|&n| n == nonce) {
                self.pongs.remove(pos);
                return Ok(started.elapsed());
            }
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or(XcpError::Timeout)?;
            let frame = match tokio::time::timeout(remaining, self.read_frame()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(XcpError::Timeout),
            };
            if let Some(incoming) = self.process_frame(frame).await? {
                self.inbox.push_back(incoming);
            }
        }
    }

    /// Ask the peer to supply missing fields; blocks until CLARIFY_RES.
    pub async fn clarify(&mut self, reason: &str, fields: Vec<String>) -> Result<ClarifyResBody> {
        self.ensure_open()?;
        let id = self.alloc_msg_id();
        let header = FrameHeader::control(
            msg_type::CLARIFY_REQ,
            crate::constants::codec_id::BINARY_STRUCT,
            id,
        );
        let body = ClarifyReqBody {
            reason: reason.to_string(),
            fields,
        }
        .encode_binary();
        self.send_control(header, &body).await?;

        loop {
            if let Some(res) = self.clarify_responses.remove(&id) {
                return Ok(res);
            }
            let frame = self.read_frame().await?;
            if let Some(incoming) = self.process_frame(frame).await? {
                self.inbox.push_back(incoming);
            }
        }
    }

    /// Answer a surfaced CLARIFY_REQ.
    pub async fn clarify_respond(
        &mut self,
        request_msg_id: u64,
        fields: Vec<(String, String)>,
    ) -> Result<()> {
        let id = self.alloc_msg_id();
        let mut header = FrameHeader::control(
            msg_type::CLARIFY_RES,
            crate::constants::codec_id::BINARY_STRUCT,
            id,
        );
        header.in_reply_to = request_msg_id;
        let body = ClarifyResBody { fields }.encode_binary();
        self.send_control(header, &body).await
    }

    /// Close the session. Idempotent; in-flight reassemblies are dropped
    /// and later calls fail with `SessionClosed`.
    pub async fn close(&mut self) {
        if matches!(self.state, SessionState::Closed | SessionState::Closing) {
            return;
        }
        self.state = SessionState::Closing;
        self.release_local_state();
        self.state = SessionState::Closed;
    }

    // -----------------------------------------------------------------
    // frame intake
    // -----------------------------------------------------------------

    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.parsed.pop_front() {
                return Ok(frame);
            }
            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                // EOF inside a frame is truncation; at a boundary it is a
                // peer close.
                if self.frames.pending_bytes() > 0 {
                    return Err(XcpError::PayloadTruncated);
                }
                self.state = SessionState::Closed;
                return Err(XcpError::SessionClosed);
            }
            let buf = std::mem::take(&mut self.read_buf);
            let result = self.frames.push(&buf[..n]);
            self.read_buf = buf;
            self.parsed.extend(result?);
        }
    }

    async fn sweep_expired_assemblies(&mut self) -> Result<()> {
        for msg_id in self.assemblies.expire_stalled() {
            tracing::warn!(msg_id, "assembly expired");
            self.emit_nack(msg_id, ErrorCode::MessageTooLarge, None)
                .await?;
        }
        Ok(())
    }

    async fn process_frame(&mut self, frame: Frame) -> Result<Option<Incoming>> {
        if frame.is_control() {
            self.process_control(frame).await
        } else {
            self.process_data(frame).await
        }
    }

    async fn process_control(&mut self, frame: Frame) -> Result<Option<Incoming>> {
        match frame.msg_type() {
            msg_type::HELLO | msg_type::CAPS => {
                Err(self.fail(XcpError::Protocol("unexpected handshake frame".into())))
            }
            msg_type::ACK => {
                let body = AckBody::decode(frame.header.body_codec, &frame.payload)?;
                if let Some(shm_uris) = self.pending_acks.remove(&body.msg_id) {
                    if let Some(store) = &self.shm_store {
                        for uri in &shm_uris {
                            store.release(uri);
                        }
                    }
                }
                Ok(None)
            }
            msg_type::NACK => {
                let body = NackBody::decode(frame.header.body_codec, &frame.payload)?;
                tracing::warn!(
                    msg_id = body.msg_id,
                    code = body.error_code,
                    "peer NACKed message"
                );
                self.nacks.insert(body.msg_id, body);
                Ok(None)
            }
            msg_type::PING => {
                let body = PingBody::decode(frame.header.body_codec, &frame.payload)?;
                let id = self.alloc_msg_id();
                let mut header = FrameHeader::control(
                    msg_type::PONG,
                    crate::constants::codec_id::BINARY_STRUCT,
                    id,
                );
                header.in_reply_to = frame.msg_id();
                let pong = PingBody { nonce: body.nonce }.encode_binary();
                self.send_control(header, &pong).await?;
                Ok(None)
            }
            msg_type::PONG => {
                let body = PingBody::decode(frame.header.body_codec, &frame.payload)?;
                self.pongs.push_back(body.nonce);
                Ok(None)
            }
            msg_type::CLARIFY_REQ => {
                // Clarifications take part in duplicate suppression like
                // any other message.
                if !self.dup_window.insert(frame.msg_id()) {
                    return Ok(None);
                }
                let body = ClarifyReqBody::decode(frame.header.body_codec, &frame.payload)?;
                Ok(Some(Incoming::Clarify {
                    msg_id: frame.msg_id(),
                    body,
                }))
            }
            msg_type::CLARIFY_RES => {
                let body = ClarifyResBody::decode(frame.header.body_codec, &frame.payload)?;
                self.clarify_responses.insert(frame.header.in_reply_to, body);
                Ok(None)
            }
            other => Err(self.fail(XcpError::Protocol(format!(
                "unknown control msg_type {other:#06X}"
            )))),
        }
    }

    async fn process_data(&mut self, frame: Frame) -> Result<Option<Incoming>> {
        let msg_id = frame.msg_id();

        // Replay of a delivered message: never re-deliver. Non-final
        // chunks drop silently; the final chunk re-arriving earns one
        // re-emitted ACK.
        if self.dup_window.contains(msg_id) {
            tracing::debug!(msg_id, "duplicate frame suppressed");
            if !frame.has_more() {
                self.ack(msg_id).await?;
            }
            return Ok(None);
        }

        // Unknown codec or out-of-range schema is a per-message reject.
        if CodecRegistry::global().get(frame.header.body_codec).is_none()
            || !self.negotiated.codecs.contains(&frame.header.body_codec)
        {
            self.emit_nack(msg_id, ErrorCode::CodecUnsupported, None)
                .await?;
            return Ok(None);
        }
        if !self.config.accepted.is_empty() {
            let key = &frame.header.schema_key;
            if !self.config.accepted.iter().any(|range| range.contains(key)) {
                self.emit_nack(msg_id, ErrorCode::SchemaUnknown, None).await?;
                return Ok(None);
            }
        }

        let complete = match self.assemblies.push_chunk(frame) {
            Ok(Some(complete)) => complete,
            Ok(None) => return Ok(None),
            Err(err) => {
                let code = err.nack_code().unwrap_or(ErrorCode::MessageTooLarge);
                self.emit_nack(msg_id, code, None).await?;
                return Ok(None);
            }
        };

        // Delivered (or about to be): suppress replays from here on.
        self.dup_window.insert(msg_id);

        match self.decode_complete(&complete) {
            Ok(ether) => Ok(Some(Incoming::Data(Delivery {
                msg_id,
                header: complete.header,
                ether,
            }))),
            Err(err) => {
                let code = err.nack_code().unwrap_or(ErrorCode::SchemaUnknown);
                tracing::warn!(msg_id, error = %err, "message rejected");
                self.emit_nack(msg_id, code, None).await?;
                Ok(None)
            }
        }
    }

    fn decode_complete(&self, complete: &CompleteMessage) -> Result<Ether> {
        let body = self.pipeline.inbound(
            &complete.body,
            complete.flags,
            complete.header.msg_id,
            complete.header.channel_id,
        )?;
        let codec = CodecRegistry::global()
            .get(complete.header.body_codec)
            .ok_or(XcpError::UnknownCodec(complete.header.body_codec))?;
        let ether = codec.decode(&body)?;

        // A nonzero kind hash in the schema key must match the envelope,
        // when the codec actually encodes the kind.
        let kind_id = complete.header.schema_key.kind_id;
        if codec.carries_kind() && kind_id != 0 && kind_id != fnv1a_32(ether.kind.as_bytes()) {
            return Err(XcpError::KindMismatch { kind: ether.kind });
        }
        Ok(ether)
    }
}

/// One message's wire plan; retries resend it unchanged.
struct TransmitPlan {
    header: FrameHeader,
    body: Vec<u8>,
    flag_bits: u8,
    max_chunk: usize,
}

/// Time-seeded random u64 (nonce and jitter source).
fn rand_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    nanos.wrapping_mul(0x517c_c1b7_2722_0a95) ^ pid
}

/// Jitter in `[0, base * 2^attempt]`, attempt capped.
fn backoff_jitter(base: Duration, attempt: u32) -> Duration {
    let cap_ms = base.as_millis() as u64 * (1u64 << attempt.min(RETRY_ATTEMPT_CAP));
    Duration::from_millis(rand_u64() % (cap_ms + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::codec_id;

    #[test]
    fn test_backoff_jitter_bounds() {
        let base = Duration::from_millis(50);
        for attempt in 0..10 {
            let jitter = backoff_jitter(base, attempt);
            let cap = 50 * (1u64 << attempt.min(RETRY_ATTEMPT_CAP));
            assert!(jitter.as_millis() as u64 <= cap, "attempt {attempt}");
        }
        // The exponent stops growing at the cap.
        assert_eq!(1u64 << 10u32.min(RETRY_ATTEMPT_CAP), 64);
    }

    #[test]
    fn test_send_options_builders() {
        let reply = SendOptions::reply_to(9);
        assert_eq!(reply.in_reply_to, 9);
        assert_eq!(reply.channel_id, 0);

        let channel = SendOptions::on_channel(3).with_codec(codec_id::JSON);
        assert_eq!(channel.channel_id, 3);
        assert_eq!(channel.codec, Some(codec_id::JSON));
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(async move {
            Session::accept(server_stream, SessionConfig::default()).await
        });
        let client = Session::connect(client_stream, SessionConfig::default())
            .await
            .unwrap();
        let server = server.await.unwrap().unwrap();

        assert_eq!(client.state(), SessionState::Open);
        assert_eq!(server.state(), SessionState::Open);
        assert_eq!(client.negotiated().codecs, server.negotiated().codecs);
        assert!(client.negotiated().codecs.contains(&codec_id::JSON));
    }

    #[tokio::test]
    async fn test_handshake_negotiates_min_frame_budget() {
        let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(async move {
            Session::accept(
                server_stream,
                SessionConfig::default().with_max_frame_bytes(512 * 1024),
            )
            .await
        });
        let client = Session::connect(
            client_stream,
            SessionConfig::default().with_max_frame_bytes(4 << 20),
        )
        .await
        .unwrap();
        let server = server.await.unwrap().unwrap();

        assert_eq!(client.negotiated().max_frame_bytes, 512 * 1024);
        assert_eq!(server.negotiated().max_frame_bytes, 512 * 1024);
    }

    #[tokio::test]
    async fn test_handshake_empty_intersection() {
        let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(async move {
            Session::accept(
                server_stream,
                SessionConfig::default().with_codecs(vec![codec_id::BINARY_STRUCT]),
            )
            .await
        });
        let client = Session::connect(
            client_stream,
            SessionConfig::default().with_codecs(vec![codec_id::JSON, codec_id::ARROW_IPC]),
        )
        .await;

        assert!(matches!(client, Err(XcpError::CodecUnsupported)));
        assert!(matches!(
            server.await.unwrap(),
            Err(XcpError::CodecUnsupported)
        ));
    }

    #[tokio::test]
    async fn test_non_hello_first_frame_is_fatal() {
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            Session::accept(server_stream, SessionConfig::default()).await
        });

        // Hand-feed a PING instead of HELLO.
        let (mut reader, writer_half) = tokio::io::split(client_stream);
        let (writer, _task) = spawn_writer_task_default(writer_half);
        let header = FrameHeader::control(msg_type::PING, codec_id::BINARY_STRUCT, 1);
        let wire = pack_frame(&header, &PingBody { nonce: 1 }.encode_binary(), 0).unwrap();
        writer.send(OutboundFrame::new(wire)).await.unwrap();

        assert!(matches!(
            server.await.unwrap(),
            Err(XcpError::Protocol(_))
        ));
        let mut sink = Vec::new();
        let _ = reader.read_to_end(&mut sink).await;
    }

    #[tokio::test]
    async fn test_msg_ids_strictly_monotonic() {
        let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(async move {
            let mut s = Session::accept(server_stream, SessionConfig::default())
                .await
                .unwrap();
            // Drain enough frames to let the client finish sending.
            loop {
                match s.recv().await {
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        let mut client = Session::connect(client_stream, SessionConfig::default())
            .await
            .unwrap();
        let mut last = 0;
        for i in 0..5 {
            let id = client
                .send(&Ether::text(format!("m{i}")), SendOptions::default())
                .await
                .unwrap();
            assert!(id > last, "msg_id {id} not above {last}");
            last = id;
        }
        client.close().await;
        drop(client);
        let _ = server.await;
    }
}
