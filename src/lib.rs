//! # xcp
//!
//! XCP (eXtensible Coordination Protocol): a binary, schema-aware,
//! codec-negotiated message transport for AI agents exchanging control
//! messages, JSON envelopes, columnar batches, and raw tensors over a
//! reliable byte stream.
//!
//! ## Layers
//!
//! - **Frame codec** ([`protocol`]): preamble + dual-form header +
//!   length-prefixed payload + CRC32C trailer.
//! - **Ether envelope** ([`Ether`]): self-describing data with tagged
//!   values and binary attachments.
//! - **Codecs** ([`codec`]): JSON, binary struct, raw tensors, mixed
//!   latent segments, DLPack capsules; dispatched through a process-wide
//!   registry frozen at first session open.
//! - **Session engine** ([`Session`]): HELLO/CAPS negotiation, chunking
//!   and reassembly, duplicate suppression, ACK/NACK/PING, retries.
//! - **Facades** ([`Client`], [`Server`]): connection lifecycle over TCP
//!   (or any `AsyncRead + AsyncWrite` stream).
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xcp::{Client, EchoHandler, Ether, SendOptions, Server, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind("127.0.0.1:0", SessionConfig::default()).await?;
//!     let addr = server.local_addr()?;
//!     tokio::spawn(server.serve(Arc::new(EchoHandler)));
//!
//!     let mut client = Client::connect(addr, SessionConfig::default()).await?;
//!     let reply = client.request(&Ether::text("hi"), SendOptions::default()).await?;
//!     assert_eq!(reply.payload["text"].as_str(), Some("hi"));
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod constants;
pub mod control;
pub mod error;
pub mod ether;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod session;
pub mod shm;
pub mod transform;

mod client;
mod writer;

pub use client::Client;
pub use codec::{CodecPolicy, CodecRegistry, EtherCodec};
pub use config::SessionConfig;
pub use constants::ErrorCode;
pub use control::{CapabilityRecord, Negotiated};
pub use error::{Result, XcpError};
pub use ether::{Attachment, AttachmentData, Ether, Value};
pub use protocol::{Frame, FrameHeader};
pub use schema::{SchemaKey, SchemaRange};
pub use server::{EchoHandler, FnHandler, Handler, HandlerResult, Server};
pub use session::{Delivery, Incoming, SendOptions, Session, SessionState};
pub use shm::{MemoryShmStore, SharedMemoryStore, ShmUri};
pub use writer::{WriterConfig, WriterHandle};
