//! Client facade: TCP connect, handshake, and the request/send surface.
//!
//! # Example
//!
//! ```ignore
//! use xcp::{Client, Ether, SendOptions, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::connect("127.0.0.1:9944", SessionConfig::default()).await?;
//!     let reply = client.request(&Ether::text("hi"), SendOptions::default()).await?;
//!     println!("{:?}", reply.payload.get("text"));
//!     client.close().await;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use tokio::net::{TcpStream, ToSocketAddrs};

use crate::config::SessionConfig;
use crate::constants::ErrorCode;
use crate::error::Result;
use crate::ether::Ether;
use crate::session::{Incoming, SendOptions, Session};

/// A connected XCP client.
pub struct Client {
    session: Session<TcpStream>,
}

impl Client {
    /// Connect and complete the HELLO/CAPS handshake.
    pub async fn connect(addr: impl ToSocketAddrs, config: SessionConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let session = Session::connect(stream, config).await?;
        Ok(Self { session })
    }

    /// Fire-and-forget send; returns the allocated `msg_id`.
    pub async fn send(&mut self, ether: &Ether, options: SendOptions) -> Result<u64> {
        self.session.send(ether, options).await
    }

    /// Send and await the data frame answering it.
    pub async fn request(&mut self, ether: &Ether, options: SendOptions) -> Result<Ether> {
        self.session.request(ether, options).await
    }

    /// [`Client::request`] with a deadline.
    pub async fn request_timeout(
        &mut self,
        ether: &Ether,
        options: SendOptions,
        deadline: Duration,
    ) -> Result<Ether> {
        self.session.request_timeout(ether, options, deadline).await
    }

    /// Receive the next inbound message or surfaced control event.
    pub async fn recv(&mut self) -> Result<Incoming> {
        self.session.recv().await
    }

    /// Acknowledge a received message.
    pub async fn ack(&mut self, msg_id: u64) -> Result<()> {
        self.session.ack(msg_id).await
    }

    /// Reject a received message.
    pub async fn nack(
        &mut self,
        msg_id: u64,
        code: ErrorCode,
        retry_after_ms: Option<u64>,
    ) -> Result<()> {
        self.session.nack(msg_id, code, retry_after_ms).await
    }

    /// Round-trip latency probe.
    pub async fn ping(&mut self) -> Result<Duration> {
        self.session.ping().await
    }

    /// Close the session.
    pub async fn close(&mut self) {
        self.session.close().await
    }

    /// Direct access to the underlying session.
    pub fn session(&mut self) -> &mut Session<TcpStream> {
        &mut self.session
    }
}
