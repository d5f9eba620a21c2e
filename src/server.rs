//! Server facade: TCP listener, per-connection sessions, and handler
//! dispatch.
//!
//! # Example
//!
//! ```ignore
//! use xcp::{EchoHandler, Server, SessionConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind("127.0.0.1:9944", SessionConfig::default()).await?;
//!     server.serve(Arc::new(EchoHandler)).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};

use crate::config::SessionConfig;
use crate::constants::ErrorCode;
use crate::error::{Result, XcpError};
use crate::ether::Ether;
use crate::protocol::FrameHeader;
use crate::session::{Incoming, SendOptions, Session};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a handler returns: an optional response Ether (sent with
/// `in_reply_to` set) or an error (NACKed).
pub type HandlerResult = Result<Option<Ether>>;

/// Application hook for inbound data messages.
pub trait Handler: Send + Sync {
    fn on_data(&self, header: FrameHeader, ether: Ether) -> BoxFuture<'static, HandlerResult>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(pub F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(FrameHeader, Ether) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn on_data(&self, header: FrameHeader, ether: Ether) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.0)(header, ether))
    }
}

/// Default handler: echo every data message back to the sender.
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn on_data(&self, _header: FrameHeader, ether: Ether) -> BoxFuture<'static, HandlerResult> {
        Box::pin(async move { Ok(Some(ether)) })
    }
}

/// An XCP server bound to a TCP address.
pub struct Server {
    listener: TcpListener,
    config: SessionConfig,
}

impl Server {
    /// Bind the listener.
    pub async fn bind(addr: impl ToSocketAddrs, config: SessionConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, config })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, serving each on its own task.
    pub async fn serve(self, handler: Arc<dyn Handler>) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            let config = self.config.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                tracing::debug!(%peer, "connection accepted");
                if let Err(e) = serve_connection(stream, config, handler).await {
                    tracing::warn!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }
}

/// Handshake and serve a single connection.
pub async fn serve_connection<S>(
    stream: S,
    config: SessionConfig,
    handler: Arc<dyn Handler>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut session = Session::accept(stream, config).await?;
    serve_session(&mut session, handler.as_ref()).await
}

/// Dispatch loop over an open session.
///
/// A handler response goes back as a data frame with `in_reply_to` set;
/// a `None` response is acknowledged with an ACK; a handler error turns
/// into a NACK. Returns cleanly when the peer closes.
pub async fn serve_session<S>(session: &mut Session<S>, handler: &dyn Handler) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        match session.recv().await {
            Ok(Incoming::Data(delivery)) => {
                let msg_id = delivery.msg_id;
                let channel_id = delivery.header.channel_id;
                match handler.on_data(delivery.header, delivery.ether).await {
                    Ok(Some(response)) => {
                        let mut options = SendOptions::reply_to(msg_id);
                        options.channel_id = channel_id;
                        session.send(&response, options).await?;
                    }
                    Ok(None) => session.ack(msg_id).await?,
                    Err(e) => {
                        tracing::warn!(msg_id, error = %e, "handler failed");
                        let code = e.nack_code().unwrap_or(ErrorCode::SchemaUnknown);
                        session.nack(msg_id, code, None).await?;
                    }
                }
            }
            Ok(Incoming::Clarify { msg_id, body }) => {
                // No application hook for clarifications here; answer
                // with an empty field set so the peer is not left hanging.
                tracing::debug!(msg_id, reason = %body.reason, "clarification requested");
                session.clarify_respond(msg_id, Vec::new()).await?;
            }
            Err(XcpError::SessionClosed) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}
