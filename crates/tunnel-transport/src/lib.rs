//! Transport-agnostic adapter interface consumed by the tunnel core.
//!
//! The core never speaks directly to a socket. It accepts anything that
//! implements [`TransportAdapter`] and hands every accepted connection to a
//! [`ConnectionAcceptor`] as a plain async byte stream, so the rest of the
//! fabric (codec, session manager, bridge) is identical whether the
//! concrete transport is TCP, WebSocket, QUIC, or UDP.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send + Unpin>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    BindFailed(String),
    #[error("dial failed: {0}")]
    DialFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("adapter already stopped")]
    Stopped,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Invoked once per accepted physical connection. Implementations hand the
/// stream off to the session manager; they must not block the accept loop
/// for longer than spawning a task.
#[async_trait]
pub trait ConnectionAcceptor: Send + Sync {
    async fn accept(
        &self,
        reader: BoxedReader,
        writer: BoxedWriter,
        remote_addr: SocketAddr,
        protocol_name: &str,
    );
}

/// A concrete transport (TCP, WebSocket, QUIC, UDP-framed) the core drives
/// through this interface alone.
#[async_trait]
pub trait TransportAdapter: Send + Sync + Debug {
    /// Authoritative protocol name reported to accepted connections and
    /// used for the Connection.protocolName field (e.g. "tcp", "websocket").
    fn protocol_name(&self) -> &str;

    /// Starts accepting connections, invoking `acceptor` for each one.
    /// Returns once the listener is bound and the accept loop is running;
    /// does not block for the lifetime of the adapter.
    async fn start(&self, acceptor: Arc<dyn ConnectionAcceptor>) -> TransportResult<()>;

    /// Opens an outgoing connection to `target`, used for inter-node
    /// dialing (cross-node bridge) and client-initiated tunnel opens.
    async fn dial(&self, target: &str) -> TransportResult<(BoxedReader, BoxedWriter)>;

    /// Stops accepting new connections. Already-accepted connections are
    /// unaffected; their lifecycle is owned by the session manager.
    async fn stop(&self) -> TransportResult<()>;
}
