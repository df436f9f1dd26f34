//! Bridges an accepted transport connection (spec §4.4) into the
//! session manager and runs its control-plane read loop until the
//! connection enters stream mode, errors, or is cancelled.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use tunnel_proto::CodecError;
use tunnel_router::{PacketRouter, RouteOutcome};
use tunnel_session::SessionManager;
use tunnel_transport::{BoxedReader, BoxedWriter, ConnectionAcceptor};

pub struct ServerAcceptor {
    sessions: Arc<SessionManager>,
    router: Arc<PacketRouter>,
}

impl ServerAcceptor {
    pub fn new(sessions: Arc<SessionManager>, router: Arc<PacketRouter>) -> Self {
        Self { sessions, router }
    }
}

#[async_trait]
impl ConnectionAcceptor for ServerAcceptor {
    async fn accept(&self, reader: BoxedReader, writer: BoxedWriter, remote_addr: SocketAddr, protocol_name: &str) {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let conn = self.sessions.create_connection(conn_id.clone(), protocol_name.to_string(), reader, writer).await;
        info!(conn_id = %conn_id, remote = %remote_addr, protocol = protocol_name, "accepted connection");

        let mut entered_stream_mode = false;

        loop {
            let read = tokio::select! {
                res = conn.codec.read_packet() => res,
                _ = conn.scope.cancelled() => break,
            };

            let packet = match read {
                Ok((packet, _wire_len)) => packet,
                Err(CodecError::Eof) | Err(CodecError::Cancelled) => break,
                Err(err) => {
                    debug!(conn_id = %conn_id, error = %err, "closing connection after codec error");
                    break;
                }
            };

            match self.router.route(&conn, packet).await {
                Ok(RouteOutcome::ProtocolViolation) => {
                    warn!(conn_id = %conn_id, "protocol violation, closing connection");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(conn_id = %conn_id, error = %err, "handler error, closing connection");
                    break;
                }
            }

            // Once the connection enters stream mode the forwarder owns
            // the codec's reader directly (spec §4.6); this loop must
            // stop issuing read_packet calls against it, and leave the
            // connection's scope alone until the bridge tears it down.
            if conn.is_stream_mode() {
                entered_stream_mode = true;
                break;
            }
        }

        if entered_stream_mode {
            let sessions = self.sessions.clone();
            let scope = conn.scope.clone();
            tokio::spawn(async move {
                scope.cancelled().await;
                sessions.remove(&conn_id).await;
            });
            return;
        }

        self.sessions.remove(&conn_id).await;
        info!(conn_id = %conn_id, "connection closed");
    }
}
