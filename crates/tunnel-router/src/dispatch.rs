//! The packet router (spec §4.3): a map from packet type to handler.
//! Holds no state beyond the handler table; every handler mutates state
//! exclusively through the session manager or its own collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use tunnel_proto::{Packet, PacketKind};
use tunnel_session::{Connection, ConnectionState};

use crate::error::RouterError;

#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, conn: &Arc<Connection>, packet: Packet) -> Result<(), RouterError>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Handled,
    Dropped,
    /// The connection sent something other than Handshake before
    /// authenticating; the caller must close it with a protocol error.
    ProtocolViolation,
}

#[derive(Default)]
pub struct PacketRouter {
    handlers: HashMap<PacketKind, Arc<dyn PacketHandler>>,
}

impl PacketRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: PacketKind, handler: Arc<dyn PacketHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Dispatches one packet. Unknown types on an authenticated
    /// connection are logged and dropped; on an unauthenticated
    /// connection, anything other than Handshake is a protocol error.
    pub async fn route(&self, conn: &Arc<Connection>, packet: Packet) -> Result<RouteOutcome, RouterError> {
        let kind = packet.kind();
        let authenticated = conn.state().await >= ConnectionState::Authenticated;

        if !authenticated && kind != PacketKind::Handshake {
            return Ok(RouteOutcome::ProtocolViolation);
        }

        match self.handlers.get(&kind) {
            Some(handler) => {
                handler.handle(conn, packet).await?;
                Ok(RouteOutcome::Handled)
            }
            None => {
                if authenticated {
                    warn!(conn_id = %conn.id, kind = ?kind, "no handler for packet type, dropping");
                    Ok(RouteOutcome::Dropped)
                } else {
                    debug!(conn_id = %conn.id, kind = ?kind, "unhandled packet type before authentication");
                    Ok(RouteOutcome::ProtocolViolation)
                }
            }
        }
    }
}
