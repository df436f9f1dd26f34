//! Heartbeat handler (spec §4.8): refreshes last-heartbeat and the
//! ClientLocation TTL, and echoes a Heartbeat back.

use std::sync::Arc;

use async_trait::async_trait;
use tunnel_cluster::{ClientLocation, ClientLocationRegistry, ConnType};
use tunnel_proto::Packet;
use tunnel_session::{Connection, SessionManager};

use crate::dispatch::PacketHandler;
use crate::error::RouterError;

pub struct HeartbeatHandler {
    sessions: Arc<SessionManager>,
    locations: Arc<ClientLocationRegistry>,
    node_id: String,
}

impl HeartbeatHandler {
    pub fn new(sessions: Arc<SessionManager>, locations: Arc<ClientLocationRegistry>, node_id: String) -> Self {
        Self { sessions, locations, node_id }
    }
}

#[async_trait]
impl PacketHandler for HeartbeatHandler {
    async fn handle(&self, conn: &Arc<Connection>, _packet: Packet) -> Result<(), RouterError> {
        self.sessions.update_connection_heartbeat(&conn.id).await?;

        if let Some(client_id) = conn.client_id().await {
            self.locations
                .refresh(&ClientLocation {
                    client_id,
                    node_id: self.node_id.clone(),
                    conn_id: conn.id.clone(),
                    protocol: conn.protocol_name.clone(),
                    conn_type: if conn.is_stream_mode() { ConnType::Data } else { ConnType::Control },
                })
                .await?;
        }

        conn.codec.write_packet(&Packet::Heartbeat, false, 0).await?;
        Ok(())
    }
}
