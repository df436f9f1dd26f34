//! Authentication and config push (spec §4.5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tracing::{info, warn};
use tunnel_auth::{credentials_match, JwtValidator};
use tunnel_cloud_control::{CloudControl, ClientStatus};
use tunnel_cluster::{ClientLocation, ClientLocationRegistry, ConnType};
use tunnel_proto::{
    CommandPacket, CommandType, ConnectionType, HandshakePayload, HandshakeRespPayload, Packet,
};
use tunnel_session::{Connection, ConnectionState, SessionManager};

use crate::dispatch::PacketHandler;
use crate::error::RouterError;

pub const SESSION_TOKEN_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// Migrates any in-flight bridge end bound to a superseded connection
/// onto the connection that replaced it (spec §4.4 scenario 3). The
/// bridge registry lives in the crate above this one in the dependency
/// graph, so `HandshakeHandler` reaches it through this trait rather
/// than a direct dependency.
#[async_trait]
pub trait BridgeMigration: Send + Sync {
    async fn migrate(&self, old_conn_id: &str, new_conn: Arc<Connection>);
}

pub struct HandshakeHandler {
    sessions: Arc<SessionManager>,
    cloud_control: Arc<dyn CloudControl>,
    jwt: Arc<JwtValidator>,
    locations: Arc<ClientLocationRegistry>,
    bridge_migration: Arc<dyn BridgeMigration>,
    node_id: String,
}

impl HandshakeHandler {
    pub fn new(
        sessions: Arc<SessionManager>,
        cloud_control: Arc<dyn CloudControl>,
        jwt: Arc<JwtValidator>,
        locations: Arc<ClientLocationRegistry>,
        bridge_migration: Arc<dyn BridgeMigration>,
        node_id: String,
    ) -> Self {
        Self { sessions, cloud_control, jwt, locations, bridge_migration, node_id }
    }

    async fn respond(&self, conn: &Arc<Connection>, resp: HandshakeRespPayload) -> Result<(), RouterError> {
        conn.codec.write_packet(&Packet::HandshakeResp(resp), false, 0).await?;
        Ok(())
    }

    /// Pushes a ConfigSet command listing every mapping for which this
    /// client is either the listen or target end. Empty sets are not
    /// pushed.
    async fn push_config(&self, conn: &Arc<Connection>, client_id: &str) -> Result<(), RouterError> {
        let mappings = self.cloud_control.get_client_port_mappings(client_id).await?;
        if mappings.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "mappings": mappings });
        let command = CommandPacket {
            command_type: CommandType::ConfigSet,
            command_id: format!("cfg-{client_id}-{}", chrono::Utc::now().timestamp_millis()),
            token: None,
            sender_id: self.node_id.clone(),
            receiver_id: client_id.to_string(),
            body,
        };
        conn.codec.write_packet(&Packet::JsonCommand(command), false, 0).await?;
        Ok(())
    }
}

#[async_trait]
impl PacketHandler for HandshakeHandler {
    async fn handle(&self, conn: &Arc<Connection>, packet: Packet) -> Result<(), RouterError> {
        let Packet::Handshake(payload) = packet else {
            return Err(RouterError::Protocol("handshake handler received a non-handshake packet".into()));
        };
        let HandshakePayload { client_id, auth_code, secret_key, connection_type, reconnect, .. } = payload;

        if connection_type != ConnectionType::Control {
            // Tunnel-side connections authenticate via the secretKey carried
            // in their TunnelOpen packet, not via client credentials here;
            // just record the claimed clientId and clear the authentication
            // gate so the router admits the TunnelOpen that follows.
            conn.transition(ConnectionState::Connected).await.ok();
            conn.transition(ConnectionState::Authenticated).await?;
            conn.set_client_id(client_id).await;
            return Ok(());
        }

        let client = match self.cloud_control.get_client(&client_id).await {
            Ok(client) => client,
            Err(_) => {
                warn!(client_id = %client_id, "handshake for unknown client");
                return self
                    .respond(conn, failure(&client_id, "CLIENT_NOT_FOUND", "client not found"))
                    .await;
            }
        };

        if client.status == ClientStatus::Blocked {
            return self.respond(conn, failure(&client_id, "CLIENT_BLOCKED", "client is blocked")).await;
        }

        if !credentials_match(&auth_code, &client.auth_code) || !credentials_match(&secret_key, &client.secret_key) {
            return self.respond(conn, failure(&client_id, "BAD_CREDENTIALS", "auth_code or secret_key mismatch")).await;
        }

        let (token, expires_at) = self.jwt.issue(&client_id, ChronoDuration::from_std(SESSION_TOKEN_VALIDITY).unwrap())?;

        conn.transition(ConnectionState::Connected).await.ok();
        conn.transition(ConnectionState::Authenticated).await?;
        conn.set_client_id(client_id.clone()).await;

        let outcome = if reconnect {
            self.sessions.handle_reconnect(conn.clone()).await?
        } else {
            self.sessions.register_control_connection(conn.clone()).await?
        };
        if let Some(superseded) = outcome.superseded {
            if reconnect {
                self.bridge_migration.migrate(&superseded.id, conn.clone()).await;
            }
            let _ = superseded
                .codec
                .write_packet(
                    &Packet::JsonCommand(CommandPacket {
                        command_type: CommandType::Disconnect,
                        command_id: format!("kick-{client_id}"),
                        token: None,
                        sender_id: self.node_id.clone(),
                        receiver_id: client_id.clone(),
                        body: serde_json::json!({ "reason": "superseded" }),
                    }),
                    false,
                    0,
                )
                .await;
            let sessions = self.sessions.clone();
            let grace = self.sessions.kick_grace_period();
            let superseded_id = superseded.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                sessions.remove(&superseded_id).await;
            });
        }

        self.locations
            .refresh(&ClientLocation {
                client_id: client_id.clone(),
                node_id: self.node_id.clone(),
                conn_id: conn.id.clone(),
                protocol: conn.protocol_name.clone(),
                conn_type: ConnType::Control,
            })
            .await?;

        self.respond(
            conn,
            HandshakeRespPayload {
                success: true,
                client_id: client_id.clone(),
                token: Some(token),
                expires_at: Some(expires_at),
                error: None,
            },
        )
        .await?;

        info!(client_id = %client_id, conn_id = %conn.id, "control connection authenticated");
        self.push_config(conn, &client_id).await
    }
}

fn failure(client_id: &str, code: &str, message: &str) -> HandshakeRespPayload {
    HandshakeRespPayload {
        success: false,
        client_id: client_id.to_string(),
        token: None,
        expires_at: None,
        error: Some(format!("{code}: {message}")),
    }
}
