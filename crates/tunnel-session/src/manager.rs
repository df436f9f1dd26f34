//! Session manager (spec §4.4): owns the connId -> Connection and
//! clientId -> ControlConnection indices and is the sole mutator of
//! both.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};
use tunnel_proto::FrameCodec;
use tunnel_transport::{BoxedReader, BoxedWriter};

use crate::connection::{Connection, ConnectionError};
use crate::scope::Scope;
use crate::state::ConnectionState;

pub const DEFAULT_KICK_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(90);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("unknown connection id {0}")]
    UnknownConnection(String),
    #[error("client id must be set before registering a control connection")]
    MissingClientId,
}

/// Outcome of registering a control connection: whether a prior
/// connection for the same clientId was superseded and must be kicked.
pub struct RegisterOutcome {
    pub superseded: Option<Arc<Connection>>,
}

pub struct SessionManager {
    by_conn_id: RwLock<HashMap<String, Arc<Connection>>>,
    control_by_client_id: RwLock<HashMap<String, Arc<Connection>>>,
    root_scope: Scope,
    kick_grace_period: Duration,
}

impl SessionManager {
    pub fn new(root_scope: Scope) -> Self {
        Self {
            by_conn_id: RwLock::new(HashMap::new()),
            control_by_client_id: RwLock::new(HashMap::new()),
            root_scope,
            kick_grace_period: DEFAULT_KICK_GRACE_PERIOD,
        }
    }

    pub fn with_kick_grace_period(mut self, period: Duration) -> Self {
        self.kick_grace_period = period;
        self
    }

    pub fn kick_grace_period(&self) -> Duration {
        self.kick_grace_period
    }

    /// createConnection: wraps an accepted transport in a Connection,
    /// indexed by a fresh connId, in state Initializing.
    pub async fn create_connection(
        &self,
        id: String,
        protocol_name: String,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Arc<Connection> {
        let conn_scope = self.root_scope.child();
        let codec = FrameCodec::new(reader, writer, conn_scope.token());
        let conn = Arc::new(Connection::new(id.clone(), protocol_name, codec, conn_scope));
        self.by_conn_id.write().await.insert(id, conn.clone());
        conn
    }

    pub async fn get(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.by_conn_id.read().await.get(conn_id).cloned()
    }

    pub async fn control_connection_for(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.control_by_client_id.read().await.get(client_id).cloned()
    }

    /// registerControlConnection (§4.4): asserts the connection has a
    /// clientId, atomically swaps it into the clientId index, and
    /// returns whichever connection it superseded so the caller can
    /// issue it a Disconnect and start the grace-period close timer.
    pub async fn register_control_connection(&self, conn: Arc<Connection>) -> Result<RegisterOutcome, SessionError> {
        let client_id = conn.client_id().await.ok_or(SessionError::MissingClientId)?;

        let mut index = self.control_by_client_id.write().await;
        let superseded = index.insert(client_id.clone(), conn.clone());
        drop(index);

        if let Some(old) = &superseded {
            warn!(client_id = %client_id, old_conn = %old.id, new_conn = %conn.id, "control connection superseded");
        }
        Ok(RegisterOutcome { superseded })
    }

    /// handleReconnect (§4.4): identical kicking behavior to
    /// `register_control_connection`. Bridge end migration for any
    /// in-flight tunnel is driven by the caller once it observes a
    /// `superseded` connection here together with `reconnect: true` —
    /// this crate has no notion of a bridge, so it cannot do the swap
    /// itself (see `tunnel_router::handshake::BridgeMigration`).
    pub async fn handle_reconnect(&self, conn: Arc<Connection>) -> Result<RegisterOutcome, SessionError> {
        self.register_control_connection(conn).await
    }

    pub async fn update_connection_heartbeat(&self, conn_id: &str) -> Result<(), SessionError> {
        let conn = self.get(conn_id).await.ok_or_else(|| SessionError::UnknownConnection(conn_id.to_string()))?;
        conn.touch_heartbeat().await;
        Ok(())
    }

    pub async fn update_connection_state(&self, conn_id: &str, new_state: ConnectionState) -> Result<(), SessionError> {
        let conn = self.get(conn_id).await.ok_or_else(|| SessionError::UnknownConnection(conn_id.to_string()))?;
        conn.transition(new_state).await?;
        Ok(())
    }

    /// Removes a connection from both indices (on close, or once a
    /// kicked connection's grace period elapses) and cancels its scope.
    pub async fn remove(&self, conn_id: &str) {
        let conn = self.by_conn_id.write().await.remove(conn_id);
        if let Some(conn) = conn {
            if let Some(client_id) = conn.client_id().await {
                let mut index = self.control_by_client_id.write().await;
                if index.get(&client_id).map(|c| c.id == conn.id).unwrap_or(false) {
                    index.remove(&client_id);
                }
            }
            conn.scope.cancel();
            info!(conn_id = %conn_id, "connection removed");
        }
    }

    /// Sweeps for connections whose last heartbeat is older than
    /// [`HEARTBEAT_DEADLINE`] (§4.8) and returns their ids so the caller
    /// can close them with "heartbeat timeout".
    pub async fn expired_connections(&self, now: Instant) -> Vec<String> {
        let index = self.by_conn_id.read().await;
        let mut expired = Vec::new();
        for (id, conn) in index.iter() {
            if now.saturating_duration_since(conn.last_heartbeat().await) >= HEARTBEAT_DEADLINE {
                expired.push(id.clone());
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, Duration as TokioDuration};
    use tunnel_transport::{BoxedReader, BoxedWriter};

    fn boxed_duplex() -> (BoxedReader, BoxedWriter) {
        let (a, _b) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(a);
        (Box::pin(reader), Box::pin(writer))
    }

    async fn authenticated_connection(manager: &SessionManager, conn_id: &str, client_id: &str) -> Arc<Connection> {
        let (reader, writer) = boxed_duplex();
        let conn = manager.create_connection(conn_id.to_string(), "tcp".to_string(), reader, writer).await;
        conn.transition(ConnectionState::Connected).await.unwrap();
        conn.transition(ConnectionState::Authenticated).await.unwrap();
        conn.set_client_id(client_id.to_string()).await;
        conn
    }

    #[tokio::test]
    async fn registering_first_control_connection_supersedes_nothing() {
        let manager = SessionManager::new(Scope::root());
        let conn = authenticated_connection(&manager, "c1", "alice").await;

        let outcome = manager.register_control_connection(conn).await.unwrap();
        assert!(outcome.superseded.is_none());
        assert!(manager.control_connection_for("alice").await.is_some());
    }

    #[tokio::test]
    async fn second_registration_kicks_the_first_and_is_the_only_one_indexed() {
        let manager = SessionManager::new(Scope::root());
        let conn1 = authenticated_connection(&manager, "c1", "alice").await;
        let conn2 = authenticated_connection(&manager, "c2", "alice").await;

        manager.register_control_connection(conn1.clone()).await.unwrap();
        let outcome = manager.register_control_connection(conn2.clone()).await.unwrap();

        let superseded = outcome.superseded.expect("first connection should be superseded");
        assert_eq!(superseded.id, "c1");

        let current = manager.control_connection_for("alice").await.unwrap();
        assert_eq!(current.id, "c2");
    }

    #[tokio::test]
    async fn registering_without_client_id_fails() {
        let manager = SessionManager::new(Scope::root());
        let (reader, writer) = boxed_duplex();
        let conn = manager.create_connection("c1".to_string(), "tcp".to_string(), reader, writer).await;

        assert!(matches!(manager.register_control_connection(conn).await, Err(SessionError::MissingClientId)));
    }

    #[tokio::test]
    async fn removing_a_superseded_connection_does_not_clobber_the_new_one() {
        let manager = SessionManager::new(Scope::root());
        let conn1 = authenticated_connection(&manager, "c1", "alice").await;
        let conn2 = authenticated_connection(&manager, "c2", "alice").await;

        manager.register_control_connection(conn1).await.unwrap();
        manager.register_control_connection(conn2).await.unwrap();

        manager.remove("c1").await;
        let current = manager.control_connection_for("alice").await.unwrap();
        assert_eq!(current.id, "c2");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_surfaces_after_deadline() {
        let manager = SessionManager::new(Scope::root());
        let conn = authenticated_connection(&manager, "c1", "alice").await;
        manager.update_connection_heartbeat("c1").await.unwrap();

        assert!(manager.expired_connections(Instant::now()).await.is_empty());

        time::advance(HEARTBEAT_DEADLINE + TokioDuration::from_secs(1)).await;
        let expired = manager.expired_connections(Instant::now()).await;
        assert_eq!(expired, vec!["c1".to_string()]);
        let _ = conn;
    }

    #[tokio::test]
    async fn cancelling_the_root_scope_cancels_every_connection_scope() {
        let root = Scope::root();
        let manager = SessionManager::new(root.clone());
        let conn = authenticated_connection(&manager, "c1", "alice").await;

        assert!(!conn.scope.is_cancelled());
        root.cancel();
        assert!(conn.scope.is_cancelled());
    }
}
