//! The Connection entity (spec §3): one physical transport paired with
//! its frame codec, tracked through the state machine in [`crate::state`].

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tunnel_proto::FrameCodec;
use tunnel_transport::{BoxedReader, BoxedWriter};

use crate::scope::Scope;
use crate::state::{ConnectionState, StateError};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("connection already left non-stream mode")]
    AlreadyStreamMode,
}

/// One physical connection accepted by a transport adapter. Owns its
/// frame codec exclusively; nothing outside this type writes to the
/// underlying transport.
pub struct Connection {
    pub id: String,
    pub protocol_name: String,
    pub codec: FrameCodec<BoxedReader, BoxedWriter>,
    pub created_at: DateTime<Utc>,
    pub scope: Scope,
    state: RwLock<ConnectionState>,
    client_id: RwLock<Option<String>>,
    last_heartbeat: RwLock<Instant>,
    stream_mode: AtomicBool,
}

impl Connection {
    pub fn new(id: String, protocol_name: String, codec: FrameCodec<BoxedReader, BoxedWriter>, scope: Scope) -> Self {
        Self {
            id,
            protocol_name,
            codec,
            created_at: Utc::now(),
            scope,
            state: RwLock::new(ConnectionState::Initializing),
            client_id: RwLock::new(None),
            last_heartbeat: RwLock::new(Instant::now()),
            stream_mode: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Validates and applies a state transition per §4.4.
    pub async fn transition(&self, to: ConnectionState) -> Result<(), ConnectionError> {
        let mut state = self.state.write().await;
        state.validate_transition(to)?;
        *state = to;
        Ok(())
    }

    pub async fn client_id(&self) -> Option<String> {
        self.client_id.read().await.clone()
    }

    pub async fn set_client_id(&self, client_id: String) {
        *self.client_id.write().await = Some(client_id);
    }

    pub async fn touch_heartbeat(&self) {
        *self.last_heartbeat.write().await = Instant::now();
    }

    pub async fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.read().await
    }

    pub fn is_stream_mode(&self) -> bool {
        self.stream_mode.load(Ordering::Acquire)
    }

    /// Flips the connection into stream mode. A connection may do this at
    /// most once; a second call is a programmer error, surfaced as
    /// [`ConnectionError::AlreadyStreamMode`].
    pub fn enter_stream_mode(&self) -> Result<(), ConnectionError> {
        match self.stream_mode.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(_) => Err(ConnectionError::AlreadyStreamMode),
        }
    }
}
