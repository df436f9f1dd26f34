//! The TunnelBridge entity (spec §3): created when one side's TunnelOpen
//! arrives, reaches Connected once both ends are set, at which point the
//! forwarder begins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tunnel_cloud_control::MappingTransformConfig;
use tunnel_session::Scope;

use crate::end::BridgeEnd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    WaitingTarget,
    WaitingSource,
    Connected,
    Closing,
}

pub struct TunnelBridge {
    pub tunnel_id: String,
    pub mapping_id: String,
    pub config: MappingTransformConfig,
    pub created_at: DateTime<Utc>,
    /// Child of the scope passed at construction (spec §5: connection ->
    /// bridge -> forwarder direction). The forwarder derives its
    /// cancellation token from this rather than taking one separately.
    pub scope: Scope,
    source_end: Mutex<Option<Arc<dyn BridgeEnd>>>,
    target_end: Mutex<Option<Arc<dyn BridgeEnd>>>,
    state: RwLock<BridgeState>,
}

impl TunnelBridge {
    pub fn new(tunnel_id: String, mapping_id: String, config: MappingTransformConfig, initial_state: BridgeState, parent_scope: &Scope) -> Self {
        Self {
            tunnel_id,
            mapping_id,
            config,
            created_at: Utc::now(),
            scope: parent_scope.child(),
            source_end: Mutex::new(None),
            target_end: Mutex::new(None),
            state: RwLock::new(initial_state),
        }
    }

    pub async fn state(&self) -> BridgeState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: BridgeState) {
        *self.state.write().await = state;
    }

    /// Sets the source end. If the target end is already set, flips the
    /// bridge to Connected and returns both ends for the caller to start
    /// forwarding.
    pub async fn set_source_end(&self, end: Arc<dyn BridgeEnd>) -> Option<(Arc<dyn BridgeEnd>, Arc<dyn BridgeEnd>)> {
        *self.source_end.lock().await = Some(end.clone());
        self.try_connect(end, true).await
    }

    pub async fn set_target_end(&self, end: Arc<dyn BridgeEnd>) -> Option<(Arc<dyn BridgeEnd>, Arc<dyn BridgeEnd>)> {
        *self.target_end.lock().await = Some(end.clone());
        self.try_connect(end, false).await
    }

    async fn try_connect(&self, just_set: Arc<dyn BridgeEnd>, was_source: bool) -> Option<(Arc<dyn BridgeEnd>, Arc<dyn BridgeEnd>)> {
        let other = if was_source { self.target_end.lock().await.clone() } else { self.source_end.lock().await.clone() };
        let other = other?;
        self.set_state(BridgeState::Connected).await;
        if was_source {
            Some((just_set, other))
        } else {
            Some((other, just_set))
        }
    }

    pub async fn ends(&self) -> (Option<Arc<dyn BridgeEnd>>, Option<Arc<dyn BridgeEnd>>) {
        (self.source_end.lock().await.clone(), self.target_end.lock().await.clone())
    }

    /// Re-points whichever end is bound to `old_conn_id` onto `new_end`
    /// (spec §4.4 scenario 3: reconnect migration). A no-op if neither
    /// end is bound to that connection.
    pub async fn migrate_end(&self, old_conn_id: &str, new_end: Arc<dyn BridgeEnd>) {
        let mut source = self.source_end.lock().await;
        if source.as_deref().and_then(BridgeEnd::conn_id) == Some(old_conn_id) {
            *source = Some(new_end);
            return;
        }
        drop(source);

        let mut target = self.target_end.lock().await;
        if target.as_deref().and_then(BridgeEnd::conn_id) == Some(old_conn_id) {
            *target = Some(new_end);
        }
    }

    pub async fn close(&self) {
        self.set_state(BridgeState::Closing).await;
        self.scope.cancel();
        if let Some(end) = self.source_end.lock().await.take() {
            end.close().await;
        }
        if let Some(end) = self.target_end.lock().await.take() {
            end.close().await;
        }
    }
}
