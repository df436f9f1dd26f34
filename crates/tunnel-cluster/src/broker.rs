//! Publish/subscribe broker abstraction (spec §6), used for cross-node
//! TunnelOpen broadcasts and cross-node data pipes — one topic per
//! (tunnelId, direction) pair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("broker closed")]
    Closed,
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] tunnel_store::StoreError),
}

#[async_trait]
pub trait ClusterBroker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ClusterError>;
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId, ClusterError>;
    async fn unsubscribe(&self, topic: &str, subscription: SubscriptionId) -> Result<(), ClusterError>;
    async fn close(&self) -> Result<(), ClusterError>;
}

/// In-memory broker: delivers published messages to every handler
/// currently subscribed on that topic, in this process only. Used for
/// single-node deployments and tests; `RedisBroker` is the multi-node
/// backplane.
#[derive(Default)]
pub struct MemoryBroker {
    topics: DashMap<String, Vec<(u64, MessageHandler)>>,
    next_id: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterBroker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ClusterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Closed);
        }
        if let Some(subscribers) = self.topics.get(topic) {
            for (_, handler) in subscribers.iter() {
                handler(payload.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId, ClusterError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics.entry(topic.to_string()).or_default().push((id, handler));
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe(&self, topic: &str, subscription: SubscriptionId) -> Result<(), ClusterError> {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|(id, _)| *id != subscription.0);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ClusterError> {
        self.closed.store(true, Ordering::Release);
        self.topics.clear();
        Ok(())
    }
}
