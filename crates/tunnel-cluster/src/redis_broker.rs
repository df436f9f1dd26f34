//! Redis-backed `ClusterBroker`, the multi-node backplane for cross-node
//! TunnelOpen broadcasts and data pipes. Built on the async connection
//! manager so reconnects are handled transparently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{error, warn};

use crate::broker::{ClusterBroker, ClusterError, MessageHandler, SubscriptionId};

pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    subscriptions: DashMap<String, Vec<(u64, MessageHandler)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> Result<Self, ClusterError> {
        let client = redis::Client::open(redis_url).map_err(|e| ClusterError::PublishFailed(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ClusterError::PublishFailed(e.to_string()))?;
        Ok(Self {
            client,
            conn,
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Spawns the background task that owns the dedicated pubsub
    /// connection and fans incoming messages out to registered handlers.
    /// Called once per topic the first time it is subscribed.
    fn spawn_listener(&self, topic: String) {
        let client = self.client.clone();
        let subscriptions = self.subscriptions.clone();
        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(p) => p,
                Err(err) => {
                    error!(%err, topic = %topic, "failed to open redis pubsub connection");
                    return;
                }
            };
            if let Err(err) = pubsub.subscribe(&topic).await {
                error!(%err, topic = %topic, "failed to subscribe to redis topic");
                return;
            }
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(%err, "failed to decode redis message payload");
                        continue;
                    }
                };
                if let Some(handlers) = subscriptions.get(&topic) {
                    for (_, handler) in handlers.iter() {
                        handler(payload.clone());
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ClusterBroker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ClusterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Closed);
        }
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(topic, payload)
            .await
            .map_err(|e| ClusterError::PublishFailed(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId, ClusterError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let is_first = !self.subscriptions.contains_key(topic);
        self.subscriptions.entry(topic.to_string()).or_default().push((id, handler));
        if is_first {
            self.spawn_listener(topic.to_string());
        }
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe(&self, topic: &str, subscription: SubscriptionId) -> Result<(), ClusterError> {
        if let Some(mut handlers) = self.subscriptions.get_mut(topic) {
            handlers.retain(|(id, _)| *id != subscription.0);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ClusterError> {
        self.closed.store(true, Ordering::Release);
        self.subscriptions.clear();
        Ok(())
    }
}
