//! Bridge ends held by interface, not by concrete connection type, so
//! the forwarder (§4.6/§4.7) runs one code path whether the bridge is
//! entirely local or spans two nodes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tunnel_cluster::{ClusterBroker, SubscriptionId};
use tunnel_session::Connection;

use crate::error::BridgeError;

#[async_trait]
pub trait BridgeEnd: Send + Sync {
    /// Reads up to `max_len` bytes. An empty result means the end is
    /// done (its peer observed EOF or was closed).
    async fn read_chunk(&self, max_len: usize) -> Result<Vec<u8>, BridgeError>;
    async fn write_chunk(&self, data: &[u8]) -> Result<(), BridgeError>;
    async fn close(&self);

    /// True for an end backed by a cross-node pipe rather than a
    /// physical connection on this node. The forwarder uses this to
    /// avoid re-applying the transform pipeline on a leg that already
    /// carries wire-shaped bytes produced by the other node.
    fn is_virtual(&self) -> bool {
        false
    }

    /// The id of the physical connection backing this end, if any. Used
    /// to find the bridge end a superseded connection held so reconnect
    /// can migrate it (spec §4.4 scenario 3).
    fn conn_id(&self) -> Option<&str> {
        None
    }
}

/// An end backed by a connection physically attached to this node, once
/// it has flipped into stream mode.
pub struct LocalEnd {
    conn: Arc<Connection>,
}

impl LocalEnd {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl BridgeEnd for LocalEnd {
    async fn read_chunk(&self, max_len: usize) -> Result<Vec<u8>, BridgeError> {
        Ok(self.conn.codec.read_some(max_len).await?)
    }

    async fn write_chunk(&self, data: &[u8]) -> Result<(), BridgeError> {
        self.conn.codec.write_exactly(data).await?;
        Ok(())
    }

    async fn close(&self) {
        self.conn.scope.cancel();
    }

    fn conn_id(&self) -> Option<&str> {
        Some(&self.conn.id)
    }
}

/// An end backed by a cross-node pipe: writes publish onto the broker,
/// reads drain a channel fed by a subscription on the inverse topic.
pub struct CrossNodeEnd {
    broker: Arc<dyn ClusterBroker>,
    write_topic: String,
    read_topic: String,
    subscription: SubscriptionId,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl CrossNodeEnd {
    pub async fn subscribe(broker: Arc<dyn ClusterBroker>, write_topic: String, read_topic: String) -> Result<Self, BridgeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = broker
            .subscribe(&read_topic, Arc::new(move |payload| {
                let _ = tx.send(payload);
            }))
            .await?;
        Ok(Self { broker, write_topic, read_topic, subscription, inbound: Mutex::new(rx) })
    }
}

#[async_trait]
impl BridgeEnd for CrossNodeEnd {
    async fn read_chunk(&self, _max_len: usize) -> Result<Vec<u8>, BridgeError> {
        let mut inbound = self.inbound.lock().await;
        Ok(inbound.recv().await.unwrap_or_default())
    }

    async fn write_chunk(&self, data: &[u8]) -> Result<(), BridgeError> {
        self.broker.publish(&self.write_topic, data.to_vec()).await?;
        Ok(())
    }

    async fn close(&self) {
        let _ = self.broker.unsubscribe(&self.read_topic, self.subscription).await;
    }

    fn is_virtual(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_cluster::MemoryBroker;

    #[tokio::test]
    async fn cross_node_end_round_trips_through_the_broker() {
        let broker: Arc<dyn ClusterBroker> = Arc::new(MemoryBroker::new());
        let a = CrossNodeEnd::subscribe(broker.clone(), "a-to-b".to_string(), "b-to-a".to_string()).await.unwrap();
        let b = CrossNodeEnd::subscribe(broker.clone(), "b-to-a".to_string(), "a-to-b".to_string()).await.unwrap();

        a.write_chunk(b"hello").await.unwrap();
        let received = b.read_chunk(1024).await.unwrap();
        assert_eq!(received, b"hello");

        b.write_chunk(b"world").await.unwrap();
        let received = a.read_chunk(1024).await.unwrap();
        assert_eq!(received, b"world");
    }
}
