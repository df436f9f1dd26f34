//! ClientLocation registry (spec §3): a TTL'd map of clientId to
//! (nodeId, connId, protocol), authoritative for cross-node routing,
//! backed by the key/value store collaborator.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tunnel_store::KvStore;

use crate::broker::ClusterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnType {
    Control,
    Data,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientLocation {
    pub client_id: String,
    pub node_id: String,
    pub conn_id: String,
    pub protocol: String,
    pub conn_type: ConnType,
}

fn location_key(client_id: &str) -> String {
    format!("client_location:{client_id}")
}

/// Wraps a `KvStore` with the TTL = 3 × heartbeat-interval policy spec §3
/// mandates for ClientLocation entries.
pub struct ClientLocationRegistry {
    store: Arc<dyn KvStore>,
    heartbeat_interval: Duration,
}

impl ClientLocationRegistry {
    pub fn new(store: Arc<dyn KvStore>, heartbeat_interval: Duration) -> Self {
        Self { store, heartbeat_interval }
    }

    fn ttl(&self) -> Duration {
        self.heartbeat_interval * 3
    }

    /// Refreshes (or creates) the location entry, resetting its TTL. Called
    /// on authentication and on every heartbeat (spec §4.4, §4.8).
    pub async fn refresh(&self, location: &ClientLocation) -> Result<(), ClusterError> {
        let bytes = serde_json::to_vec(location)?;
        self.store.set(&location_key(&location.client_id), bytes, Some(self.ttl())).await?;
        Ok(())
    }

    pub async fn lookup(&self, client_id: &str) -> Result<Option<ClientLocation>, ClusterError> {
        match self.store.get(&location_key(client_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, client_id: &str) -> Result<(), ClusterError> {
        self.store.delete(&location_key(client_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_store::MemoryStore;

    fn sample(client_id: &str, node_id: &str) -> ClientLocation {
        ClientLocation {
            client_id: client_id.to_string(),
            node_id: node_id.to_string(),
            conn_id: "conn-1".to_string(),
            protocol: "tcp".to_string(),
            conn_type: ConnType::Control,
        }
    }

    #[tokio::test]
    async fn refresh_then_lookup_round_trips() {
        let registry = ClientLocationRegistry::new(Arc::new(MemoryStore::new()), Duration::from_secs(30));
        registry.refresh(&sample("A", "N1")).await.unwrap();
        let found = registry.lookup("A").await.unwrap().unwrap();
        assert_eq!(found.node_id, "N1");
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_three_heartbeat_intervals() {
        let registry = ClientLocationRegistry::new(Arc::new(MemoryStore::new()), Duration::from_secs(30));
        registry.refresh(&sample("A", "N1")).await.unwrap();
        assert!(registry.lookup("A").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(91)).await;
        assert!(registry.lookup("A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_clears_the_entry() {
        let registry = ClientLocationRegistry::new(Arc::new(MemoryStore::new()), Duration::from_secs(30));
        registry.refresh(&sample("A", "N1")).await.unwrap();
        registry.remove("A").await.unwrap();
        assert!(registry.lookup("A").await.unwrap().is_none());
    }
}
