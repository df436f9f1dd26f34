//! CloudControl collaborator (spec §6): resolves clients and port mappings.
//! The core treats this purely as a trait — it does not know or care how
//! records are stored.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingProtocol {
    Tcp,
    Udp,
    Socks5,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingTransformConfig {
    pub enable_compression: bool,
    pub compression_level: u32,
    pub enable_encryption: bool,
    pub encryption_method: Option<String>,
    pub encryption_key: Option<String>,
    pub bandwidth_limit: Option<u64>,
}

/// Persistent record describing one tunnelable relationship between a
/// listen-client port and a target-client address. Immutable except for
/// `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: String,
    pub listen_client_id: String,
    pub target_client_id: String,
    pub protocol: MappingProtocol,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub secret_key: String,
    pub config: MappingTransformConfig,
    pub status: MappingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Active,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub auth_code: String,
    pub secret_key: String,
    pub status: ClientStatus,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PortMappingStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Error)]
pub enum CloudControlError {
    #[error("client not found: {0}")]
    ClientNotFound(String),
    #[error("mapping not found: {0}")]
    MappingNotFound(String),
}

#[async_trait]
pub trait CloudControl: Send + Sync {
    async fn get_client(&self, client_id: &str) -> Result<ClientRecord, CloudControlError>;
    async fn get_port_mapping(&self, id: &str) -> Result<PortMapping, CloudControlError>;
    async fn get_client_port_mappings(&self, client_id: &str) -> Result<Vec<PortMapping>, CloudControlError>;
    async fn update_port_mapping_stats(&self, id: &str, stats: PortMappingStats) -> Result<(), CloudControlError>;
}

/// In-memory `CloudControl`, used standalone and in tests; a persisted
/// implementation backing onto the relay database is an external
/// collaborator outside the core's scope.
#[derive(Default)]
pub struct MemoryCloudControl {
    clients: DashMap<String, ClientRecord>,
    mappings: DashMap<String, PortMapping>,
    stats: DashMap<String, PortMappingStats>,
}

impl MemoryCloudControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_client(&self, client: ClientRecord) {
        self.clients.insert(client.client_id.clone(), client);
    }

    pub fn insert_mapping(&self, mapping: PortMapping) {
        self.mappings.insert(mapping.id.clone(), mapping);
    }
}

#[async_trait]
impl CloudControl for MemoryCloudControl {
    async fn get_client(&self, client_id: &str) -> Result<ClientRecord, CloudControlError> {
        self.clients
            .get(client_id)
            .map(|c| c.clone())
            .ok_or_else(|| CloudControlError::ClientNotFound(client_id.to_string()))
    }

    async fn get_port_mapping(&self, id: &str) -> Result<PortMapping, CloudControlError> {
        self.mappings
            .get(id)
            .map(|m| m.clone())
            .ok_or_else(|| CloudControlError::MappingNotFound(id.to_string()))
    }

    async fn get_client_port_mappings(&self, client_id: &str) -> Result<Vec<PortMapping>, CloudControlError> {
        Ok(self
            .mappings
            .iter()
            .filter(|m| m.listen_client_id == client_id || m.target_client_id == client_id)
            .map(|m| m.clone())
            .collect())
    }

    async fn update_port_mapping_stats(&self, id: &str, stats: PortMappingStats) -> Result<(), CloudControlError> {
        self.stats.insert(id.to_string(), stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mapping(id: &str, listen: &str, target: &str) -> PortMapping {
        PortMapping {
            id: id.to_string(),
            listen_client_id: listen.to_string(),
            target_client_id: target.to_string(),
            protocol: MappingProtocol::Tcp,
            listen_port: 8080,
            target_host: "127.0.0.1".to_string(),
            target_port: 80,
            secret_key: "shh".to_string(),
            config: MappingTransformConfig::default(),
            status: MappingStatus::Active,
        }
    }

    #[tokio::test]
    async fn unknown_client_is_not_found() {
        let cc = MemoryCloudControl::new();
        assert!(matches!(cc.get_client("missing").await, Err(CloudControlError::ClientNotFound(_))));
    }

    #[tokio::test]
    async fn client_mappings_include_both_listen_and_target_roles() {
        let cc = MemoryCloudControl::new();
        cc.insert_mapping(sample_mapping("m1", "A", "B"));
        cc.insert_mapping(sample_mapping("m2", "C", "A"));
        cc.insert_mapping(sample_mapping("m3", "C", "D"));

        let mappings = cc.get_client_port_mappings("A").await.unwrap();
        let ids: Vec<_> = mappings.iter().map(|m| m.id.as_str()).collect();
        assert!(ids.contains(&"m1"));
        assert!(ids.contains(&"m2"));
        assert!(!ids.contains(&"m3"));
    }

    #[tokio::test]
    async fn stats_update_does_not_error_on_unknown_mapping() {
        let cc = MemoryCloudControl::new();
        cc.update_port_mapping_stats("ghost", PortMappingStats::default()).await.unwrap();
    }
}
