//! Server configuration (spec §6, A.3): the knobs the composition root
//! needs, loaded from a TOML file with a handful of environment
//! overrides layered on top for the values an operator is most likely
//! to want to set per-deployment without editing the file.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
    #[error("invalid JWT_SECRET_BASE64 environment override: {0}")]
    InvalidJwtSecretEnv(base64::DecodeError),
    #[error("jwt secret must be 32 bytes, got {0}")]
    JwtSecretWrongLength(usize),
    #[error("storage kind {0:?} has no backing implementation in this build")]
    UnsupportedStorageKind(StorageKind),
    #[error("broker kind redis was selected but this binary was not built with the `redis-broker` feature")]
    RedisBrokerNotCompiled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Memory,
    Redis,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Memory,
    Redis,
}

/// Per-protocol listen addresses (spec §6). Only `tcp` has a concrete
/// [`tunnel_transport::TransportAdapter`] in this workspace; the others
/// are accepted so a config file written against the full protocol set
/// parses cleanly, but are rejected at validation time until their
/// adapters exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenAddrs {
    pub tcp: Option<SocketAddr>,
    pub websocket: Option<SocketAddr>,
    pub quic: Option<SocketAddr>,
    pub udp: Option<SocketAddr>,
}

/// UDP fragment thresholds (spec §4.2), overridable for tuning; the
/// defaults are the constants the spec names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpFragmentConfig {
    pub max_fragment_size: usize,
    pub unfragmented_threshold: usize,
    pub retry_interval_ms: u64,
    pub max_retries: u32,
    pub group_ttl_secs: u64,
}

impl Default for UdpFragmentConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: 1400,
            unfragmented_threshold: 1200,
            retry_interval_ms: 100,
            max_retries: 5,
            group_ttl_secs: 30,
        }
    }
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_jwt_issuer() -> String {
    "tunnel-fabric".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_deadline_secs() -> u64 {
    90
}

fn default_kick_grace_period_secs() -> u64 {
    5
}

fn default_jwt_secret() -> String {
    // Base64 of 32 zero bytes. `validate` rejects this at startup unless
    // the operator overrides it via config or JWT_SECRET_BASE64 — a
    // loud failure beats a fleet of nodes silently sharing a null key.
    "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    pub storage: StorageKind,
    pub broker: BrokerKind,
    /// Required when `storage` or `broker` is `redis`/`hybrid`.
    pub redis_url: Option<String>,
    pub listen: ListenAddrs,
    /// Base64-encoded 32-byte HMAC secret. Overridable via the
    /// `JWT_SECRET_BASE64` environment variable so it need not live in
    /// the config file on disk.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret_base64: String,
    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_deadline_secs")]
    pub heartbeat_deadline_secs: u64,
    #[serde(default = "default_kick_grace_period_secs")]
    pub kick_grace_period_secs: u64,
    pub udp_fragment: UdpFragmentConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            storage: StorageKind::Memory,
            broker: BrokerKind::Memory,
            redis_url: None,
            listen: ListenAddrs { tcp: Some("0.0.0.0:7000".parse().unwrap()), ..Default::default() },
            jwt_secret_base64: default_jwt_secret(),
            jwt_issuer: default_jwt_issuer(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_deadline_secs: default_heartbeat_deadline_secs(),
            kick_grace_period_secs: default_kick_grace_period_secs(),
            udp_fragment: UdpFragmentConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads from a TOML file, then layers the `JWT_SECRET_BASE64` and
    /// `REDIS_URL` environment overrides on top when present.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        let mut config: ServerConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("JWT_SECRET_BASE64") {
            self.jwt_secret_base64 = secret;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis_url = Some(url);
        }
    }

    pub fn jwt_secret_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.jwt_secret_base64)
            .map_err(ConfigError::InvalidJwtSecretEnv)?;
        if bytes.len() != 32 {
            return Err(ConfigError::JwtSecretWrongLength(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_deadline(&self) -> Duration {
        Duration::from_secs(self.heartbeat_deadline_secs)
    }

    pub fn kick_grace_period(&self) -> Duration {
        Duration::from_secs(self.kick_grace_period_secs)
    }

    /// Rejects combinations this build cannot actually serve, rather
    /// than failing confusingly deep inside composition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.jwt_secret_bytes()?;
        if !matches!(self.storage, StorageKind::Memory) {
            return Err(ConfigError::UnsupportedStorageKind(self.storage));
        }
        if matches!(self.broker, BrokerKind::Redis) {
            #[cfg(not(feature = "redis-broker"))]
            return Err(ConfigError::RedisBrokerNotCompiled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_a_tcp_listener_and_memory_backends() {
        let config = ServerConfig::default();
        assert!(config.listen.tcp.is_some());
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.broker, BrokerKind::Memory);
    }

    #[test]
    fn default_jwt_secret_decodes_to_32_bytes() {
        let config = ServerConfig::default();
        assert_eq!(config.jwt_secret_bytes().unwrap().len(), 32);
    }

    #[test]
    fn loading_a_minimal_toml_file_fills_in_defaults() {
        let dir = std::env::temp_dir().join(format!("tunnel-server-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.toml");
        std::fs::write(&path, "storage = \"memory\"\nbroker = \"memory\"\n").unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.node_id, "node-1");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn redis_storage_is_rejected_by_validate() {
        let mut config = ServerConfig::default();
        config.storage = StorageKind::Redis;
        assert!(matches!(config.validate(), Err(ConfigError::UnsupportedStorageKind(_))));
    }

    #[test]
    fn env_override_replaces_the_configured_jwt_secret() {
        // SAFETY-equivalent: test-only env var, single-threaded test body.
        std::env::set_var("JWT_SECRET_BASE64", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAE=");
        let mut config = ServerConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("JWT_SECRET_BASE64");
        assert_eq!(config.jwt_secret_base64, "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAE=");
    }
}
