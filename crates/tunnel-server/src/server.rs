//! Composition root (spec §4, §6): wires every collaborator crate
//! together into a running node and owns its top-level lifecycle.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::time::Instant;
use tracing::{info, warn};
use tunnel_auth::JwtValidator;
use tunnel_bridge::{BridgeRegistry, TunnelOpenHandler};
use tunnel_cloud_control::{CloudControl, MemoryCloudControl};
use tunnel_cluster::{ClientLocationRegistry, ClusterBroker, MemoryBroker};
use tunnel_proto::PacketKind;
use tunnel_router::{HandshakeHandler, HeartbeatHandler, PacketRouter};
use tunnel_session::{Scope, SessionManager};
use tunnel_store::{KvStore, MemoryStore};
use tunnel_transport::TransportAdapter;
use tunnel_transport_tcp::TcpAdapter;

use crate::acceptor::ServerAcceptor;
use crate::config::{BrokerKind, ServerConfig};
use crate::error::ServerError;

/// A running node: the adapters it drives, the root cancellation scope
/// everything beneath it is spawned under, and the session manager
/// whose heartbeat sweep runs for the node's lifetime.
pub struct TunnelServer {
    root_scope: Scope,
    sessions: Arc<SessionManager>,
    adapters: Vec<Arc<dyn TransportAdapter>>,
    heartbeat_interval: StdDuration,
    cloud_control: Arc<MemoryCloudControl>,
}

impl TunnelServer {
    /// Builds a node with its own in-memory client/mapping directory,
    /// reachable afterwards via [`TunnelServer::cloud_control`] so an
    /// operator or test harness can seed clients and port mappings
    /// before traffic arrives.
    pub async fn build(config: &ServerConfig) -> Result<Self, ServerError> {
        let cloud_control = Arc::new(MemoryCloudControl::new());
        Self::build_with_cloud_control(config, cloud_control).await
    }

    pub async fn build_with_cloud_control(config: &ServerConfig, cloud_control: Arc<MemoryCloudControl>) -> Result<Self, ServerError> {
        config.validate()?;

        let root_scope = Scope::root();

        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let cloud_control_dyn: Arc<dyn CloudControl> = cloud_control.clone();
        let broker: Arc<dyn ClusterBroker> = match config.broker {
            BrokerKind::Memory => Arc::new(MemoryBroker::new()),
            #[cfg(feature = "redis-broker")]
            BrokerKind::Redis => {
                let url = config.redis_url.as_deref().expect("validated: redis_url required for redis broker");
                Arc::new(tunnel_cluster::RedisBroker::connect(url).await.map_err(|err| {
                    warn!(error = %err, "failed to connect to redis broker");
                    ServerError::NoListenersConfigured
                })?)
            }
            #[cfg(not(feature = "redis-broker"))]
            BrokerKind::Redis => unreachable!("rejected by ServerConfig::validate"),
        };

        let locations = Arc::new(ClientLocationRegistry::new(store.clone(), config.heartbeat_interval()));
        let sessions = Arc::new(SessionManager::new(root_scope.clone()).with_kick_grace_period(config.kick_grace_period()));
        let jwt = Arc::new(JwtValidator::new(&config.jwt_secret_bytes()?, config.jwt_issuer.clone()));
        let bridge_registry = Arc::new(BridgeRegistry::new());

        let mut router = PacketRouter::new();
        router.register(
            PacketKind::Handshake,
            Arc::new(HandshakeHandler::new(
                sessions.clone(),
                cloud_control_dyn.clone(),
                jwt,
                locations.clone(),
                bridge_registry.clone(),
                config.node_id.clone(),
            )),
        );
        router.register(PacketKind::Heartbeat, Arc::new(HeartbeatHandler::new(sessions.clone(), locations.clone(), config.node_id.clone())));

        let tunnel_open_handler = Arc::new(TunnelOpenHandler::new(
            bridge_registry,
            cloud_control_dyn,
            sessions.clone(),
            broker,
            locations,
            root_scope.clone(),
            config.node_id.clone(),
        ));
        tunnel_open_handler
            .install_broadcast_listener()
            .await
            .map_err(|_| ServerError::NoListenersConfigured)?;
        router.register(PacketKind::TunnelOpen, tunnel_open_handler);

        let router = Arc::new(router);
        let mut adapters: Vec<Arc<dyn TransportAdapter>> = Vec::new();
        if let Some(addr) = config.listen.tcp {
            adapters.push(Arc::new(TcpAdapter::new(addr)));
        }
        if adapters.is_empty() {
            return Err(ServerError::NoListenersConfigured);
        }

        let acceptor = Arc::new(ServerAcceptor::new(sessions.clone(), router));
        for adapter in &adapters {
            adapter.start(acceptor.clone()).await?;
            info!(protocol = adapter.protocol_name(), "transport adapter listening");
        }

        Ok(Self { root_scope, sessions, adapters, heartbeat_interval: config.heartbeat_interval(), cloud_control })
    }

    /// The node's in-memory client/mapping directory. Seed clients and
    /// port mappings through this before driving traffic at the node.
    pub fn cloud_control(&self) -> Arc<MemoryCloudControl> {
        self.cloud_control.clone()
    }

    pub fn root_scope(&self) -> Scope {
        self.root_scope.clone()
    }

    /// Spawns the periodic sweep that closes connections past the
    /// heartbeat deadline (spec §4.8), running until the root scope is
    /// cancelled.
    pub fn spawn_heartbeat_sweep(&self) {
        let sessions = self.sessions.clone();
        let scope = self.root_scope.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = scope.cancelled() => break,
                }
                for conn_id in sessions.expired_connections(Instant::now()).await {
                    warn!(conn_id = %conn_id, "heartbeat deadline exceeded, removing connection");
                    sessions.remove(&conn_id).await;
                }
            }
        });
    }

    /// Cancels the root scope (tearing down every connection, bridge,
    /// and forwarder spawned beneath it) and stops accepting new
    /// connections on every transport adapter.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.root_scope.cancel();
        for adapter in &self.adapters {
            let _ = adapter.stop().await;
        }
    }
}

/// Builds and runs a node until `ctrl_c`, then shuts down gracefully
/// (spec's A.5 ambient concern).
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let server = TunnelServer::build(&config).await?;
    server.spawn_heartbeat_sweep();

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}
