//! TunnelOpen handler (spec §4.6/§4.7): creates or attaches a bridge for
//! an incoming tunnel connection, same-node or cross-node.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use tunnel_auth::credentials_match;
use tunnel_cloud_control::{CloudControl, PortMapping};
use tunnel_cluster::{tunnel_close_topic, tunnel_data_topic, tunnel_open_topic, BroadcastTunnelOpen, ClientLocationRegistry, ClusterBroker, CrossNodeTunnelClose, Direction as DataDirection};
use tunnel_proto::{CommandPacket, CommandType, Packet, TunnelOpenAckPayload, TunnelOpenPayload};
use tunnel_router::{PacketHandler, RouterError};
use tunnel_session::{Connection, Scope, SessionManager};

use crate::bridge::{BridgeState, TunnelBridge};
use crate::end::{CrossNodeEnd, LocalEnd};
use crate::forwarder::forward;
use crate::registry::BridgeRegistry;

/// Backoff schedule for a failed cross-node BroadcastTunnelOpen publish
/// (spec §4.7): one retry at each delay before giving up.
const CROSS_NODE_BACKOFF: [Duration; 3] = [Duration::from_millis(100), Duration::from_millis(400), Duration::from_secs(1)];

pub struct TunnelOpenHandler {
    registry: Arc<BridgeRegistry>,
    cloud_control: Arc<dyn CloudControl>,
    sessions: Arc<SessionManager>,
    broker: Arc<dyn ClusterBroker>,
    locations: Arc<ClientLocationRegistry>,
    root_scope: Scope,
    node_id: String,
}

impl TunnelOpenHandler {
    pub fn new(
        registry: Arc<BridgeRegistry>,
        cloud_control: Arc<dyn CloudControl>,
        sessions: Arc<SessionManager>,
        broker: Arc<dyn ClusterBroker>,
        locations: Arc<ClientLocationRegistry>,
        root_scope: Scope,
        node_id: String,
    ) -> Self {
        Self { registry, cloud_control, sessions, broker, locations, root_scope, node_id }
    }

    async fn ack(&self, conn: &Arc<Connection>, success: bool, error: Option<String>) -> Result<(), RouterError> {
        conn.codec.write_packet(&Packet::TunnelOpenAck(TunnelOpenAckPayload { success, error }), false, 0).await?;
        Ok(())
    }

    async fn resolve_mapping(&self, conn: &Arc<Connection>, payload: &TunnelOpenPayload) -> Result<Option<PortMapping>, RouterError> {
        let mapping = match self.cloud_control.get_port_mapping(&payload.mapping_id).await {
            Ok(mapping) => mapping,
            Err(err) => {
                self.ack(conn, false, Some(format!("MAPPING_NOT_FOUND: {err}"))).await?;
                return Ok(None);
            }
        };
        if !credentials_match(&payload.secret_key, &mapping.secret_key) {
            self.ack(conn, false, Some("BAD_CREDENTIALS: secret_key mismatch".to_string())).await?;
            return Ok(None);
        }
        Ok(Some(mapping))
    }

    /// Publishes a `BroadcastTunnelOpen` on the target node's open topic,
    /// retrying with backoff before surfacing a failure (spec §4.7).
    async fn publish_broadcast(&self, topic: &str, payload: &BroadcastTunnelOpen) -> bool {
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to serialize BroadcastTunnelOpen");
                return false;
            }
        };
        if self.broker.publish(topic, bytes.clone()).await.is_ok() {
            return true;
        }
        for delay in CROSS_NODE_BACKOFF {
            tokio::time::sleep(delay).await;
            if self.broker.publish(topic, bytes.clone()).await.is_ok() {
                return true;
            }
        }
        false
    }

    /// Notifies the target client's control connection to open its own
    /// tunnel connection for `tunnel_id`/`mapping_id`.
    async fn send_open_request(&self, target_conn: &Arc<Connection>, mapping: &PortMapping, tunnel_id: &str) -> Result<(), RouterError> {
        let command = CommandPacket {
            command_type: CommandType::TunnelOpenRequest,
            command_id: format!("open-{tunnel_id}"),
            token: None,
            sender_id: self.node_id.clone(),
            receiver_id: mapping.target_client_id.clone(),
            body: serde_json::json!({
                "tunnel_id": tunnel_id,
                "mapping_id": mapping.id,
                "target_host": mapping.target_host,
                "target_port": mapping.target_port,
            }),
        };
        target_conn.codec.write_packet(&Packet::JsonCommand(command), false, 0).await?;
        Ok(())
    }

    /// Wires a cross-node bridge's close propagation both ways (spec
    /// §4.7's mid-tunnel disconnect case): subscribes this node's half of
    /// `tunnel_id`'s close topic so a `CrossNodeTunnelClose` from the peer
    /// tears down the local bridge, and arranges for this node to publish
    /// one the moment its own half closes first.
    async fn link_cross_node_close(&self, bridge: &Arc<TunnelBridge>) -> Result<(), RouterError> {
        let tunnel_id = bridge.tunnel_id.clone();
        let registry = self.registry.clone();
        let topic = tunnel_close_topic(&tunnel_id);
        self.broker
            .subscribe(&topic, Arc::new(move |payload| {
                let registry = registry.clone();
                let tunnel_id = tunnel_id.clone();
                tokio::spawn(async move {
                    if serde_json::from_slice::<CrossNodeTunnelClose>(&payload).is_ok() {
                        if let Some(bridge) = registry.remove(&tunnel_id) {
                            bridge.close().await;
                        }
                    }
                });
            }))
            .await?;

        let tunnel_id = bridge.tunnel_id.clone();
        let broker = self.broker.clone();
        let bridge_scope = bridge.scope.clone();
        tokio::spawn(async move {
            bridge_scope.cancelled().await;
            let notice = CrossNodeTunnelClose { tunnel_id: tunnel_id.clone(), reason: "bridge closed".to_string() };
            if let Ok(bytes) = serde_json::to_vec(&notice) {
                let _ = broker.publish(&tunnel_close_topic(&tunnel_id), bytes).await;
            }
        });
        Ok(())
    }

    /// Routes to the target client through the cluster broker when it is
    /// not locally attached: looks up its node, publishes a broadcast,
    /// and wires this bridge's target end as a cross-node pipe.
    async fn route_cross_node(&self, mapping: &PortMapping, tunnel_id: &str, bridge: &Arc<TunnelBridge>) {
        let location = match self.locations.lookup(&mapping.target_client_id).await {
            Ok(Some(location)) => location,
            Ok(None) => {
                warn!(tunnel_id = %tunnel_id, target = %mapping.target_client_id, "target client location unknown");
                bridge.close().await;
                self.registry.remove(tunnel_id);
                return;
            }
            Err(err) => {
                warn!(tunnel_id = %tunnel_id, error = %err, "client location lookup failed");
                bridge.close().await;
                self.registry.remove(tunnel_id);
                return;
            }
        };

        let write_topic = tunnel_data_topic(tunnel_id, DataDirection::SourceToTarget);
        let read_topic = tunnel_data_topic(tunnel_id, DataDirection::TargetToSource);
        let cross_end = match CrossNodeEnd::subscribe(self.broker.clone(), write_topic, read_topic).await {
            Ok(end) => Arc::new(end),
            Err(err) => {
                warn!(tunnel_id = %tunnel_id, error = %err, "failed to subscribe cross-node data pipe");
                bridge.close().await;
                self.registry.remove(tunnel_id);
                return;
            }
        };
        if let Err(err) = self.link_cross_node_close(bridge).await {
            warn!(tunnel_id = %tunnel_id, error = %err, "failed to link cross-node close propagation");
        }
        if let Some((source, target)) = bridge.set_target_end(cross_end).await {
            tokio::spawn(forward(bridge.clone(), source, target));
        }

        let broadcast = BroadcastTunnelOpen {
            tunnel_id: tunnel_id.to_string(),
            mapping_id: mapping.id.clone(),
            target_client_id: mapping.target_client_id.clone(),
            origin_node_id: self.node_id.clone(),
        };
        if !self.publish_broadcast(&tunnel_open_topic(&location.node_id), &broadcast).await {
            warn!(tunnel_id = %tunnel_id, "cross-node broadcast unreachable after retries");
            bridge.close().await;
            self.registry.remove(tunnel_id);
        }
    }

    /// Handles a `BroadcastTunnelOpen` received on this node's own open
    /// topic: installs the mirrored half of the cross-node bridge and
    /// asks the locally-attached target client to dial in.
    pub async fn handle_broadcast(&self, broadcast: BroadcastTunnelOpen) {
        let mapping = match self.cloud_control.get_port_mapping(&broadcast.mapping_id).await {
            Ok(mapping) => mapping,
            Err(err) => {
                warn!(mapping_id = %broadcast.mapping_id, error = %err, "broadcast for unknown mapping");
                return;
            }
        };

        let entry = self.registry.get_or_create(&broadcast.tunnel_id, &broadcast.mapping_id, mapping.config.clone(), BridgeState::WaitingSource, &self.root_scope);

        // The topics are named from the originator's point of view; this
        // node reads what the originator wrote and writes what it reads.
        let read_topic = tunnel_data_topic(&broadcast.tunnel_id, DataDirection::SourceToTarget);
        let write_topic = tunnel_data_topic(&broadcast.tunnel_id, DataDirection::TargetToSource);
        let cross_end = match CrossNodeEnd::subscribe(self.broker.clone(), write_topic, read_topic).await {
            Ok(end) => Arc::new(end),
            Err(err) => {
                warn!(tunnel_id = %broadcast.tunnel_id, error = %err, "failed to subscribe mirrored cross-node data pipe");
                return;
            }
        };
        if let Err(err) = self.link_cross_node_close(&entry.bridge).await {
            warn!(tunnel_id = %broadcast.tunnel_id, error = %err, "failed to link cross-node close propagation");
        }
        if let Some((source, target)) = entry.bridge.set_source_end(cross_end).await {
            tokio::spawn(forward(entry.bridge.clone(), source, target));
        }

        let Some(target_conn) = self.sessions.control_connection_for(&mapping.target_client_id).await else {
            warn!(tunnel_id = %broadcast.tunnel_id, target = %mapping.target_client_id, "broadcast target not locally attached");
            return;
        };
        if let Err(err) = self.send_open_request(&target_conn, &mapping, &broadcast.tunnel_id).await {
            warn!(tunnel_id = %broadcast.tunnel_id, error = %err, "failed to request target client open its tunnel");
        }
    }

    /// Subscribes this node's `tunnel_open_topic`, spawning
    /// [`handle_broadcast`] for every message received. Call once at
    /// startup after the cloud control and location collaborators are
    /// ready.
    pub async fn install_broadcast_listener(self: &Arc<Self>) -> Result<(), RouterError> {
        let handler = self.clone();
        self.broker
            .subscribe(&tunnel_open_topic(&self.node_id), Arc::new(move |payload| {
                let handler = handler.clone();
                tokio::spawn(async move {
                    match serde_json::from_slice::<BroadcastTunnelOpen>(&payload) {
                        Ok(broadcast) => handler.handle_broadcast(broadcast).await,
                        Err(err) => warn!(error = %err, "malformed BroadcastTunnelOpen"),
                    }
                });
            }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PacketHandler for TunnelOpenHandler {
    async fn handle(&self, conn: &Arc<Connection>, packet: Packet) -> Result<(), RouterError> {
        let Packet::TunnelOpen(payload) = packet else {
            return Err(RouterError::Protocol("tunnel-open handler received a non-TunnelOpen packet".into()));
        };

        let Some(mapping) = self.resolve_mapping(conn, &payload).await? else {
            return Ok(());
        };

        let Some(client_id) = conn.client_id().await else {
            return self.ack(conn, false, Some("NOT_AUTHENTICATED: missing client id".to_string())).await;
        };
        let is_source = client_id == mapping.listen_client_id;
        let is_target = client_id == mapping.target_client_id;
        if !is_source && !is_target {
            return self.ack(conn, false, Some("NOT_AUTHORIZED: client does not own this mapping".to_string())).await;
        }

        conn.enter_stream_mode().map_err(|err| RouterError::Protocol(err.to_string()))?;
        let end = Arc::new(LocalEnd::new(conn.clone()));

        let initial_state = if is_source { BridgeState::WaitingTarget } else { BridgeState::WaitingSource };
        let entry = self.registry.get_or_create(&payload.tunnel_id, &mapping.id, mapping.config.clone(), initial_state, &self.root_scope);
        let bridge = entry.bridge;

        let connected = if is_source { bridge.set_source_end(end).await } else { bridge.set_target_end(end).await };

        self.ack(conn, true, None).await?;
        info!(tunnel_id = %payload.tunnel_id, client_id = %client_id, role = if is_source { "source" } else { "target" }, "tunnel end attached");

        if let Some((source, target)) = connected {
            tokio::spawn(forward(bridge, source, target));
            return Ok(());
        }

        // Only the source side is responsible for finding the target;
        // the target side just attached and waits to be connected.
        if is_source && entry.created {
            match self.sessions.control_connection_for(&mapping.target_client_id).await {
                Some(target_conn) => self.send_open_request(&target_conn, &mapping, &payload.tunnel_id).await?,
                None => self.route_cross_node(&mapping, &payload.tunnel_id, &bridge).await,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tunnel_cloud_control::{MappingProtocol, MappingStatus, MemoryCloudControl};
    use tunnel_proto::FrameCodec;
    use tunnel_store::MemoryStore;
    use tunnel_transport::{BoxedReader, BoxedWriter};

    fn tunnel_connection(id: &str) -> (Arc<Connection>, DuplexStream) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(near);
        let scope = Scope::root();
        let codec = FrameCodec::new(Box::pin(reader) as BoxedReader, Box::pin(writer) as BoxedWriter, scope.token());
        let conn = Arc::new(Connection::new(id.to_string(), "tcp".to_string(), codec, scope));
        (conn, far)
    }

    async fn authenticated(id: &str, client_id: &str) -> (Arc<Connection>, DuplexStream) {
        let (conn, far) = tunnel_connection(id);
        conn.transition(tunnel_session::ConnectionState::Connected).await.unwrap();
        conn.transition(tunnel_session::ConnectionState::Authenticated).await.unwrap();
        conn.set_client_id(client_id.to_string()).await;
        (conn, far)
    }

    fn sample_mapping() -> PortMapping {
        PortMapping {
            id: "m1".to_string(),
            listen_client_id: "A".to_string(),
            target_client_id: "B".to_string(),
            protocol: MappingProtocol::Tcp,
            listen_port: 8080,
            target_host: "127.0.0.1".to_string(),
            target_port: 80,
            secret_key: "shh".to_string(),
            config: Default::default(),
            status: MappingStatus::Active,
        }
    }

    fn test_handler(cloud_control: Arc<MemoryCloudControl>, sessions: Arc<SessionManager>, registry: Arc<BridgeRegistry>) -> Arc<TunnelOpenHandler> {
        let broker: Arc<dyn ClusterBroker> = Arc::new(tunnel_cluster::MemoryBroker::new());
        let locations = Arc::new(ClientLocationRegistry::new(Arc::new(MemoryStore::new()), StdDuration::from_secs(30)));
        Arc::new(TunnelOpenHandler::new(registry, cloud_control, sessions, broker, locations, Scope::root(), "N1".to_string()))
    }

    #[tokio::test]
    async fn racing_tunnel_opens_resolve_to_one_connected_bridge_and_forward_data() {
        let cloud_control = Arc::new(MemoryCloudControl::new());
        cloud_control.insert_mapping(sample_mapping());
        let sessions = Arc::new(SessionManager::new(Scope::root()));
        let registry = Arc::new(BridgeRegistry::new());
        let handler = test_handler(cloud_control, sessions.clone(), registry.clone());

        // B's persistent control connection, so the source side's
        // TunnelOpenRequest has somewhere to land regardless of which
        // physical tunnel connection's get_or_create wins the race.
        let (control_b, _control_b_far) = authenticated("control-b", "B").await;
        sessions.register_control_connection(control_b).await.unwrap();

        let (conn_a, mut far_a) = authenticated("ca", "A").await;
        let (conn_b, mut far_b) = authenticated("cb", "B").await;

        let payload = TunnelOpenPayload { tunnel_id: "t1".to_string(), mapping_id: "m1".to_string(), secret_key: "shh".to_string(), target_host: None, target_port: None };

        let h1 = handler.clone();
        let a = conn_a.clone();
        let p1 = payload.clone();
        let task_a = tokio::spawn(async move { h1.handle(&a, Packet::TunnelOpen(p1)).await });

        let h2 = handler.clone();
        let b = conn_b.clone();
        let p2 = payload.clone();
        let task_b = tokio::spawn(async move { h2.handle(&b, Packet::TunnelOpen(p2)).await });

        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();

        let bridge = registry.get("t1").expect("bridge should exist");
        assert_eq!(bridge.state().await, crate::bridge::BridgeState::Connected);
        assert!(conn_a.is_stream_mode());
        assert!(conn_b.is_stream_mode());

        far_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn bad_secret_key_is_rejected_without_creating_a_bridge() {
        let cloud_control = Arc::new(MemoryCloudControl::new());
        cloud_control.insert_mapping(sample_mapping());
        let sessions = Arc::new(SessionManager::new(Scope::root()));
        let registry = Arc::new(BridgeRegistry::new());
        let handler = test_handler(cloud_control, sessions, registry.clone());

        let (conn_a, _far_a) = authenticated("ca", "A").await;
        let payload = TunnelOpenPayload { tunnel_id: "t1".to_string(), mapping_id: "m1".to_string(), secret_key: "wrong".to_string(), target_host: None, target_port: None };

        handler.handle(&conn_a, Packet::TunnelOpen(payload)).await.unwrap();
        assert!(registry.get("t1").is_none());
        assert!(!conn_a.is_stream_mode());
    }

    async fn wait_until(predicate: impl Fn() -> bool) {
        for _ in 0..50 {
            if predicate() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn cross_node_bridge_close_propagates_to_the_peer_node() {
        let broker: Arc<dyn ClusterBroker> = Arc::new(tunnel_cluster::MemoryBroker::new());
        let locations = Arc::new(ClientLocationRegistry::new(Arc::new(MemoryStore::new()), StdDuration::from_secs(30)));

        let cc_n1 = Arc::new(MemoryCloudControl::new());
        cc_n1.insert_mapping(sample_mapping());
        let registry_n1 = Arc::new(BridgeRegistry::new());
        let handler_n1 = Arc::new(TunnelOpenHandler::new(
            registry_n1.clone(),
            cc_n1,
            Arc::new(SessionManager::new(Scope::root())),
            broker.clone(),
            locations.clone(),
            Scope::root(),
            "N1".to_string(),
        ));

        let cc_n2 = Arc::new(MemoryCloudControl::new());
        cc_n2.insert_mapping(sample_mapping());
        let sessions_n2 = Arc::new(SessionManager::new(Scope::root()));
        let registry_n2 = Arc::new(BridgeRegistry::new());
        let handler_n2 = Arc::new(TunnelOpenHandler::new(
            registry_n2.clone(),
            cc_n2,
            sessions_n2.clone(),
            broker.clone(),
            locations.clone(),
            Scope::root(),
            "N2".to_string(),
        ));
        handler_n2.install_broadcast_listener().await.unwrap();

        locations
            .refresh(&tunnel_cluster::ClientLocation {
                client_id: "B".to_string(),
                node_id: "N2".to_string(),
                conn_id: "control-b".to_string(),
                protocol: "tcp".to_string(),
                conn_type: tunnel_cluster::ConnType::Control,
            })
            .await
            .unwrap();
        let (control_b, _control_b_far) = authenticated("control-b", "B").await;
        sessions_n2.register_control_connection(control_b).await.unwrap();

        let payload = TunnelOpenPayload { tunnel_id: "t1".to_string(), mapping_id: "m1".to_string(), secret_key: "shh".to_string(), target_host: None, target_port: None };

        let (conn_a, _far_a) = authenticated("ca", "A").await;
        handler_n1.handle(&conn_a, Packet::TunnelOpen(payload.clone())).await.unwrap();

        wait_until(|| registry_n2.get("t1").is_some()).await;

        let (conn_b, _far_b) = authenticated("cb", "B").await;
        handler_n2.handle(&conn_b, Packet::TunnelOpen(payload)).await.unwrap();

        let n1_bridge = registry_n1.get("t1").expect("node 1 bridge should exist");
        for _ in 0..50 {
            if n1_bridge.state().await == crate::bridge::BridgeState::Connected {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        assert_eq!(n1_bridge.state().await, crate::bridge::BridgeState::Connected);

        n1_bridge.close().await;

        wait_until(|| registry_n2.get("t1").is_none()).await;
    }
}
