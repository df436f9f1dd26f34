//! Bridge registry, keyed by tunnelId. A single guarded map insert
//! resolves the race where both sides try to create the bridge at once
//! (spec §4.6): whichever side inserts first becomes "creator", the
//! other attaches to the existing entry.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tunnel_cloud_control::MappingTransformConfig;
use tunnel_router::BridgeMigration;
use tunnel_session::{Connection, Scope};

use crate::bridge::{BridgeState, TunnelBridge};
use crate::end::{BridgeEnd, LocalEnd};

#[derive(Default)]
pub struct BridgeRegistry {
    bridges: DashMap<String, Arc<TunnelBridge>>,
}

pub struct GetOrCreate {
    pub bridge: Arc<TunnelBridge>,
    /// True if this call's `initial_state` won the race and created the
    /// entry; false if an existing bridge was found instead.
    pub created: bool,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<TunnelBridge>> {
        self.bridges.get(tunnel_id).map(|b| b.clone())
    }

    /// Atomically looks up or inserts a bridge for `tunnel_id`.
    /// `DashMap::entry` serializes concurrent callers on the same shard,
    /// which is the single guarded insert the tie-break needs.
    pub fn get_or_create(&self, tunnel_id: &str, mapping_id: &str, config: MappingTransformConfig, initial_state: BridgeState, parent_scope: &Scope) -> GetOrCreate {
        let mut created = false;
        let bridge = self
            .bridges
            .entry(tunnel_id.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(TunnelBridge::new(tunnel_id.to_string(), mapping_id.to_string(), config, initial_state, parent_scope))
            })
            .clone();
        GetOrCreate { bridge, created }
    }

    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<TunnelBridge>> {
        self.bridges.remove(tunnel_id).map(|(_, b)| b)
    }
}

#[async_trait]
impl BridgeMigration for BridgeRegistry {
    /// Re-points every bridge with an end bound to `old_conn_id` onto
    /// `new_conn`. Every bridge is checked since a reconnecting client's
    /// in-flight bridge isn't indexed by connId anywhere else.
    async fn migrate(&self, old_conn_id: &str, new_conn: Arc<Connection>) {
        let new_end: Arc<dyn BridgeEnd> = Arc::new(LocalEnd::new(new_conn));
        for entry in self.bridges.iter() {
            entry.value().migrate_end(old_conn_id, new_end.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use tunnel_proto::FrameCodec;
    use tunnel_transport::{BoxedReader, BoxedWriter};

    fn test_connection(id: &str) -> Arc<Connection> {
        let (near, _far) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(near);
        let codec = FrameCodec::new(Box::pin(reader) as BoxedReader, Box::pin(writer) as BoxedWriter, CancellationToken::new());
        Arc::new(Connection::new(id.to_string(), "tcp".to_string(), codec, Scope::root()))
    }

    #[tokio::test]
    async fn migrate_re_points_the_end_bound_to_the_old_connection() {
        let registry = BridgeRegistry::new();
        let scope = Scope::root();
        let entry = registry.get_or_create("t1", "m1", MappingTransformConfig::default(), BridgeState::WaitingTarget, &scope);
        let old_conn = test_connection("old");
        entry.bridge.set_source_end(Arc::new(LocalEnd::new(old_conn.clone()))).await;

        let new_conn = test_connection("new");
        registry.migrate("old", new_conn).await;

        let (source, _target) = entry.bridge.ends().await;
        assert_eq!(source.unwrap().conn_id(), Some("new"));
    }

    #[tokio::test]
    async fn migrate_ignores_bridges_not_bound_to_the_superseded_connection() {
        let registry = BridgeRegistry::new();
        let scope = Scope::root();
        let entry = registry.get_or_create("t1", "m1", MappingTransformConfig::default(), BridgeState::WaitingTarget, &scope);
        let source_conn = test_connection("c1");
        entry.bridge.set_source_end(Arc::new(LocalEnd::new(source_conn))).await;

        registry.migrate("unrelated", test_connection("new")).await;

        let (source, _target) = entry.bridge.ends().await;
        assert_eq!(source.unwrap().conn_id(), Some("c1"));
    }

    #[test]
    fn first_caller_creates_second_attaches() {
        let registry = BridgeRegistry::new();
        let scope = Scope::root();
        let first = registry.get_or_create("t1", "m1", MappingTransformConfig::default(), BridgeState::WaitingTarget, &scope);
        assert!(first.created);

        let second = registry.get_or_create("t1", "m1", MappingTransformConfig::default(), BridgeState::WaitingSource, &scope);
        assert!(!second.created);
        assert!(Arc::ptr_eq(&first.bridge, &second.bridge));
    }

    #[test]
    fn remove_drops_the_entry() {
        let registry = BridgeRegistry::new();
        let scope = Scope::root();
        registry.get_or_create("t1", "m1", MappingTransformConfig::default(), BridgeState::WaitingTarget, &scope);
        assert!(registry.remove("t1").is_some());
        assert!(registry.get("t1").is_none());
    }
}
