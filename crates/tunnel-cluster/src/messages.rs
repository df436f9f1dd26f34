//! Cross-node message shapes and topic naming conventions (spec §4.7).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    SourceToTarget,
    TargetToSource,
}

/// Published on `tunnel_open_topic(target_node_id)` when the target client
/// for a TunnelOpen is not locally attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastTunnelOpen {
    pub tunnel_id: String,
    pub mapping_id: String,
    pub target_client_id: String,
    pub origin_node_id: String,
}

/// Published on `tunnel_close_topic(tunnel_id)` when either side of a
/// cross-node bridge tears down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossNodeTunnelClose {
    pub tunnel_id: String,
    pub reason: String,
}

pub fn tunnel_open_topic(node_id: &str) -> String {
    format!("tunnel.open.{node_id}")
}

pub fn tunnel_close_topic(tunnel_id: &str) -> String {
    format!("tunnel.close.{tunnel_id}")
}

/// One topic per (tunnelId, direction) pair, per spec §6.
pub fn tunnel_data_topic(tunnel_id: &str, direction: Direction) -> String {
    let suffix = match direction {
        Direction::SourceToTarget => "s2t",
        Direction::TargetToSource => "t2s",
    };
    format!("tunnel.data.{tunnel_id}.{suffix}")
}
