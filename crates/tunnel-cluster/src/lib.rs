//! Cluster broker collaborator (spec §6) and the client-location registry
//! (spec §3's ClientLocation) that sits on top of it and the key/value
//! store to answer cross-node routing questions.

pub mod broker;
pub mod location;
pub mod messages;

#[cfg(feature = "redis-broker")]
pub mod redis_broker;

pub use broker::{ClusterBroker, ClusterError, MemoryBroker, MessageHandler, SubscriptionId};
pub use location::{ClientLocation, ClientLocationRegistry, ConnType};
pub use messages::{tunnel_close_topic, tunnel_data_topic, tunnel_open_topic, BroadcastTunnelOpen, CrossNodeTunnelClose, Direction};

#[cfg(feature = "redis-broker")]
pub use redis_broker::RedisBroker;
