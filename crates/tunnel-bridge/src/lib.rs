//! The tunnel bridge (spec §3/§4.6/§4.7): the entity joining a source and
//! target end, its registry, the transform pipeline and forwarder, and
//! the TunnelOpen handler that creates and attaches bridges.

pub mod bridge;
pub mod end;
pub mod error;
pub mod forwarder;
pub mod handler;
pub mod registry;

pub use bridge::{BridgeState, TunnelBridge};
pub use end::{BridgeEnd, CrossNodeEnd, LocalEnd};
pub use error::BridgeError;
pub use forwarder::forward;
pub use handler::TunnelOpenHandler;
pub use registry::{BridgeRegistry, GetOrCreate};
