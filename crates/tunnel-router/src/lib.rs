//! Packet-type dispatch (spec §4.3) and the control-plane handlers that
//! do not touch a tunnel bridge: authentication/config-push (§4.5) and
//! heartbeat/expiry (§4.8). Tunnel-open handlers (§4.6/§4.7) are
//! registered into the same dispatch table by the bridge layer, which
//! owns the TunnelBridge entity they operate on.

pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod heartbeat;

pub use dispatch::{PacketHandler, PacketRouter, RouteOutcome};
pub use error::RouterError;
pub use handshake::{BridgeMigration, HandshakeHandler, SESSION_TOKEN_VALIDITY};
pub use heartbeat::HeartbeatHandler;
