//! Connection lifecycle and session orchestration (spec §3's Connection/
//! ControlConnection entities and §4.4's session manager): the state
//! machine, the connId/clientId indices, and the hierarchical
//! cancellation scope tree everything else in the fabric is spawned
//! under.

pub mod connection;
pub mod manager;
pub mod scope;
pub mod state;

pub use connection::{Connection, ConnectionError};
pub use manager::{RegisterOutcome, SessionError, SessionManager, DEFAULT_KICK_GRACE_PERIOD, HEARTBEAT_DEADLINE};
pub use scope::Scope;
pub use state::{ConnectionState, StateError};
