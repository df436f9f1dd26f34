//! Composition root (spec §4/§6): wires every collaborator crate into a
//! running tunnel node — configuration, the session/router/bridge
//! stack, the transport adapters, and the top-level lifecycle.

pub mod acceptor;
pub mod config;
pub mod error;
pub mod server;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::{run, TunnelServer};
