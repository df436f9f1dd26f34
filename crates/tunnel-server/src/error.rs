use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] tunnel_transport::TransportError),
    #[error("no listen address configured for any transport protocol")]
    NoListenersConfigured,
}
