use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Codec(#[from] tunnel_proto::CodecError),
    #[error(transparent)]
    Session(#[from] tunnel_session::SessionError),
    #[error(transparent)]
    CloudControl(#[from] tunnel_cloud_control::CloudControlError),
    #[error(transparent)]
    Cluster(#[from] tunnel_cluster::ClusterError),
    #[error(transparent)]
    Jwt(#[from] tunnel_auth::JwtError),
    #[error("client blocked: {0}")]
    ClientBlocked(String),
    #[error("bad credentials for client {0}")]
    BadCredentials(String),
}
