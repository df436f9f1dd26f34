use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge end closed")]
    EndClosed,
    #[error(transparent)]
    Codec(#[from] tunnel_proto::CodecError),
    #[error(transparent)]
    Crypto(#[from] tunnel_proto::CryptoError),
    #[error(transparent)]
    Cluster(#[from] tunnel_cluster::ClusterError),
    #[error(transparent)]
    CloudControl(#[from] tunnel_cloud_control::CloudControlError),
    #[error("bad credentials for tunnel {0}")]
    BadCredentials(String),
    #[error("cross-node peer unreachable: {0}")]
    CrossNodeUnreachable(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
