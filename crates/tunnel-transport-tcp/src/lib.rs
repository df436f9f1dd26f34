//! Concrete TCP `TransportAdapter`: a plain accept loop over `TcpListener`,
//! each accepted socket split into a reader/writer half and handed to the
//! configured acceptor on its own task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use tunnel_transport::{ConnectionAcceptor, TransportAdapter, TransportError, TransportResult};

#[derive(Debug)]
pub struct TcpAdapter {
    bind_addr: SocketAddr,
    stopped: AtomicBool,
}

impl TcpAdapter {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self { bind_addr, stopped: AtomicBool::new(false) }
    }
}

#[async_trait]
impl TransportAdapter for TcpAdapter {
    fn protocol_name(&self) -> &str {
        "tcp"
    }

    async fn start(&self, acceptor: Arc<dyn ConnectionAcceptor>) -> TransportResult<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        info!(addr = %self.bind_addr, "tcp adapter listening");

        tokio::spawn(async move {
            loop {
                let (stream, remote_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "tcp accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    debug!(%remote_addr, "tcp connection accepted");
                    let (reader, writer) = stream.into_split();
                    acceptor.accept(Box::pin(reader), Box::pin(writer), remote_addr, "tcp").await;
                });
            }
        });

        Ok(())
    }

    async fn dial(&self, target: &str) -> TransportResult<(tunnel_transport::BoxedReader, tunnel_transport::BoxedWriter)> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| TransportError::DialFailed(e.to_string()))?;
        let (reader, writer) = stream.into_split();
        Ok((Box::pin(reader), Box::pin(writer)))
    }

    async fn stop(&self) -> TransportResult<()> {
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }
}
