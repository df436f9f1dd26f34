//! Bidirectional copy between a bridge's two ends, applying the
//! per-mapping transform pipeline (spec §4.6):
//!
//! write: bandwidth limiter -> encryptor -> compressor -> raw write
//! read:  raw read -> decompressor -> decryptor -> bandwidth limiter
//!
//! Grounded in the teacher's `TcpForwarder::copy_bidirectional`: one task
//! per direction, EOF on either side shuts the other down, and the
//! bridge is closed once both directions return.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tunnel_proto::{CryptoError, DirectionalCipher, TokenBucket};

use crate::bridge::TunnelBridge;
use crate::end::BridgeEnd;
use crate::error::BridgeError;

const CHUNK_SIZE: usize = 16 * 1024;

fn derive_key(passphrase: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.finalize().into()
}

fn gzip(data: &[u8], level: u32) -> Result<Vec<u8>, BridgeError> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, BridgeError> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// One direction's transform chain, built once per bridge from its
/// mapping config so the forwarder's hot loop has no branching on
/// whether encryption or compression are enabled.
struct Transform {
    cipher: Option<DirectionalCipher>,
    compress: bool,
    compression_level: u32,
    bucket: Arc<TokenBucket>,
}

impl Transform {
    fn new(bridge: &TunnelBridge, salt: [u8; 4], bucket: Arc<TokenBucket>) -> Self {
        let cipher = if bridge.config.enable_encryption {
            bridge.config.encryption_key.as_deref().map(|passphrase| DirectionalCipher::new(&derive_key(passphrase), salt))
        } else {
            None
        };
        Self { cipher, compress: bridge.config.enable_compression, compression_level: bridge.config.compression_level, bucket }
    }

    async fn on_write(&self, data: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>, BridgeError> {
        self.bucket.acquire(data.len() as u64, cancel).await.map_err(|_| BridgeError::EndClosed)?;
        let data = match &self.cipher {
            Some(cipher) => cipher.encrypt(data).map_err(BridgeError::from)?,
            None => data.to_vec(),
        };
        if self.compress {
            gzip(&data, self.compression_level)
        } else {
            Ok(data)
        }
    }

    async fn on_read(&self, data: Vec<u8>, cancel: &CancellationToken) -> Result<Vec<u8>, BridgeError> {
        let data = if self.compress { gunzip(&data)? } else { data };
        let data: Result<Vec<u8>, CryptoError> = match &self.cipher {
            Some(cipher) => cipher.decrypt(&data),
            None => Ok(data),
        };
        let data = data?;
        self.bucket.acquire(data.len() as u64, cancel).await.map_err(|_| BridgeError::EndClosed)?;
        Ok(data)
    }
}

fn bucket_for(bridge: &TunnelBridge) -> Arc<TokenBucket> {
    match bridge.config.bandwidth_limit {
        Some(rate) => Arc::new(TokenBucket::new(rate, 4.0)),
        None => Arc::new(TokenBucket::unlimited()),
    }
}

#[derive(Clone, Copy)]
enum Direction {
    /// Raw bytes from the near side, transformed (limit, encrypt,
    /// compress) before being handed to the far side.
    Outbound,
    /// Wire-shaped bytes from the far side, transformed back
    /// (decompress, decrypt, limit) before reaching the near side.
    Inbound,
}

/// Picks which half of the pipeline applies to one copy, given the
/// static role (`default_direction`, source->target or reverse) and
/// which ends are virtual. A virtual destination means these bytes are
/// about to cross a cross-node pipe and must be protected (Outbound); a
/// virtual origin means they just came off that pipe, already protected
/// by the other node, and only need unwrapping for local delivery
/// (Inbound). Only when neither end is virtual (a same-node bridge)
/// does the static §4.6 role apply.
fn resolve_direction(from: &dyn BridgeEnd, to: &dyn BridgeEnd, default_direction: Direction) -> Direction {
    if to.is_virtual() {
        Direction::Outbound
    } else if from.is_virtual() {
        Direction::Inbound
    } else {
        default_direction
    }
}

/// Copies bytes from `from` to `to`, applying `transform`'s write or
/// read pipeline depending on the resolved direction, until `from`
/// yields an empty chunk (EOF) or an error occurs. Returns bytes copied.
async fn copy_direction(
    from: Arc<dyn BridgeEnd>,
    to: Arc<dyn BridgeEnd>,
    transform: Transform,
    default_direction: Direction,
    cancel: CancellationToken,
) -> Result<u64, BridgeError> {
    let direction = resolve_direction(from.as_ref(), to.as_ref(), default_direction);
    let mut total = 0u64;
    loop {
        let chunk = tokio::select! {
            chunk = from.read_chunk(CHUNK_SIZE) => chunk?,
            _ = cancel.cancelled() => break,
        };
        if chunk.is_empty() {
            // Propagate EOF as an explicit empty write so a cross-node
            // hop's far side observes it too, not just this process.
            let _ = to.write_chunk(&[]).await;
            break;
        }
        total += chunk.len() as u64;
        let outgoing = match direction {
            Direction::Outbound => transform.on_write(&chunk, &cancel).await?,
            Direction::Inbound => transform.on_read(chunk, &cancel).await?,
        };
        to.write_chunk(&outgoing).await?;
    }
    to.close().await;
    Ok(total)
}

/// Runs both forwarding directions for a connected bridge until either
/// side reaches EOF, then closes the bridge. Grounded in the teacher's
/// `tokio::join!` of two direction futures. On a same-node bridge,
/// bytes flowing source->target go through the write pipeline and
/// target->source through the read pipeline (§4.6); on a cross-node
/// bridge the side touching the virtual end picks the pipeline instead,
/// so the transform is applied exactly once per hop (§4.7).
pub async fn forward(bridge: Arc<TunnelBridge>, source: Arc<dyn BridgeEnd>, target: Arc<dyn BridgeEnd>) {
    let cancel = bridge.scope.token();
    let source_to_target = Transform::new(&bridge, [1, 0, 0, 0], bucket_for(&bridge));
    let target_to_source = Transform::new(&bridge, [2, 0, 0, 0], bucket_for(&bridge));

    let (a, b) = tokio::join!(
        copy_direction(source.clone(), target.clone(), source_to_target, Direction::Outbound, cancel.clone()),
        copy_direction(target, source, target_to_source, Direction::Inbound, cancel),
    );

    if let Err(err) = &a {
        tracing::warn!(tunnel_id = %bridge.tunnel_id, error = %err, "source-to-target forwarding ended with an error");
    }
    if let Err(err) = &b {
        tracing::warn!(tunnel_id = %bridge.tunnel_id, error = %err, "target-to-source forwarding ended with an error");
    }
    bridge.close().await;
}
