//! Framing reader/writer that multiplexes control packets and, until a
//! connection flips into stream mode, the bytes that ride alongside them.

use std::io::{self, ErrorKind};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::crypto::DirectionalCipher;
use crate::packet::{
    CommandPacket, HandshakePayload, HandshakeRespPayload, Packet, PacketFlags, PacketKind,
    TunnelOpenAckPayload, TunnelOpenPayload, MAX_PACKET_LEN,
};
use crate::token_bucket::TokenBucket;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("clean end of stream")]
    Eof,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
    #[error("codec cancelled")]
    Cancelled,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Length-prefixed TLV codec layered over a split reader/writer pair.
///
/// `read_packet` is internally mutex-serialized so concurrent callers on
/// the same codec observe a consistent stream; in practice exactly one
/// reader task calls it per connection. Encryption and compression apply
/// per-direction: a `DirectionalCipher` for outbound frames, a distinct
/// one for inbound.
pub struct FrameCodec<R, W> {
    reader: AsyncMutex<R>,
    writer: AsyncMutex<W>,
    tx_cipher: Option<Arc<DirectionalCipher>>,
    rx_cipher: Option<Arc<DirectionalCipher>>,
    pacer: TokenBucket,
    scope: CancellationToken,
}

impl<R, W> FrameCodec<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, scope: CancellationToken) -> Self {
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            tx_cipher: None,
            rx_cipher: None,
            pacer: TokenBucket::unlimited(),
            scope,
        }
    }

    pub fn with_encryption(mut self, tx: DirectionalCipher, rx: DirectionalCipher) -> Self {
        self.tx_cipher = Some(Arc::new(tx));
        self.rx_cipher = Some(Arc::new(rx));
        self
    }

    /// Reads one packet. Returns the decoded packet and the number of
    /// wire bytes it consumed (5-byte header + payload length).
    pub async fn read_packet(&self) -> Result<(Packet, usize), CodecError> {
        let mut reader = self.reader.lock().await;

        let mut header = [0u8; 1];
        tokio::select! {
            res = reader.read_exact(&mut header) => {
                match res {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(CodecError::Eof),
                    Err(e) => return Err(CodecError::Io(e)),
                }
            }
            _ = self.scope.cancelled() => return Err(CodecError::Cancelled),
        }

        let (kind, flags) = PacketFlags::from_byte(header[0]);
        let kind = kind.ok_or_else(|| CodecError::Framing("unknown packet type".into()))?;

        let mut len_buf = [0u8; 4];
        reader
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| CodecError::Framing(format!("truncated length header: {e}")))?;
        let len = u32::from_be_bytes(len_buf) as usize;

        // Bail out before touching the payload: an oversized length must
        // not cause us to read (or block on) a single further byte.
        if len > MAX_PACKET_LEN {
            return Err(CodecError::Framing("invalid packet length".into()));
        }

        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|_| CodecError::Framing("incomplete frame".into()))?;
        drop(reader);

        let mut bytes = payload;
        if flags.encrypted {
            let cipher = self
                .rx_cipher
                .as_ref()
                .ok_or_else(|| CodecError::Framing("encrypted packet but no cipher configured".into()))?;
            bytes = cipher
                .decrypt(&bytes)
                .map_err(|_| CodecError::Framing("aead tag mismatch".into()))?;
        }
        if flags.compressed {
            bytes = gunzip(&bytes)?;
        }

        let packet = decode_payload(kind, &bytes)?;
        Ok((packet, 5 + len))
    }

    /// Writes one packet, optionally gzip-compressing the payload and
    /// always pacing through the token bucket at `bandwidth_limit_bytes_per_sec`
    /// (0 = unlimited).
    pub async fn write_packet(
        &self,
        packet: &Packet,
        use_compression: bool,
        bandwidth_limit_bytes_per_sec: u64,
    ) -> Result<usize, CodecError> {
        let kind = packet.kind();
        let mut bytes = encode_payload(packet)?;

        let mut flags = PacketFlags::default();
        if use_compression && is_compressible(kind) {
            bytes = gzip(&bytes)?;
            flags.compressed = true;
        }
        if let Some(cipher) = &self.tx_cipher {
            bytes = cipher
                .encrypt(&bytes)
                .map_err(|_| CodecError::Framing("encryption failed".into()))?;
            flags.encrypted = true;
        }

        if bytes.len() > MAX_PACKET_LEN {
            return Err(CodecError::MessageTooLarge(bytes.len()));
        }

        self.pacer.set_rate(bandwidth_limit_bytes_per_sec, 4.0);
        self.pacer
            .acquire((5 + bytes.len()) as u64, &self.scope)
            .await
            .map_err(|_| CodecError::Cancelled)?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&[flags.to_byte(kind)]).await?;
        writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(5 + bytes.len())
    }

    /// Reads exactly `n` raw bytes, bypassing the frame parser. Used once
    /// a connection has flipped into stream mode.
    pub async fn read_exactly(&self, n: usize) -> Result<Vec<u8>, CodecError> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; n];
        reader.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub async fn write_exactly(&self, bytes: &[u8]) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads up to `max_len` raw bytes, stopping short on whatever the
    /// underlying transport has ready. Returns an empty vec on clean
    /// EOF rather than erroring, so stream-mode forwarders can treat it
    /// as "the other side is done" without a special error path.
    pub async fn read_some(&self, max_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; max_len];
        let n = tokio::select! {
            res = reader.read(&mut buf) => res?,
            _ = self.scope.cancelled() => return Err(CodecError::Cancelled),
        };
        buf.truncate(n);
        Ok(buf)
    }

    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }
}

fn is_compressible(kind: PacketKind) -> bool {
    !matches!(kind, PacketKind::TunnelData)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Framing(format!("gzip encode failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| CodecError::Framing(format!("gzip encode failed: {e}")))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Framing(format!("gzip reset: {e}")))?;
    Ok(out)
}

fn encode_payload(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    Ok(match packet {
        Packet::Handshake(p) => serde_json::to_vec(p)?,
        Packet::HandshakeResp(p) => serde_json::to_vec(p)?,
        Packet::Heartbeat => Vec::new(),
        Packet::JsonCommand(p) => serde_json::to_vec(p)?,
        Packet::CommandResp(p) => serde_json::to_vec(p)?,
        Packet::TunnelOpen(p) => serde_json::to_vec(p)?,
        Packet::TunnelOpenAck(p) => serde_json::to_vec(p)?,
        Packet::TunnelData { tunnel_id, data } => encode_tunnel_data(tunnel_id, data),
        Packet::TunnelClose { tunnel_id, reason } => {
            serde_json::to_vec(&serde_json::json!({ "tunnel_id": tunnel_id, "reason": reason }))?
        }
    })
}

fn decode_payload(kind: PacketKind, bytes: &[u8]) -> Result<Packet, CodecError> {
    Ok(match kind {
        PacketKind::Handshake => Packet::Handshake(serde_json::from_slice::<HandshakePayload>(bytes)?),
        PacketKind::HandshakeResp => {
            Packet::HandshakeResp(serde_json::from_slice::<HandshakeRespPayload>(bytes)?)
        }
        PacketKind::Heartbeat => Packet::Heartbeat,
        PacketKind::JsonCommand => Packet::JsonCommand(serde_json::from_slice::<CommandPacket>(bytes)?),
        PacketKind::CommandResp => Packet::CommandResp(serde_json::from_slice::<CommandPacket>(bytes)?),
        PacketKind::TunnelOpen => Packet::TunnelOpen(serde_json::from_slice::<TunnelOpenPayload>(bytes)?),
        PacketKind::TunnelOpenAck => {
            Packet::TunnelOpenAck(serde_json::from_slice::<TunnelOpenAckPayload>(bytes)?)
        }
        PacketKind::TunnelData => decode_tunnel_data(bytes)?,
        PacketKind::TunnelClose => {
            let v: serde_json::Value = serde_json::from_slice(bytes)?;
            Packet::TunnelClose {
                tunnel_id: v["tunnel_id"].as_str().unwrap_or_default().to_string(),
                reason: v["reason"].as_str().unwrap_or_default().to_string(),
            }
        }
    })
}

fn encode_tunnel_data(tunnel_id: &str, data: &[u8]) -> Vec<u8> {
    let id_bytes = tunnel_id.as_bytes();
    let mut out = Vec::with_capacity(2 + id_bytes.len() + data.len());
    out.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(id_bytes);
    out.extend_from_slice(data);
    out
}

fn decode_tunnel_data(bytes: &[u8]) -> Result<Packet, CodecError> {
    if bytes.len() < 2 {
        return Err(CodecError::Framing("short TunnelData payload".into()));
    }
    let id_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    if bytes.len() < 2 + id_len {
        return Err(CodecError::Framing("short TunnelData payload".into()));
    }
    let tunnel_id = String::from_utf8_lossy(&bytes[2..2 + id_len]).to_string();
    let data = bytes[2 + id_len..].to_vec();
    Ok(Packet::TunnelData { tunnel_id, data })
}
