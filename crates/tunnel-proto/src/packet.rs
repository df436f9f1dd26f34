//! Packet types for the control/data plane wire protocol.
//!
//! Wire form: `[type:u8][len:u32-be][payload:len]`. The type byte doubles as
//! a flag carrier: bits 0-5 hold the [`PacketKind`] discriminant, bit 6 is
//! the "compressed" flag and bit 7 is the "encrypted" flag.

use serde::{Deserialize, Serialize};

/// Maximum payload length accepted by the codec (16 MiB).
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

const KIND_MASK: u8 = 0b0011_1111;
const FLAG_COMPRESSED: u8 = 0b0100_0000;
const FLAG_ENCRYPTED: u8 = 0b1000_0000;

/// Discriminant for the logical packet type, independent of the
/// compression/encryption flags it is sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Handshake = 0,
    HandshakeResp = 1,
    Heartbeat = 2,
    JsonCommand = 3,
    CommandResp = 4,
    TunnelOpen = 5,
    TunnelOpenAck = 6,
    TunnelData = 7,
    TunnelClose = 8,
}

impl PacketKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Handshake,
            1 => Self::HandshakeResp,
            2 => Self::Heartbeat,
            3 => Self::JsonCommand,
            4 => Self::CommandResp,
            5 => Self::TunnelOpen,
            6 => Self::TunnelOpenAck,
            7 => Self::TunnelData,
            8 => Self::TunnelClose,
            _ => return None,
        })
    }
}

/// The two independent flag bits carried alongside the packet type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    pub compressed: bool,
    pub encrypted: bool,
}

impl PacketFlags {
    pub fn to_byte(self, kind: PacketKind) -> u8 {
        let mut b = kind as u8 & KIND_MASK;
        if self.compressed {
            b |= FLAG_COMPRESSED;
        }
        if self.encrypted {
            b |= FLAG_ENCRYPTED;
        }
        b
    }

    pub fn from_byte(b: u8) -> (Option<PacketKind>, PacketFlags) {
        let kind = PacketKind::from_u8(b & KIND_MASK);
        let flags = PacketFlags {
            compressed: b & FLAG_COMPRESSED != 0,
            encrypted: b & FLAG_ENCRYPTED != 0,
        };
        (kind, flags)
    }
}

/// Handshake payload. Canonical shape chosen per the open question in the
/// design notes: `connection_type` distinguishes control vs. tunnel
/// sockets, and `reconnect` is the explicit, unambiguous signal the
/// session manager requires before migrating in-flight bridges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakePayload {
    pub client_id: String,
    pub auth_code: String,
    pub secret_key: String,
    pub node_hint: Option<String>,
    pub version: u32,
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub reconnect: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Control,
    Tunnel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeRespPayload {
    pub success: bool,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelOpenPayload {
    pub tunnel_id: String,
    pub mapping_id: String,
    pub secret_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelOpenAckPayload {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Numeric command discriminant carried inside a [`CommandPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum CommandType {
    ConfigSet = 1,
    TunnelOpenRequest = 2,
    Disconnect = 3,
}

/// JSON command envelope, carried by [`PacketKind::JsonCommand`] /
/// [`PacketKind::CommandResp`] packets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandPacket {
    pub command_type: CommandType,
    pub command_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: serde_json::Value,
}

/// Logical packet as seen by application code, after framing/compression/
/// encryption have been stripped away by the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Handshake(HandshakePayload),
    HandshakeResp(HandshakeRespPayload),
    Heartbeat,
    JsonCommand(CommandPacket),
    CommandResp(CommandPacket),
    TunnelOpen(TunnelOpenPayload),
    TunnelOpenAck(TunnelOpenAckPayload),
    TunnelData { tunnel_id: String, data: Vec<u8> },
    TunnelClose { tunnel_id: String, reason: String },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Handshake(_) => PacketKind::Handshake,
            Packet::HandshakeResp(_) => PacketKind::HandshakeResp,
            Packet::Heartbeat => PacketKind::Heartbeat,
            Packet::JsonCommand(_) => PacketKind::JsonCommand,
            Packet::CommandResp(_) => PacketKind::CommandResp,
            Packet::TunnelOpen(_) => PacketKind::TunnelOpen,
            Packet::TunnelOpenAck(_) => PacketKind::TunnelOpenAck,
            Packet::TunnelData { .. } => PacketKind::TunnelData,
            Packet::TunnelClose { .. } => PacketKind::TunnelClose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_roundtrip_through_byte() {
        for kind in [PacketKind::Handshake, PacketKind::TunnelData, PacketKind::TunnelClose] {
            for compressed in [false, true] {
                for encrypted in [false, true] {
                    let flags = PacketFlags { compressed, encrypted };
                    let byte = flags.to_byte(kind);
                    let (decoded_kind, decoded_flags) = PacketFlags::from_byte(byte);
                    assert_eq!(decoded_kind, Some(kind));
                    assert_eq!(decoded_flags, flags);
                }
            }
        }
    }

    #[test]
    fn unknown_kind_byte_is_none() {
        let (kind, _) = PacketFlags::from_byte(0b0111_1111);
        assert!(kind.is_none());
    }
}
