//! Wire protocol for the tunnel fabric: packet types, framing codec,
//! compression, encryption and pacing.

pub mod codec;
pub mod crypto;
pub mod packet;
pub mod token_bucket;

pub use codec::{CodecError, FrameCodec};
pub use crypto::{DirectionalCipher, CryptoError};
pub use packet::{
    CommandPacket, CommandType, HandshakePayload, HandshakeRespPayload, Packet, PacketFlags,
    PacketKind, TunnelOpenAckPayload, TunnelOpenPayload,
};
pub use token_bucket::TokenBucket;
