//! ACK wire format: a bitmap of the first up-to-16 fragment indices plus
//! the highest index received so far, so a late straggler group doesn't
//! need one ACK per fragment.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::fragment::MAGIC_ACK;

pub const ACK_LEN: usize = 2 + 8 + 2 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub group_id: u64,
    /// Bitmap of the first 16 fragment indices (bit i = fragment i received).
    pub bitmap: u16,
    pub highest_received: u16,
}

impl Ack {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ACK_LEN);
        buf.put_u16(MAGIC_ACK);
        buf.put_u64(self.group_id);
        buf.put_u16(self.bitmap);
        buf.put_u16(self.highest_received);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Option<Ack> {
        if bytes.len() < ACK_LEN {
            return None;
        }
        let magic = bytes.get_u16();
        if magic != MAGIC_ACK {
            return None;
        }
        Some(Ack {
            group_id: bytes.get_u64(),
            bitmap: bytes.get_u16(),
            highest_received: bytes.get_u16(),
        })
    }

    pub fn covers(&self, fragment_index: u16) -> bool {
        if fragment_index < 16 {
            self.bitmap & (1 << fragment_index) != 0
        } else {
            fragment_index <= self.highest_received
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_round_trips() {
        let ack = Ack { group_id: 99, bitmap: 0b1011, highest_received: 20 };
        let encoded = ack.encode();
        let decoded = Ack::decode(encoded).unwrap();
        assert_eq!(decoded, ack);
        assert!(decoded.covers(0));
        assert!(decoded.covers(1));
        assert!(!decoded.covers(2));
        assert!(decoded.covers(3));
        assert!(decoded.covers(20));
        assert!(!decoded.covers(21));
    }
}
