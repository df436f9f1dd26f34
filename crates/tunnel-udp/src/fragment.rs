//! Fragment header parsing/serialization and the split/unfragmented
//! threshold that decides whether a datagram needs fragmenting at all.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic marking a UDP fragment.
pub const MAGIC_FRAGMENT: u16 = 0x554E;
/// Magic marking an ACK.
pub const MAGIC_ACK: u16 = 0x5541;

/// Fragments never carry more than this many payload bytes, to stay
/// under typical MTU once the 24-byte header is added.
pub const MAX_FRAGMENT_PAYLOAD: usize = 1400;
/// Datagrams at or below this size skip fragmentation entirely and are
/// sent as a raw, header-less datagram.
pub const UNFRAGMENTED_THRESHOLD: usize = 1200;

pub const FRAGMENT_HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentFlags {
    pub is_fragment: bool,
    pub is_first: bool,
    pub is_last: bool,
    pub needs_ack: bool,
}

impl FragmentFlags {
    fn to_byte(self) -> u8 {
        (self.is_fragment as u8)
            | (self.is_first as u8) << 1
            | (self.is_last as u8) << 2
            | (self.needs_ack as u8) << 3
    }

    fn from_byte(b: u8) -> Self {
        Self {
            is_fragment: b & 0b0001 != 0,
            is_first: b & 0b0010 != 0,
            is_last: b & 0b0100 != 0,
            needs_ack: b & 0b1000 != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub version: u8,
    pub flags: FragmentFlags,
    pub group_id: u64,
    pub fragment_index: u16,
    pub total_fragments: u16,
    pub original_size: u32,
    pub sequence_num: u16,
    pub payload: Bytes,
}

impl Fragment {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_LEN + self.payload.len());
        buf.put_u16(MAGIC_FRAGMENT);
        buf.put_u8(self.version);
        buf.put_u8(self.flags.to_byte());
        buf.put_u64(self.group_id);
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.total_fragments);
        buf.put_u32(self.original_size);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u16(self.sequence_num);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Option<Fragment> {
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return None;
        }
        let magic = bytes.get_u16();
        if magic != MAGIC_FRAGMENT {
            return None;
        }
        let version = bytes.get_u8();
        let flags = FragmentFlags::from_byte(bytes.get_u8());
        let group_id = bytes.get_u64();
        let fragment_index = bytes.get_u16();
        let total_fragments = bytes.get_u16();
        let original_size = bytes.get_u32();
        let fragment_size = bytes.get_u16() as usize;
        let sequence_num = bytes.get_u16();
        if bytes.len() < fragment_size {
            return None;
        }
        let payload = bytes.slice(0..fragment_size);
        Some(Fragment {
            version,
            flags,
            group_id,
            fragment_index,
            total_fragments,
            original_size,
            sequence_num,
            payload,
        })
    }
}

/// Peeks the leading magic bytes to classify an inbound datagram without
/// fully parsing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramClass {
    Fragment,
    Ack,
    Raw,
}

pub fn classify(bytes: &[u8]) -> DatagramClass {
    if bytes.len() >= 2 {
        let magic = u16::from_be_bytes([bytes[0], bytes[1]]);
        if magic == MAGIC_FRAGMENT {
            return DatagramClass::Fragment;
        }
        if magic == MAGIC_ACK {
            return DatagramClass::Ack;
        }
    }
    DatagramClass::Raw
}

/// Splits `payload` into one or more fragments for `group_id`, or returns
/// an empty vec and leaves the caller to send it unfragmented if it is at
/// or under [`UNFRAGMENTED_THRESHOLD`].
pub fn split(group_id: u64, payload: &[u8], sequence_start: u16) -> Vec<Fragment> {
    if payload.len() <= UNFRAGMENTED_THRESHOLD {
        return Vec::new();
    }
    let chunks: Vec<&[u8]> = payload.chunks(MAX_FRAGMENT_PAYLOAD).collect();
    let total = chunks.len() as u16;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Fragment {
            version: 1,
            flags: FragmentFlags {
                is_fragment: true,
                is_first: i == 0,
                is_last: i + 1 == chunks_len(total),
                needs_ack: true,
            },
            group_id,
            fragment_index: i as u16,
            total_fragments: total,
            original_size: payload.len() as u32,
            sequence_num: sequence_start.wrapping_add(i as u16),
            payload: Bytes::copy_from_slice(chunk),
        })
        .collect()
}

fn chunks_len(total: u16) -> usize {
    total as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_round_trips_through_wire_bytes() {
        let fragment = Fragment {
            version: 1,
            flags: FragmentFlags { is_fragment: true, is_first: true, is_last: false, needs_ack: true },
            group_id: 0xdead_beef,
            fragment_index: 3,
            total_fragments: 9,
            original_size: 12_000,
            sequence_num: 42,
            payload: Bytes::from_static(b"hello"),
        };
        let encoded = fragment.encode();
        assert_eq!(classify(&encoded), DatagramClass::Fragment);
        let decoded = Fragment::decode(encoded).unwrap();
        assert_eq!(decoded, fragment);
    }

    #[test]
    fn small_payload_is_not_split() {
        let payload = vec![0u8; UNFRAGMENTED_THRESHOLD];
        assert!(split(1, &payload, 0).is_empty());
    }

    #[test]
    fn large_payload_is_split_into_bounded_fragments() {
        let payload = vec![7u8; 5000];
        let fragments = split(1, &payload, 0);
        assert!(fragments.len() > 1);
        assert!(fragments.iter().all(|f| f.payload.len() <= MAX_FRAGMENT_PAYLOAD));
        assert!(fragments.first().unwrap().flags.is_first);
        assert!(fragments.last().unwrap().flags.is_last);
        let reassembled: Vec<u8> = fragments.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(reassembled, payload);
    }
}
