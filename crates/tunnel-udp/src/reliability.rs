//! Orchestrates fragmentation, ACKing and retransmission into a single
//! per-flow reliability layer sitting above a raw UDP socket.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::ack::Ack;
use crate::fragment::{classify, split, DatagramClass, Fragment};
use crate::recv_buffer::UdpReceiveBuffer;
use crate::rtt::RttEstimator;
use crate::send_buffer::{RetransmitOutcome, UdpSendBuffer};

/// Output of feeding an inbound datagram through the reliability layer.
#[derive(Debug)]
pub enum InboundEvent {
    /// A complete datagram (either unfragmented, or a just-reassembled
    /// fragment group) ready for the application.
    Data(Vec<u8>),
    /// An ACK this layer should transmit back to the peer immediately.
    SendAck(Bytes),
    /// A peer ACK was processed; nothing further to do.
    Acknowledged,
    /// Datagram was not understood (malformed fragment/ack header).
    Malformed,
}

/// A wire datagram this layer wants transmitted, alongside whether it is
/// tracked for retransmission.
pub struct OutboundDatagram {
    pub bytes: Bytes,
    pub group_id: Option<u64>,
}

pub struct UdpReliabilityLayer {
    send_buffer: UdpSendBuffer,
    recv_buffer: UdpReceiveBuffer,
    rtt: RttEstimator,
    next_group_id: AtomicU64,
    next_sequence: AtomicU16,
}

impl Default for UdpReliabilityLayer {
    fn default() -> Self {
        Self {
            send_buffer: UdpSendBuffer::new(),
            recv_buffer: UdpReceiveBuffer::new(),
            rtt: RttEstimator::new(),
            next_group_id: AtomicU64::new(1),
            next_sequence: AtomicU16::new(0),
        }
    }
}

impl UdpReliabilityLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares `payload` for transmission: either a single raw datagram
    /// (at or under the unfragmented threshold) or a sequence of tracked
    /// fragments registered in the send buffer.
    pub fn send_datagram(&mut self, payload: &[u8], now: Instant) -> Vec<OutboundDatagram> {
        let group_id = self.next_group_id.fetch_add(1, Ordering::Relaxed);
        let sequence_start = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let fragments = split(group_id, payload, sequence_start);

        if fragments.is_empty() {
            return vec![OutboundDatagram { bytes: Bytes::copy_from_slice(payload), group_id: None }];
        }

        let mut out = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            self.send_buffer.insert(group_id, fragment.clone(), now);
            out.push(OutboundDatagram { bytes: fragment.encode(), group_id: Some(group_id) });
        }
        out
    }

    /// Feeds a datagram received off the wire through classification,
    /// reassembly and ACK bookkeeping.
    pub fn on_datagram_received(&mut self, bytes: Bytes, now: Instant) -> InboundEvent {
        match classify(&bytes) {
            DatagramClass::Raw => InboundEvent::Data(bytes.to_vec()),
            DatagramClass::Ack => match Ack::decode(bytes) {
                Some(ack) => {
                    self.on_ack(&ack);
                    InboundEvent::Acknowledged
                }
                None => InboundEvent::Malformed,
            },
            DatagramClass::Fragment => match Fragment::decode(bytes) {
                Some(fragment) => {
                    let group_id = fragment.group_id;
                    let needs_ack = fragment.flags.needs_ack;
                    let index = fragment.fragment_index;
                    let completed = self.recv_buffer.receive(fragment, now);

                    if let (true, Some(summary)) = (needs_ack, self.recv_buffer.receipt_summary(group_id)) {
                        let _ = index;
                        let ack = Ack { group_id, bitmap: summary.bitmap, highest_received: summary.highest_received };
                        if let Some(data) = completed {
                            return InboundEvent::Data(data);
                        }
                        return InboundEvent::SendAck(ack.encode());
                    }

                    match completed {
                        Some(data) => InboundEvent::Data(data),
                        None => InboundEvent::Acknowledged,
                    }
                }
                None => InboundEvent::Malformed,
            },
        }
    }

    fn on_ack(&mut self, ack: &Ack) {
        for index in 0..16u16 {
            if ack.covers(index) {
                self.send_buffer.acknowledge(ack.group_id, index);
            }
        }
        if ack.highest_received >= 16 {
            for index in 16..=ack.highest_received {
                self.send_buffer.acknowledge(ack.group_id, index);
            }
        }
    }

    /// Records a measured RTT sample, e.g. from the time between sending a
    /// fragment and receiving its ACK.
    pub fn sample_rtt(&mut self, measured: Duration) {
        self.rtt.sample(measured);
    }

    /// Sweeps for fragments due for retransmission or abandonment, and
    /// expires stale partial receive groups. Returns datagrams that must
    /// be resent.
    pub fn tick(&mut self, now: Instant) -> Vec<OutboundDatagram> {
        self.recv_buffer.expire_stale(now);
        let rto = self.rtt.rto();
        self.send_buffer
            .due_for_retransmit(rto, now)
            .into_iter()
            .filter_map(|(group_id, fragment, outcome)| match outcome {
                RetransmitOutcome::Resend => {
                    Some(OutboundDatagram { bytes: fragment.encode(), group_id: Some(group_id) })
                }
                RetransmitOutcome::Abandon => None,
            })
            .collect()
    }

    pub fn outstanding_send_groups(&self) -> usize {
        self.send_buffer.outstanding_groups()
    }

    pub fn outstanding_recv_groups(&self) -> usize {
        self.recv_buffer.outstanding_groups()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_round_trips_as_raw_datagram() {
        let mut sender = UdpReliabilityLayer::new();
        let mut receiver = UdpReliabilityLayer::new();
        let now = Instant::now();
        let out = sender.send_datagram(b"dns query", now);
        assert_eq!(out.len(), 1);
        assert!(out[0].group_id.is_none());

        match receiver.on_datagram_received(out[0].bytes.clone(), now) {
            InboundEvent::Data(data) => assert_eq!(data, b"dns query"),
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn large_payload_reassembles_and_acks_flow_back() {
        let mut sender = UdpReliabilityLayer::new();
        let mut receiver = UdpReliabilityLayer::new();
        let now = Instant::now();
        let payload = vec![3u8; 6000];

        let outbound = sender.send_datagram(&payload, now);
        assert!(outbound.len() > 1);
        assert_eq!(sender.outstanding_send_groups(), 1);

        let mut reassembled = None;
        let mut ack_bytes = Vec::new();
        for datagram in &outbound {
            match receiver.on_datagram_received(datagram.bytes.clone(), now) {
                InboundEvent::Data(data) => reassembled = Some(data),
                InboundEvent::SendAck(ack) => ack_bytes.push(ack),
                _ => {}
            }
        }
        assert_eq!(reassembled.unwrap(), payload);
        assert!(!ack_bytes.is_empty());

        for ack in ack_bytes {
            sender.on_datagram_received(ack, now);
        }
        assert_eq!(sender.outstanding_send_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_fragment_is_retransmitted_then_abandoned() {
        let mut sender = UdpReliabilityLayer::new();
        let now = Instant::now();
        sender.send_datagram(&vec![1u8; 6000], now);

        let mut resend_rounds = 0;
        loop {
            tokio::time::advance(Duration::from_secs(3)).await;
            let due = sender.tick(Instant::now());
            if due.is_empty() {
                break;
            }
            resend_rounds += 1;
            assert!(resend_rounds <= crate::send_buffer::MAX_RETRIES + 1);
        }
        assert_eq!(sender.outstanding_send_groups(), 0);
    }
}
