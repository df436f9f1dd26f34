//! Tracks outstanding (unacknowledged) fragments for retransmission.

use std::collections::BTreeMap;
use tokio::time::Instant;

use crate::fragment::Fragment;

/// Fragments are abandoned after this many retransmission attempts.
pub const MAX_RETRIES: u32 = 5;
/// Oldest non-progressing group is evicted once the buffer holds this many
/// outstanding groups, to bound memory under sustained loss.
pub const MAX_OUTSTANDING_GROUPS: usize = 100;

struct PendingFragment {
    fragment: Fragment,
    sent_at: Instant,
    retries: u32,
}

#[derive(Default)]
struct Group {
    fragments: BTreeMap<u16, PendingFragment>,
    first_sent_at: Option<Instant>,
}

/// Per-connection outstanding-fragment tracker, keyed by group id.
#[derive(Default)]
pub struct UdpSendBuffer {
    groups: BTreeMap<u64, Group>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitOutcome {
    Resend,
    Abandon,
}

impl UdpSendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group_id: u64, fragment: Fragment, now: Instant) {
        let group = self.groups.entry(group_id).or_default();
        group.first_sent_at.get_or_insert(now);
        group
            .fragments
            .insert(fragment.fragment_index, PendingFragment { fragment, sent_at: now, retries: 0 });
        self.evict_if_over_capacity(group_id);
    }

    /// Marks a fragment index within a group as acknowledged, removing it
    /// from tracking. Drops the group entirely once it is empty.
    pub fn acknowledge(&mut self, group_id: u64, fragment_index: u16) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.fragments.remove(&fragment_index);
            if group.fragments.is_empty() {
                self.groups.remove(&group_id);
            }
        }
    }

    pub fn drop_group(&mut self, group_id: u64) {
        self.groups.remove(&group_id);
    }

    /// Scans for fragments whose retransmission timeout has elapsed,
    /// returning either a fresh copy to resend (with retry count bumped)
    /// or a signal that the fragment has exceeded [`MAX_RETRIES`] and
    /// should be abandoned (the whole group is dropped in that case).
    pub fn due_for_retransmit(&mut self, rto: std::time::Duration, now: Instant) -> Vec<(u64, Fragment, RetransmitOutcome)> {
        let mut due = Vec::new();
        let mut abandoned_groups = Vec::new();

        for (&group_id, group) in self.groups.iter_mut() {
            for pending in group.fragments.values_mut() {
                if now.duration_since(pending.sent_at) < rto {
                    continue;
                }
                if pending.retries >= MAX_RETRIES {
                    due.push((group_id, pending.fragment.clone(), RetransmitOutcome::Abandon));
                    continue;
                }
                pending.retries += 1;
                pending.sent_at = now;
                due.push((group_id, pending.fragment.clone(), RetransmitOutcome::Resend));
            }
            if group.fragments.values().all(|p| p.retries >= MAX_RETRIES) && !group.fragments.is_empty() {
                abandoned_groups.push(group_id);
            }
        }

        for group_id in abandoned_groups {
            self.drop_group(group_id);
        }

        due
    }

    pub fn outstanding_groups(&self) -> usize {
        self.groups.len()
    }

    fn evict_if_over_capacity(&mut self, just_inserted: u64) {
        if self.groups.len() <= MAX_OUTSTANDING_GROUPS {
            return;
        }
        let oldest = self
            .groups
            .iter()
            .filter(|(id, _)| **id != just_inserted)
            .min_by_key(|(_, g)| g.first_sent_at)
            .map(|(id, _)| *id);
        if let Some(oldest) = oldest {
            self.groups.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{Fragment, FragmentFlags};
    use bytes::Bytes;
    use std::time::Duration;

    fn fragment(group_id: u64, index: u16) -> Fragment {
        Fragment {
            version: 1,
            flags: FragmentFlags { is_fragment: true, is_first: index == 0, is_last: false, needs_ack: true },
            group_id,
            fragment_index: index,
            total_fragments: 2,
            original_size: 10,
            sequence_num: index,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledge_removes_tracking() {
        let mut buf = UdpSendBuffer::new();
        let now = Instant::now();
        buf.insert(1, fragment(1, 0), now);
        assert_eq!(buf.outstanding_groups(), 1);
        buf.acknowledge(1, 0);
        assert_eq!(buf.outstanding_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn due_fragments_resend_until_retry_cap_then_abandon() {
        let mut buf = UdpSendBuffer::new();
        let now = Instant::now();
        buf.insert(5, fragment(5, 0), now);

        let rto = Duration::from_millis(200);
        for _ in 0..MAX_RETRIES {
            tokio::time::advance(rto + Duration::from_millis(1)).await;
            let due = buf.due_for_retransmit(rto, Instant::now());
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].2, RetransmitOutcome::Resend);
        }

        tokio::time::advance(rto + Duration::from_millis(1)).await;
        let due = buf.due_for_retransmit(rto, Instant::now());
        assert_eq!(due[0].2, RetransmitOutcome::Abandon);
        assert_eq!(buf.outstanding_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_oldest_group() {
        let mut buf = UdpSendBuffer::new();
        let base = Instant::now();
        for i in 0..MAX_OUTSTANDING_GROUPS as u64 {
            buf.insert(i, fragment(i, 0), base + Duration::from_millis(i));
        }
        assert_eq!(buf.outstanding_groups(), MAX_OUTSTANDING_GROUPS);
        buf.insert(999, fragment(999, 0), base + Duration::from_millis(1000));
        assert_eq!(buf.outstanding_groups(), MAX_OUTSTANDING_GROUPS);
        assert!(buf.groups.get(&0).is_none());
        assert!(buf.groups.contains_key(&999));
    }
}
