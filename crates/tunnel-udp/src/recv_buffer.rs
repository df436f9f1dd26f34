//! Reassembles fragment groups, delivering each completed datagram exactly
//! once even if its last fragment arrives duplicated (loss-driven resend
//! racing with duplicate copies still in flight).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::fragment::Fragment;

/// Groups idle this long without completing are dropped.
pub const GROUP_EXPIRY: std::time::Duration = std::time::Duration::from_secs(30);

struct Group {
    total_fragments: u16,
    original_size: u32,
    fragments: BTreeMap<u16, bytes::Bytes>,
    last_seen: Instant,
    /// Set exactly once, by whichever caller's insert completes the group,
    /// so a racing duplicate fragment can never trigger a second delivery.
    delivered: Arc<AtomicBool>,
}

impl Group {
    fn is_complete(&self) -> bool {
        self.fragments.len() == self.total_fragments as usize
    }

    fn reassemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.original_size as usize);
        for chunk in self.fragments.values() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// Bitmap of which of the first 16 indices, plus the highest index, have
/// been received for a group — used to build outgoing ACKs.
pub struct ReceiptSummary {
    pub bitmap: u16,
    pub highest_received: u16,
}

#[derive(Default)]
pub struct UdpReceiveBuffer {
    groups: DashMap<u64, Group>,
}

impl UdpReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a fragment in. Returns `Some(reassembled_bytes)` exactly once
    /// per group, the first time the group becomes complete; duplicate or
    /// post-completion fragments return `None`.
    pub fn receive(&self, fragment: Fragment, now: Instant) -> Option<Vec<u8>> {
        let mut entry = self.groups.entry(fragment.group_id).or_insert_with(|| Group {
            total_fragments: fragment.total_fragments,
            original_size: fragment.original_size,
            fragments: BTreeMap::new(),
            last_seen: now,
            delivered: Arc::new(AtomicBool::new(false)),
        });

        if entry.delivered.load(Ordering::Acquire) {
            return None;
        }

        entry.last_seen = now;
        entry.fragments.insert(fragment.fragment_index, fragment.payload);

        if entry.is_complete() && entry.delivered.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let data = entry.reassemble();
            drop(entry);
            self.groups.remove(&fragment.group_id);
            return Some(data);
        }

        None
    }

    pub fn receipt_summary(&self, group_id: u64) -> Option<ReceiptSummary> {
        self.groups.get(&group_id).map(|group| {
            let mut bitmap = 0u16;
            let mut highest = 0u16;
            for &index in group.fragments.keys() {
                if index < 16 {
                    bitmap |= 1 << index;
                }
                highest = highest.max(index);
            }
            ReceiptSummary { bitmap, highest_received: highest }
        })
    }

    /// Drops groups that have not received a fragment within [`GROUP_EXPIRY`].
    pub fn expire_stale(&self, now: Instant) {
        self.groups.retain(|_, group| now.duration_since(group.last_seen) < GROUP_EXPIRY);
    }

    pub fn outstanding_groups(&self) -> usize {
        self.groups.len()
    }
}
