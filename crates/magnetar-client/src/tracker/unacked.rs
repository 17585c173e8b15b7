//! Time-bucketed tracking of delivered-but-unacked messages.

use crate::message::MessageId;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

/// Logical ring of buckets advanced one step per tick. A message enters the
/// head bucket on delivery and, if still present when its bucket reaches the
/// tail (after `ack_timeout` has elapsed), falls out for redelivery.
///
/// `AckTimeout == 0` constructs the disabled instance, where every call is
/// a no-op.
pub(crate) enum UnackedMessageTracker {
    Disabled,
    Enabled {
        /// Front bucket is the head (receives adds), back is the tail
        /// (drained on tick).
        buckets: VecDeque<HashSet<MessageId>>,
    },
}

impl UnackedMessageTracker {
    pub fn new(ack_timeout: Duration, tick_time: Duration) -> Self {
        if ack_timeout.is_zero() {
            return Self::Disabled;
        }
        // Enough buckets that a message survives at least ack_timeout and
        // at most ack_timeout + tick_time before expiring.
        let count = (ack_timeout.as_millis() / tick_time.as_millis().max(1)) as usize + 1;
        Self::Enabled {
            buckets: (0..count.max(2)).map(|_| HashSet::new()).collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    pub fn add(&mut self, id: MessageId) {
        if let Self::Enabled { buckets } = self {
            if let Some(head) = buckets.front_mut() {
                head.insert(id);
            }
        }
    }

    pub fn remove(&mut self, id: &MessageId) {
        if let Self::Enabled { buckets } = self {
            for bucket in buckets.iter_mut() {
                if bucket.remove(id) {
                    return;
                }
            }
        }
    }

    /// Remove every id up to and including `id`; returns how many went.
    pub fn remove_until(&mut self, id: &MessageId) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Enabled { buckets } => {
                let mut removed = 0;
                for bucket in buckets.iter_mut() {
                    let before = bucket.len();
                    bucket.retain(|m| m > id);
                    removed += before - bucket.len();
                }
                removed
            }
        }
    }

    pub fn clear(&mut self) {
        if let Self::Enabled { buckets } = self {
            for bucket in buckets.iter_mut() {
                bucket.clear();
            }
        }
    }

    /// Rotate the ring: the tail bucket's survivors are handed back for
    /// redelivery and its storage becomes the new head.
    pub fn tick(&mut self) -> Vec<MessageId> {
        match self {
            Self::Disabled => Vec::new(),
            Self::Enabled { buckets } => {
                let mut tail = buckets.pop_back().unwrap_or_default();
                let expired: Vec<_> = tail.drain().collect();
                buckets.push_front(tail);
                expired
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(entry: u64) -> MessageId {
        MessageId {
            ledger_id: 1,
            entry_id: entry,
            partition: -1,
            batch: None,
            topic: "t".into(),
        }
    }

    #[test]
    fn test_disabled_is_inert() {
        let mut tracker = UnackedMessageTracker::new(Duration::ZERO, Duration::from_millis(10));
        assert!(!tracker.is_enabled());
        tracker.add(id(1));
        assert!(tracker.tick().is_empty());
        assert_eq!(tracker.remove_until(&id(10)), 0);
    }

    #[test]
    fn test_expiry_after_full_rotation() {
        // 30ms timeout, 10ms tick: 4 buckets, expiry on the 4th tick.
        let mut tracker =
            UnackedMessageTracker::new(Duration::from_millis(30), Duration::from_millis(10));
        tracker.add(id(1));

        for _ in 0..3 {
            assert!(tracker.tick().is_empty());
        }
        let expired = tracker.tick();
        assert_eq!(expired, vec![id(1)]);
        // Exactly once.
        assert!(tracker.tick().is_empty());
    }

    #[test]
    fn test_acked_messages_do_not_expire() {
        let mut tracker =
            UnackedMessageTracker::new(Duration::from_millis(20), Duration::from_millis(10));
        tracker.add(id(1));
        tracker.add(id(2));
        tracker.tick();
        tracker.remove(&id(1));

        let mut expired = Vec::new();
        for _ in 0..4 {
            expired.extend(tracker.tick());
        }
        assert_eq!(expired, vec![id(2)]);
    }

    #[test]
    fn test_remove_until_spans_buckets() {
        let mut tracker =
            UnackedMessageTracker::new(Duration::from_millis(30), Duration::from_millis(10));
        tracker.add(id(1));
        tracker.tick();
        tracker.add(id(2));
        tracker.tick();
        tracker.add(id(5));

        assert_eq!(tracker.remove_until(&id(2)), 2);
        let mut survivors = Vec::new();
        for _ in 0..5 {
            survivors.extend(tracker.tick());
        }
        assert_eq!(survivors, vec![id(5)]);
    }
}
