//! Deferred redelivery of negatively acknowledged messages.

use crate::message::MessageId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Messages the application rejected, stamped with their redelivery
/// deadline. A tick drains everything whose deadline has passed into one
/// redeliver batch.
pub(crate) struct NegativeAckTracker {
    delay: Duration,
    entries: HashMap<MessageId, Instant>,
}

impl NegativeAckTracker {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            entries: HashMap::new(),
        }
    }

    /// Ticking at a third of the delay keeps redelivery within ~delay*4/3
    /// of the negative ack without a timer per message.
    pub fn tick_interval(&self) -> Duration {
        (self.delay / 3).max(Duration::from_millis(50))
    }

    pub fn add(&mut self, id: MessageId) {
        // Redelivery is entry-granular: one nack of a batch sub-message
        // brings back the whole entry.
        self.entries
            .insert(id.entry_level(), Instant::now() + self.delay);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain every entry whose deadline has passed.
    pub fn drain_due(&mut self) -> Vec<MessageId> {
        let now = Instant::now();
        let due: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            self.entries.remove(id);
        }
        due
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BatchPosition;

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
    fn test_not_due_before_delay() {
        let mut tracker = NegativeAckTracker::new(Duration::from_secs(60));
        tracker.add(id(1));
        assert!(tracker.drain_due().is_empty());
        assert!(!tracker.is_empty());
    }

    #[test]
    fn test_due_after_delay() {
        let mut tracker = NegativeAckTracker::new(Duration::ZERO);
        tracker.add(id(1));
        tracker.add(id(2));
        let mut due = tracker.drain_due();
        due.sort();
        assert_eq!(due, vec![id(1), id(2)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_batch_ids_collapse_to_entry() {
        let mut tracker = NegativeAckTracker::new(Duration::ZERO);
        for index in 0..3 {
            tracker.add(MessageId {
                batch: Some(BatchPosition { index, acker: None }),
                ..id(7)
            });
        }
        assert_eq!(tracker.drain_due(), vec![id(7)]);
    }

    #[test]
    fn test_tick_interval_bounds() {
        assert_eq!(
            NegativeAckTracker::new(Duration::from_secs(60)).tick_interval(),
            Duration::from_secs(20)
        );
        assert_eq!(
            NegativeAckTracker::new(Duration::from_millis(30)).tick_interval(),
            Duration::from_millis(50)
        );
    }
}
