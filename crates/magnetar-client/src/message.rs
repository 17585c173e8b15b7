//! Message model: ids, payloads, the producer-side builder, and the shared
//! per-batch ack bitmap.

use bytes::Bytes;
use magnetar_protocol::proto::MessageIdData;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

// ============================================================================
// MessageId
// ============================================================================

/// Position of a sub-message inside a received batch.
#[derive(Debug, Clone)]
pub struct BatchPosition {
    pub index: i32,
    /// Shared across every sub-id exploded from one batch entry; absent on
    /// producer-side ids and on entry-level ids.
    pub acker: Option<Arc<BatchAcker>>,
}

/// Identifies a message stored on the broker.
///
/// Ordering is lexicographic on `(ledger, entry, batch index)`; ledger and
/// entry compare as signed so the `-1` sentinels of [`MessageId::earliest`]
/// sort before real positions. An entry-level id (no batch position) sorts
/// after every sub-message of the same entry, so cumulative operations on it
/// cover the whole batch.
#[derive(Debug, Clone)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition: i32,
    pub batch: Option<BatchPosition>,
    pub topic: String,
}

impl MessageId {
    /// Sentinel naming the first available message (`-1:-1` on the wire).
    pub fn earliest() -> Self {
        Self {
            ledger_id: u64::MAX,
            entry_id: u64::MAX,
            partition: -1,
            batch: None,
            topic: String::new(),
        }
    }

    /// Sentinel naming the position right after the last published message.
    pub fn latest() -> Self {
        Self {
            ledger_id: i64::MAX as u64,
            entry_id: i64::MAX as u64,
            partition: -1,
            batch: None,
            topic: String::new(),
        }
    }

    pub fn batch_index(&self) -> Option<i32> {
        self.batch.as_ref().map(|b| b.index)
    }

    /// The id of the whole broker entry this message came from (drops any
    /// batch position).
    pub fn entry_level(&self) -> MessageId {
        MessageId {
            ledger_id: self.ledger_id,
            entry_id: self.entry_id,
            partition: self.partition,
            batch: None,
            topic: self.topic.clone(),
        }
    }

    /// Entry id `-1` on the wire means the topic holds no messages yet.
    pub fn is_unset(&self) -> bool {
        self.entry_id == u64::MAX
    }

    pub fn from_proto(data: &MessageIdData, topic: &str) -> Self {
        let batch = match data.batch_index {
            Some(i) if i >= 0 => Some(BatchPosition {
                index: i,
                acker: None,
            }),
            _ => None,
        };
        Self {
            ledger_id: data.ledger_id,
            entry_id: data.entry_id,
            partition: data.partition.unwrap_or(-1),
            batch,
            topic: topic.to_string(),
        }
    }

    pub fn to_proto(&self) -> MessageIdData {
        MessageIdData {
            ledger_id: self.ledger_id,
            entry_id: self.entry_id,
            partition: Some(self.partition),
            batch_index: self.batch_index(),
            ack_set: Vec::new(),
            batch_size: None,
        }
    }

    fn sort_key(&self) -> (i64, i64, i64) {
        // Entry-level ids rank above their own sub-messages.
        let batch = self
            .batch_index()
            .map(|i| i as i64)
            .unwrap_or(i64::MAX);
        (self.ledger_id as i64, self.entry_id as i64, batch)
    }
}

impl PartialEq for MessageId {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key() && self.partition == other.partition
    }
}

impl Eq for MessageId {}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then(self.partition.cmp(&other.partition))
    }
}

impl Hash for MessageId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sort_key().hash(state);
        self.partition.hash(state);
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.batch_index() {
            Some(i) => write!(
                f,
                "{}:{}:{}:{}",
                self.ledger_id as i64, self.entry_id as i64, self.partition, i
            ),
            None => write!(
                f,
                "{}:{}:{}",
                self.ledger_id as i64, self.entry_id as i64, self.partition
            ),
        }
    }
}

// ============================================================================
// BatchAcker
// ============================================================================

/// Bitmap of individually acked sub-messages of one received batch.
///
/// Shared by `Arc` between every [`MessageId`] exploded from the batch; the
/// single network ack for the entry is gated on [`BatchAcker::all_acked`].
/// Invariant: `popcount(bits) + outstanding == size`.
#[derive(Debug)]
pub struct BatchAcker {
    size: usize,
    bits: Vec<AtomicU64>,
    outstanding: AtomicUsize,
    prev_batch_cumulatively_acked: AtomicBool,
}

impl BatchAcker {
    pub fn new(size: usize) -> Self {
        let words = size.div_ceil(64);
        Self {
            size,
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            outstanding: AtomicUsize::new(size),
            prev_batch_cumulatively_acked: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Mark one sub-message acked. Returns false when the index was already
    /// acked (or out of range), so callers never double-count.
    pub fn ack(&self, index: i32) -> bool {
        if index < 0 || index as usize >= self.size {
            return false;
        }
        let (word, bit) = (index as usize / 64, index as usize % 64);
        let prev = self.bits[word].fetch_or(1 << bit, AtomicOrdering::AcqRel);
        if prev & (1 << bit) != 0 {
            return false;
        }
        self.outstanding.fetch_sub(1, AtomicOrdering::AcqRel);
        true
    }

    pub fn all_acked(&self) -> bool {
        self.outstanding.load(AtomicOrdering::Acquire) == 0
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(AtomicOrdering::Acquire)
    }

    pub fn prev_batch_cumulatively_acked(&self) -> bool {
        self.prev_batch_cumulatively_acked
            .load(AtomicOrdering::Acquire)
    }

    pub fn set_prev_batch_cumulatively_acked(&self) {
        self.prev_batch_cumulatively_acked
            .store(true, AtomicOrdering::Release);
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A message delivered to a consumer. Immutable once queued.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub payload: Bytes,
    pub key: Option<String>,
    pub properties: HashMap<String, String>,
    pub publish_time: u64,
    pub event_time: Option<u64>,
    pub producer_name: String,
    pub redelivery_count: u32,
}

/// A message handed to [`Producer::send`](crate::producer::Producer::send).
#[derive(Debug, Clone, Default)]
pub struct ProducerMessage {
    pub payload: Bytes,
    pub key: Option<String>,
    pub ordering_key: Option<Vec<u8>>,
    pub properties: HashMap<String, String>,
    pub event_time: Option<u64>,
    pub deliver_at: Option<i64>,
}

impl From<Bytes> for ProducerMessage {
    fn from(payload: Bytes) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }
}

impl From<Vec<u8>> for ProducerMessage {
    fn from(payload: Vec<u8>) -> Self {
        Bytes::from(payload).into()
    }
}

impl From<String> for ProducerMessage {
    fn from(payload: String) -> Self {
        Bytes::from(payload).into()
    }
}

impl From<&str> for ProducerMessage {
    fn from(payload: &str) -> Self {
        Bytes::copy_from_slice(payload.as_bytes()).into()
    }
}

impl From<&[u8]> for ProducerMessage {
    fn from(payload: &[u8]) -> Self {
        Bytes::copy_from_slice(payload).into()
    }
}

/// Fluent constructor for outgoing messages.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    message: ProducerMessage,
}

impl MessageBuilder {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            message: ProducerMessage {
                payload: payload.into(),
                ..Default::default()
            },
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.message.key = Some(key.into());
        self
    }

    pub fn ordering_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.message.ordering_key = Some(key.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, props: HashMap<String, String>) -> Self {
        self.message.properties.extend(props);
        self
    }

    /// Application-assigned event timestamp (epoch millis).
    pub fn event_time(mut self, millis: u64) -> Self {
        self.message.event_time = Some(millis);
        self
    }

    /// Earliest delivery time (epoch millis); forwarded in metadata for
    /// brokers that support scheduled delivery.
    pub fn deliver_at(mut self, millis: i64) -> Self {
        self.message.deliver_at = Some(millis);
        self
    }

    pub fn build(self) -> ProducerMessage {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(ledger: u64, entry: u64, batch: Option<i32>) -> MessageId {
        MessageId {
            ledger_id: ledger,
            entry_id: entry,
            partition: -1,
            batch: batch.map(|index| BatchPosition { index, acker: None }),
            topic: "t".into(),
        }
    }

    #[test]
    fn test_ordering_lexicographic() {
        assert!(id(1, 1, None) < id(1, 2, None));
        assert!(id(1, 2, None) < id(2, 0, None));
        assert!(id(1, 1, Some(0)) < id(1, 1, Some(1)));
        // The entry-level id covers every sub-message of the entry.
        assert!(id(1, 1, Some(7)) < id(1, 1, None));
        // Earliest sentinel sorts before everything.
        assert!(MessageId::earliest() < id(0, 0, None));
    }

    #[test]
    fn test_proto_roundtrip() {
        let original = id(5, 9, Some(3));
        let restored = MessageId::from_proto(&original.to_proto(), "t");
        assert_eq!(restored, original);
        assert_eq!(restored.batch_index(), Some(3));

        let unbatched = MessageId::from_proto(&id(5, 9, None).to_proto(), "t");
        assert_eq!(unbatched.batch_index(), None);
    }

    #[test]
    fn test_batch_acker_invariant() {
        let acker = BatchAcker::new(10);
        assert!(!acker.all_acked());

        for i in 0..10 {
            assert!(acker.ack(i));
            // Double-ack must not double-count.
            assert!(!acker.ack(i));
            assert_eq!(acker.outstanding(), 10 - (i as usize + 1));
        }
        assert!(acker.all_acked());
    }

    #[test]
    fn test_batch_acker_out_of_range() {
        let acker = BatchAcker::new(3);
        assert!(!acker.ack(-1));
        assert!(!acker.ack(3));
        assert_eq!(acker.outstanding(), 3);
    }

    #[test]
    fn test_builder() {
        let msg = MessageBuilder::new("payload")
            .key("C#")
            .property("1", "one")
            .event_time(42)
            .build();
        assert_eq!(&msg.payload[..], b"payload");
        assert_eq!(msg.key.as_deref(), Some("C#"));
        assert_eq!(msg.properties.get("1").map(String::as_str), Some("one"));
        assert_eq!(msg.event_time, Some(42));
    }
}
