//! Process-wide id generators.
//!
//! Request ids must be unique across every connection the process owns so a
//! reply can never complete the wrong waiter; producer/consumer ids are
//! broker-scoped but drawing them from one counter keeps logs unambiguous.
//! Sequence ids share the same property so a pending queue dequeues in
//! strictly increasing order.

use std::sync::atomic::{AtomicU64, Ordering};

static REQUEST_IDS: AtomicU64 = AtomicU64::new(1);
static PRODUCER_IDS: AtomicU64 = AtomicU64::new(0);
static CONSUMER_IDS: AtomicU64 = AtomicU64::new(0);
static SEQUENCE_IDS: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_request_id() -> u64 {
    REQUEST_IDS.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn next_producer_id() -> u64 {
    PRODUCER_IDS.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn next_consumer_id() -> u64 {
    CONSUMER_IDS.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn next_sequence_id() -> u64 {
    SEQUENCE_IDS.fetch_add(1, Ordering::Relaxed)
}
