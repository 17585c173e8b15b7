//! Reader: a non-durable, exclusive view of a topic starting from a
//! caller-provided position.
//!
//! Internally a consumer on a generated `reader-…` subscription with
//! `durable = false`, so the resume position lives client-side and no
//! broker cursor is created. Readers do not acknowledge.

use crate::config::{
    ConsumerConfig, ReaderConfig, SubscriptionType,
};
use crate::consumer::Consumer;
use crate::error::Result;
use crate::lookup::LookupService;
use crate::message::{Message, MessageId};
use crate::pool::ConnectionPool;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

pub struct Reader {
    consumer: Consumer,
}

impl Reader {
    pub fn topic(&self) -> &str {
        self.consumer.topic()
    }

    /// Next message at or after the reader's position.
    pub async fn read_next(&self) -> Result<Message> {
        self.consumer.recv().await
    }

    pub async fn has_message_available(&self) -> Result<bool> {
        self.consumer.has_message_available().await
    }

    /// Reposition to a message id; the inclusivity configured at creation
    /// applies to the new position too.
    pub async fn seek(&self, id: MessageId) -> Result<()> {
        self.consumer.seek(id).await
    }

    pub async fn seek_timestamp(&self, timestamp: u64) -> Result<()> {
        self.consumer.seek_timestamp(timestamp).await
    }

    pub async fn close(&self) -> Result<()> {
        self.consumer.close().await
    }
}

pub(crate) async fn create(
    config: ReaderConfig,
    lookup: Arc<LookupService>,
    pool: Arc<ConnectionPool>,
    operation_timeout: Duration,
) -> Result<Reader> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();

    let consumer_config = ConsumerConfig {
        topic: config.topic,
        subscription_name: format!("reader-{}", suffix),
        subscription_type: SubscriptionType::Exclusive,
        consumer_name: config.reader_name,
        receiver_queue_size: config.receiver_queue_size,
        read_compacted: config.read_compacted,
        durable: false,
        start_message_id: Some(config.start_message_id),
        reset_include_head: config.start_message_id_inclusive,
        ..Default::default()
    };

    let consumer = crate::consumer::create(consumer_config, lookup, pool, operation_timeout).await?;
    Ok(Reader { consumer })
}
