//! # magnetar-client
//!
//! Native async Rust client for Apache-Pulsar-compatible brokers.
//!
//! ## Features
//!
//! - **Async/Await**: built on Tokio; every engine is a single-task actor
//!   driven through a serialized inbox, so no locks guard engine state
//! - **Producers**: ordered sends with batching, compression (LZ4 / Zlib /
//!   Zstd / Snappy), send timeouts, and checksum-verified resend
//! - **Consumers**: flow-controlled push delivery, batch explosion, ack
//!   grouping, ack-timeout and negative-ack redelivery, seek by id or time
//! - **Readers**: non-durable cursors starting from any message id
//! - **Resilience**: per-engine reconnection with exponential backoff and
//!   jitter; pending sends are retransmitted in order after a reconnect
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use magnetar_client::{ClientConfig, ConsumerConfig, MagnetarClient, ProducerConfig};
//!
//! # async fn example() -> magnetar_client::Result<()> {
//! let client = MagnetarClient::new(
//!     ClientConfig::builder()
//!         .service_url("pulsar://localhost:6650")
//!         .build(),
//! )?;
//!
//! let producer = client
//!     .create_producer(ProducerConfig::builder("persistent://public/default/events").build())
//!     .await?;
//! let id = producer.send("hello").await?;
//! println!("published as {}", id);
//!
//! let consumer = client
//!     .subscribe(ConsumerConfig::builder("persistent://public/default/events", "my-sub").build())
//!     .await?;
//! let message = consumer.recv().await?;
//! consumer.ack(&message).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery semantics
//!
//! At-least-once: a message stays tracked until acknowledged, and an ack
//! that never reaches the broker (drop, timeout) results in redelivery.
//! Batch sub-messages acknowledge individually in the client, but the
//! single network ack for a batch leaves only when every sub-message has
//! been acked.

mod backoff;
pub mod client;
pub mod config;
mod connection;
pub mod consumer;
mod error;
mod handler;
mod ids;
mod lookup;
pub mod message;
mod pool;
pub mod producer;
pub mod reader;
pub mod topic;
mod tracker;

pub use client::MagnetarClient;
pub use config::{
    Authentication, ClientConfig, ClientConfigBuilder, ConsumerConfig, ConsumerConfigBuilder,
    HashingScheme, MessageRoutingMode, ProducerConfig, ProducerConfigBuilder, ReaderConfig,
    ReaderConfigBuilder, ServiceUri, SubscriptionInitialPosition, SubscriptionType,
};
pub use consumer::{Consumer, SeekTarget};
pub use error::{Error, Result};
pub use message::{BatchAcker, Message, MessageBuilder, MessageId, ProducerMessage};
pub use producer::Producer;
pub use reader::Reader;
pub use topic::TopicName;

// Wire-level types callers may need when configuring compression or
// inspecting broker errors.
pub use magnetar_protocol::proto::{ServerError, TopicsMode};
pub use magnetar_protocol::CompressionType;
