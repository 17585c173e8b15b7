//! Client facade: owns the connection pool and lookup service, hands out
//! producers, consumers, and readers.

use crate::config::{ClientConfig, ConsumerConfig, ProducerConfig, ReaderConfig};
use crate::consumer::{self, Consumer};
use crate::error::Result;
use crate::lookup::LookupService;
use crate::pool::ConnectionPool;
use crate::producer::{self, Producer};
use crate::reader::{self, Reader};
use crate::topic::TopicName;
use magnetar_protocol::proto::TopicsMode;
use std::sync::Arc;
use tracing::info;

/// Entry point to the library.
///
/// One client shares a connection pool across every producer and consumer
/// it creates; connections are dialed lazily on the first lookup.
///
/// ```rust,ignore
/// use magnetar_client::{MagnetarClient, ClientConfig, ProducerConfig};
///
/// # async fn example() -> magnetar_client::Result<()> {
/// let client = MagnetarClient::new(
///     ClientConfig::builder()
///         .service_url("pulsar://localhost:6650")
///         .build(),
/// )?;
///
/// let producer = client
///     .create_producer(ProducerConfig::builder("persistent://public/default/events").build())
///     .await?;
/// producer.send("hello").await?;
/// # Ok(())
/// # }
/// ```
pub struct MagnetarClient {
    config: ClientConfig,
    pool: Arc<ConnectionPool>,
    lookup: Arc<LookupService>,
}

impl MagnetarClient {
    /// Validate the configuration and build the (lazily connecting) client.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let service_uri = config.validate()?;
        let pool = Arc::new(ConnectionPool::new(&config));
        let lookup = Arc::new(LookupService::new(
            Arc::clone(&pool),
            service_uri,
            config.service_url.clone(),
            config.operation_timeout,
        ));
        info!(service_url = %config.service_url, "client created");
        Ok(Self {
            config,
            pool,
            lookup,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Create a producer on a single topic (or one partition of a
    /// partitioned topic, addressed as `…-partition-N`).
    pub async fn create_producer(&self, config: ProducerConfig) -> Result<Producer> {
        producer::create(
            config,
            Arc::clone(&self.lookup),
            Arc::clone(&self.pool),
            self.config.operation_timeout,
        )
        .await
    }

    /// Subscribe a consumer on a single topic.
    pub async fn subscribe(&self, config: ConsumerConfig) -> Result<Consumer> {
        consumer::create(
            config,
            Arc::clone(&self.lookup),
            Arc::clone(&self.pool),
            self.config.operation_timeout,
        )
        .await
    }

    /// Create a reader starting from the configured message id.
    pub async fn create_reader(&self, config: ReaderConfig) -> Result<Reader> {
        reader::create(
            config,
            Arc::clone(&self.lookup),
            Arc::clone(&self.pool),
            self.config.operation_timeout,
        )
        .await
    }

    /// Number of partitions of `topic`; zero means non-partitioned.
    pub async fn partitioned_topic_metadata(&self, topic: &str) -> Result<u32> {
        TopicName::parse(topic)?;
        self.lookup.partitioned_topic_metadata(topic).await
    }

    /// All topics under `tenant/namespace`.
    pub async fn topics_of_namespace(
        &self,
        namespace: &str,
        mode: TopicsMode,
    ) -> Result<Vec<String>> {
        self.lookup.topics_of_namespace(namespace, mode).await
    }

    /// Tear down every pooled connection. Producers and consumers created
    /// from this client should be closed first.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
