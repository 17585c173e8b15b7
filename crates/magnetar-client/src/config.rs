//! Client, producer, consumer, and reader configuration with builders.

use crate::error::{Error, Result};
use crate::message::MessageId;
use magnetar_protocol::proto::{InitialPosition, SubType};
use magnetar_protocol::CompressionType;
use std::time::Duration;

/// Client library version advertised in CONNECT.
pub const CLIENT_VERSION: &str = concat!("magnetar-", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Service URL
// ============================================================================

/// Parsed `pulsar://` / `pulsar+ssl://` service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUri {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

impl ServiceUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let (tls, rest) = if let Some(rest) = raw.strip_prefix("pulsar://") {
            (false, rest)
        } else if let Some(rest) = raw.strip_prefix("pulsar+ssl://") {
            (true, rest)
        } else {
            return Err(Error::InvalidServiceUrl(format!(
                "'{}' must start with pulsar:// or pulsar+ssl://",
                raw
            )));
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::InvalidServiceUrl(format!("'{}' has an invalid port", raw))
                })?;
                (host, port)
            }
            None => (rest, if tls { 6651 } else { 6650 }),
        };
        if host.is_empty() {
            return Err(Error::InvalidServiceUrl(format!("'{}' has no host", raw)));
        }

        Ok(Self {
            tls,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port` form used to dial.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Client configuration
// ============================================================================

/// Authentication material forwarded in CONNECT. The auth providers
/// themselves are external; the client only transports name + data.
#[derive(Debug, Clone)]
pub struct Authentication {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker or proxy endpoint, e.g. `pulsar://localhost:6650`.
    pub service_url: String,
    /// Budget for lookups and producer/consumer creation.
    pub operation_timeout: Duration,
    /// Interval between keep-alive pings on idle connections.
    pub keep_alive_interval: Duration,
    pub use_tls: bool,
    pub tls_hostname_verification: bool,
    pub tls_allow_insecure_connection: bool,
    /// PEM bundle used to verify the broker certificate.
    pub tls_trust_certificate: Option<std::path::PathBuf>,
    pub authentication: Option<Authentication>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_url: "pulsar://localhost:6650".to_string(),
            operation_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(30),
            use_tls: false,
            tls_hostname_verification: true,
            tls_allow_insecure_connection: false,
            tls_trust_certificate: None,
            authentication: None,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<ServiceUri> {
        let uri = ServiceUri::parse(&self.service_url)?;
        if uri.tls && !self.use_tls {
            return Err(Error::InvalidConfiguration(
                "pulsar+ssl:// service URL requires use_tls".into(),
            ));
        }
        Ok(uri)
    }
}

#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn service_url(mut self, url: impl Into<String>) -> Self {
        self.config.service_url = url.into();
        if self.config.service_url.starts_with("pulsar+ssl://") {
            self.config.use_tls = true;
        }
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn use_tls(mut self, enabled: bool) -> Self {
        self.config.use_tls = enabled;
        self
    }

    pub fn tls_hostname_verification(mut self, enabled: bool) -> Self {
        self.config.tls_hostname_verification = enabled;
        self
    }

    pub fn tls_allow_insecure_connection(mut self, allowed: bool) -> Self {
        self.config.tls_allow_insecure_connection = allowed;
        self
    }

    pub fn tls_trust_certificate(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.config.tls_trust_certificate = Some(path.into());
        self
    }

    pub fn authentication(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.config.authentication = Some(Authentication {
            name: name.into(),
            data,
        });
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

// ============================================================================
// Producer configuration
// ============================================================================

/// Partition selection for keyless messages (recognized for API parity; the
/// engines here are per-partition and a router sits above them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageRoutingMode {
    #[default]
    RoundRobin,
    SinglePartition,
    CustomPartition,
}

/// Hash applied to message keys by a partition router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashingScheme {
    #[default]
    JavaStringHash,
    Murmur3,
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub topic: String,
    /// Broker generates a name when unset.
    pub producer_name: Option<String>,
    /// Sends beyond this many unacknowledged messages fail with
    /// [`Error::ProducerQueueFull`](crate::Error::ProducerQueueFull).
    pub max_pending_messages: usize,
    pub batching_enabled: bool,
    pub max_messages_per_batch: usize,
    /// A partially-filled batch is sealed after this long.
    pub max_batching_publish_delay: Duration,
    /// Unacknowledged sends older than this fail with `Timeout`;
    /// zero disables the check.
    pub send_timeout: Duration,
    pub compression: CompressionType,
    pub message_routing_mode: MessageRoutingMode,
    pub hashing_scheme: HashingScheme,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            producer_name: None,
            max_pending_messages: 1000,
            batching_enabled: false,
            max_messages_per_batch: 1000,
            max_batching_publish_delay: Duration::from_millis(10),
            send_timeout: Duration::from_secs(30),
            compression: CompressionType::None,
            message_routing_mode: MessageRoutingMode::default(),
            hashing_scheme: HashingScheme::default(),
        }
    }
}

impl ProducerConfig {
    pub fn builder(topic: impl Into<String>) -> ProducerConfigBuilder {
        ProducerConfigBuilder {
            config: ProducerConfig {
                topic: topic.into(),
                ..Default::default()
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        crate::topic::TopicName::parse(&self.topic)?;
        if self.max_pending_messages == 0 {
            return Err(Error::InvalidConfiguration(
                "max_pending_messages must be at least 1".into(),
            ));
        }
        if self.batching_enabled && self.max_messages_per_batch == 0 {
            return Err(Error::InvalidConfiguration(
                "max_messages_per_batch must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn producer_name(mut self, name: impl Into<String>) -> Self {
        self.config.producer_name = Some(name.into());
        self
    }

    pub fn max_pending_messages(mut self, max: usize) -> Self {
        self.config.max_pending_messages = max;
        self
    }

    pub fn batching_enabled(mut self, enabled: bool) -> Self {
        self.config.batching_enabled = enabled;
        self
    }

    pub fn max_messages_per_batch(mut self, max: usize) -> Self {
        self.config.max_messages_per_batch = max;
        self
    }

    pub fn max_batching_publish_delay(mut self, delay: Duration) -> Self {
        self.config.max_batching_publish_delay = delay;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn message_routing_mode(mut self, mode: MessageRoutingMode) -> Self {
        self.config.message_routing_mode = mode;
        self
    }

    pub fn hashing_scheme(mut self, scheme: HashingScheme) -> Self {
        self.config.hashing_scheme = scheme;
        self
    }

    pub fn build(self) -> ProducerConfig {
        self.config
    }
}

// ============================================================================
// Consumer configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionType {
    #[default]
    Exclusive,
    Shared,
    Failover,
    KeyShared,
}

impl SubscriptionType {
    pub fn to_proto(self) -> SubType {
        match self {
            Self::Exclusive => SubType::Exclusive,
            Self::Shared => SubType::Shared,
            Self::Failover => SubType::Failover,
            Self::KeyShared => SubType::KeyShared,
        }
    }

    /// Only these disciplines support targeted redelivery of explicit ids.
    pub fn supports_individual_redelivery(self) -> bool {
        matches!(self, Self::Shared | Self::KeyShared)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionInitialPosition {
    #[default]
    Latest,
    Earliest,
}

impl SubscriptionInitialPosition {
    pub fn to_proto(self) -> InitialPosition {
        match self {
            Self::Latest => InitialPosition::Latest,
            Self::Earliest => InitialPosition::Earliest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub subscription_name: String,
    pub subscription_type: SubscriptionType,
    pub consumer_name: Option<String>,
    /// Credit window granted to the broker; half of it is re-granted at a
    /// time as messages are consumed.
    pub receiver_queue_size: u32,
    pub initial_position: SubscriptionInitialPosition,
    /// Unacked messages older than this are redelivered; zero disables.
    pub ack_timeout: Duration,
    pub ack_timeout_tick_time: Duration,
    /// Acks are coalesced and flushed on this cadence; zero sends every ack
    /// immediately.
    pub acknowledgements_group_time: Duration,
    pub negative_ack_redelivery_delay: Duration,
    pub read_compacted: bool,
    /// Non-durable subscriptions (readers) resume from a client-side
    /// position instead of a broker cursor.
    pub durable: bool,
    /// Resume position for non-durable subscriptions.
    pub start_message_id: Option<MessageId>,
    /// When resuming from `start_message_id`, also deliver the start
    /// message itself.
    pub reset_include_head: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            subscription_name: String::new(),
            subscription_type: SubscriptionType::default(),
            consumer_name: None,
            receiver_queue_size: 1000,
            initial_position: SubscriptionInitialPosition::default(),
            ack_timeout: Duration::ZERO,
            ack_timeout_tick_time: Duration::from_secs(1),
            acknowledgements_group_time: Duration::from_millis(100),
            negative_ack_redelivery_delay: Duration::from_secs(60),
            read_compacted: false,
            durable: true,
            start_message_id: None,
            reset_include_head: false,
        }
    }
}

impl ConsumerConfig {
    pub fn builder(
        topic: impl Into<String>,
        subscription_name: impl Into<String>,
    ) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            config: ConsumerConfig {
                topic: topic.into(),
                subscription_name: subscription_name.into(),
                ..Default::default()
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        crate::topic::TopicName::parse(&self.topic)?;
        if self.subscription_name.is_empty() {
            return Err(Error::InvalidConfiguration(
                "subscription_name must not be empty".into(),
            ));
        }
        if self.receiver_queue_size == 0 {
            return Err(Error::InvalidConfiguration(
                "receiver_queue_size must be at least 1".into(),
            ));
        }
        if !self.ack_timeout.is_zero() && self.ack_timeout < self.ack_timeout_tick_time {
            return Err(Error::InvalidConfiguration(
                "ack_timeout must be at least ack_timeout_tick_time".into(),
            ));
        }
        if !self.durable && self.start_message_id.is_none() {
            return Err(Error::InvalidConfiguration(
                "non-durable subscriptions need a start_message_id".into(),
            ));
        }
        Ok(())
    }
}

pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn subscription_type(mut self, sub_type: SubscriptionType) -> Self {
        self.config.subscription_type = sub_type;
        self
    }

    pub fn consumer_name(mut self, name: impl Into<String>) -> Self {
        self.config.consumer_name = Some(name.into());
        self
    }

    pub fn receiver_queue_size(mut self, size: u32) -> Self {
        self.config.receiver_queue_size = size;
        self
    }

    pub fn initial_position(mut self, position: SubscriptionInitialPosition) -> Self {
        self.config.initial_position = position;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    pub fn ack_timeout_tick_time(mut self, tick: Duration) -> Self {
        self.config.ack_timeout_tick_time = tick;
        self
    }

    pub fn acknowledgements_group_time(mut self, group_time: Duration) -> Self {
        self.config.acknowledgements_group_time = group_time;
        self
    }

    pub fn negative_ack_redelivery_delay(mut self, delay: Duration) -> Self {
        self.config.negative_ack_redelivery_delay = delay;
        self
    }

    pub fn read_compacted(mut self, enabled: bool) -> Self {
        self.config.read_compacted = enabled;
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

// ============================================================================
// Reader configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub topic: String,
    pub start_message_id: MessageId,
    /// Deliver the start message itself, not just its successors.
    pub start_message_id_inclusive: bool,
    pub receiver_queue_size: u32,
    pub read_compacted: bool,
    pub reader_name: Option<String>,
}

impl ReaderConfig {
    pub fn builder(topic: impl Into<String>, start_message_id: MessageId) -> ReaderConfigBuilder {
        ReaderConfigBuilder {
            config: ReaderConfig {
                topic: topic.into(),
                start_message_id,
                start_message_id_inclusive: false,
                receiver_queue_size: 1000,
                read_compacted: false,
                reader_name: None,
            },
        }
    }
}

pub struct ReaderConfigBuilder {
    config: ReaderConfig,
}

impl ReaderConfigBuilder {
    pub fn start_message_id_inclusive(mut self, inclusive: bool) -> Self {
        self.config.start_message_id_inclusive = inclusive;
        self
    }

    pub fn receiver_queue_size(mut self, size: u32) -> Self {
        self.config.receiver_queue_size = size;
        self
    }

    pub fn read_compacted(mut self, enabled: bool) -> Self {
        self.config.read_compacted = enabled;
        self
    }

    pub fn reader_name(mut self, name: impl Into<String>) -> Self {
        self.config.reader_name = Some(name.into());
        self
    }

    pub fn build(self) -> ReaderConfig {
        self.config
    }
}
