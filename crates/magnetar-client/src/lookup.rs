//! Topic-to-broker resolution over a pooled connection to the service URL.

use crate::backoff::Backoff;
use crate::config::ServiceUri;
use crate::connection::BrokerAddress;
use crate::error::{Error, Result};
use crate::ids;
use crate::pool::ConnectionPool;
use magnetar_protocol::commands;
use magnetar_protocol::proto::{CommandType, LookupType, PartitionedResponse, TopicsMode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A lookup answer may bounce between brokers a few times while ownership
/// settles; past this many hops the topic is declared unresolvable.
const MAX_LOOKUP_REDIRECTS: usize = 20;

pub struct LookupService {
    pool: Arc<ConnectionPool>,
    service_uri: ServiceUri,
    service_url: String,
    operation_timeout: Duration,
}

impl LookupService {
    pub fn new(
        pool: Arc<ConnectionPool>,
        service_uri: ServiceUri,
        service_url: String,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            service_uri,
            service_url,
            operation_timeout,
        }
    }

    /// The endpoint lookups themselves are issued against.
    pub fn service_address(&self) -> BrokerAddress {
        BrokerAddress {
            logical: self.service_url.clone(),
            physical: self.service_uri.address(),
            proxy: false,
        }
    }

    /// Resolve the broker owning `topic`, following redirects. Retries
    /// retriable failures under backoff until the operation budget runs out.
    pub async fn lookup_topic(&self, topic: &str) -> Result<BrokerAddress> {
        self.with_retry("lookup", || self.lookup_once(topic)).await
    }

    async fn lookup_once(&self, topic: &str) -> Result<BrokerAddress> {
        let mut target = self.service_address();
        let mut authoritative = false;

        for _ in 0..MAX_LOOKUP_REDIRECTS {
            let conn = self.pool.get_connection(&target).await?;
            let request_id = ids::next_request_id();
            let response = tokio::time::timeout(
                self.operation_timeout,
                conn.send_request(request_id, commands::lookup(request_id, topic, authoritative)),
            )
            .await
            .map_err(|_| Error::Timeout(format!("lookup of {}", topic)))??;

            if response.r#type != CommandType::LookupResponse as i32 {
                return Err(Error::UnexpectedResponse("LOOKUP_RESPONSE"));
            }
            let lookup = response
                .lookup_topic_response
                .ok_or(Error::UnexpectedResponse("LOOKUP_RESPONSE"))?;

            match LookupType::try_from(lookup.response.unwrap_or(LookupType::Failed as i32)) {
                Ok(LookupType::Connect) => {
                    let logical = lookup
                        .broker_service_url
                        .ok_or_else(|| Error::LookupFailed("response without broker URL".into()))?;
                    let proxy = lookup.proxy_through_service_url.unwrap_or(false);
                    let physical = if proxy {
                        self.service_uri.address()
                    } else {
                        ServiceUri::parse(&logical)?.address()
                    };
                    return Ok(BrokerAddress {
                        logical,
                        physical,
                        proxy,
                    });
                }
                Ok(LookupType::Redirect) => {
                    let next = lookup
                        .broker_service_url
                        .ok_or_else(|| Error::LookupFailed("redirect without broker URL".into()))?;
                    authoritative = lookup.authoritative.unwrap_or(false);
                    debug!(topic, next = %next, authoritative, "following lookup redirect");
                    target = BrokerAddress {
                        physical: ServiceUri::parse(&next)?.address(),
                        logical: next,
                        proxy: false,
                    };
                }
                _ => {
                    return Err(match lookup.error {
                        Some(kind) => Error::from_server_error(
                            kind,
                            lookup.message.unwrap_or_default(),
                        ),
                        None => Error::LookupFailed(format!("lookup of {} failed", topic)),
                    });
                }
            }
        }
        Err(Error::LookupFailed(format!(
            "{} not resolved after {} redirects",
            topic, MAX_LOOKUP_REDIRECTS
        )))
    }

    /// Number of partitions of `topic`; zero means non-partitioned.
    pub async fn partitioned_topic_metadata(&self, topic: &str) -> Result<u32> {
        self.with_retry("partitioned metadata", || async {
            let conn = self.pool.get_connection(&self.service_address()).await?;
            let request_id = ids::next_request_id();
            let response = tokio::time::timeout(
                self.operation_timeout,
                conn.send_request(request_id, commands::partitioned_metadata(request_id, topic)),
            )
            .await
            .map_err(|_| Error::Timeout(format!("partitioned metadata of {}", topic)))??;

            let metadata = response
                .partition_metadata_response
                .ok_or(Error::UnexpectedResponse("PARTITIONED_METADATA_RESPONSE"))?;
            match PartitionedResponse::try_from(
                metadata.response.unwrap_or(PartitionedResponse::Failed as i32),
            ) {
                Ok(PartitionedResponse::Success) => Ok(metadata.partitions.unwrap_or(0)),
                _ => Err(match metadata.error {
                    Some(kind) => {
                        Error::from_server_error(kind, metadata.message.unwrap_or_default())
                    }
                    None => Error::BrokerMetadataError(format!("metadata of {} failed", topic)),
                }),
            }
        })
        .await
    }

    /// All topics under `tenant/namespace`, filtered by domain.
    pub async fn topics_of_namespace(
        &self,
        namespace: &str,
        mode: TopicsMode,
    ) -> Result<Vec<String>> {
        self.with_retry("namespace topics", || async {
            let conn = self.pool.get_connection(&self.service_address()).await?;
            let request_id = ids::next_request_id();
            let response = tokio::time::timeout(
                self.operation_timeout,
                conn.send_request(
                    request_id,
                    commands::get_topics_of_namespace(request_id, namespace, mode),
                ),
            )
            .await
            .map_err(|_| Error::Timeout(format!("topics of {}", namespace)))??;

            let topics = response
                .get_topics_of_namespace_response
                .ok_or(Error::UnexpectedResponse("GET_TOPICS_OF_NAMESPACE_RESPONSE"))?;
            Ok(topics.topics)
        })
        .await
    }

    /// Run `attempt` until it succeeds, fails fatally, or the operation
    /// budget is spent; the final failure after exhaustion is `Timeout`.
    async fn with_retry<T, F, Fut>(&self, what: &str, attempt: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = Backoff::for_reconnect(self.operation_timeout);
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() => match backoff.next() {
                    Some(delay) => {
                        warn!(error = %e, delay_ms = delay.as_millis() as u64, "{} failed, retrying", what);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(Error::Timeout(format!("{} retries exhausted", what))),
                },
                Err(e) => return Err(e),
            }
        }
    }
}
