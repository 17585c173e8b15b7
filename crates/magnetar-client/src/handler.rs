//! Per-engine reconnection state machine.
//!
//! Each producer/consumer actor owns one handler. The handler resolves the
//! topic's broker, acquires the pooled connection, and classifies failures:
//! retriable ones schedule another attempt under backoff, fatal ones park
//! the engine in `Failed`. Only the owning actor ever touches the state.

use crate::backoff::Backoff;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::lookup::LookupService;
use crate::pool::ConnectionPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub(crate) enum ConnectionState {
    Initializing,
    Connecting,
    Ready(Arc<Connection>),
    Reconnecting,
    Closing,
    Closed,
    Failed,
    Terminated,
}

impl ConnectionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Connecting => "Connecting",
            Self::Ready(_) => "Ready",
            Self::Reconnecting => "Reconnecting",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
        }
    }
}

pub(crate) struct ConnectionHandler {
    name: String,
    topic: String,
    lookup: Arc<LookupService>,
    pool: Arc<ConnectionPool>,
    state: ConnectionState,
    backoff: Backoff,
    /// Counts successful (re)connections, for log correlation.
    epoch: u64,
}

impl ConnectionHandler {
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        lookup: Arc<LookupService>,
        pool: Arc<ConnectionPool>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            lookup,
            pool,
            state: ConnectionState::Initializing,
            backoff: Backoff::for_reconnect(operation_timeout),
            epoch: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        debug!(
            entity = %self.name,
            from = self.state.name(),
            to = state.name(),
            "state transition"
        );
        self.state = state;
    }

    /// The live connection, or the state-appropriate error.
    pub fn connection(&self) -> Result<Arc<Connection>> {
        match &self.state {
            ConnectionState::Ready(conn) => Ok(Arc::clone(conn)),
            _ => Err(self.state_error()),
        }
    }

    /// Raise if the engine cannot serve application calls right now.
    pub fn check_if_active(&self) -> Result<()> {
        match self.state {
            ConnectionState::Ready(_) => Ok(()),
            _ => Err(self.state_error()),
        }
    }

    fn state_error(&self) -> Error {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => Error::AlreadyClosed,
            ConnectionState::Failed => {
                Error::ConnectionFailed(format!("{} gave up reconnecting", self.name))
            }
            ConnectionState::Terminated => Error::TopicTerminated,
            _ => Error::NotConnected,
        }
    }

    /// Lookup → pool → `Ready`. The engine performs its own registration
    /// (PRODUCER / SUBSCRIBE) afterwards; a failure there is fed back into
    /// [`ConnectionHandler::next_reconnect_delay`] like any other.
    pub async fn grab_connection(&mut self) -> Result<Arc<Connection>> {
        match self.state {
            ConnectionState::Initializing | ConnectionState::Reconnecting => {
                self.set_state(ConnectionState::Connecting)
            }
            ConnectionState::Connecting => {}
            _ => return Err(self.state_error()),
        }

        let addr = self.lookup.lookup_topic(&self.topic).await?;
        let connection = self.pool.get_connection(&addr).await?;
        self.epoch += 1;
        self.backoff.reset();
        info!(
            entity = %self.name,
            broker = %addr.physical,
            epoch = self.epoch,
            "connected"
        );
        self.set_state(ConnectionState::Ready(Arc::clone(&connection)));
        Ok(connection)
    }

    /// React to the death of `conn_id`. Returns true when this was the
    /// current connection and the engine should start reconnecting.
    pub fn connection_closed(&mut self, conn_id: u64) -> bool {
        match &self.state {
            ConnectionState::Ready(current) if current.id() == conn_id => {
                warn!(entity = %self.name, connection = conn_id, "connection lost");
                self.set_state(ConnectionState::Reconnecting);
                true
            }
            _ => false,
        }
    }

    /// Classify a connect/registration failure. `Some(delay)` means retry
    /// after that long; `None` means the error was fatal or the backoff
    /// budget is spent, and the state is already `Failed`.
    pub fn next_reconnect_delay(&mut self, error: &Error) -> Option<Duration> {
        if !error.is_retriable() {
            warn!(entity = %self.name, error = %error, "fatal connection error");
            self.set_state(ConnectionState::Failed);
            return None;
        }
        match self.backoff.next() {
            Some(delay) => {
                self.set_state(ConnectionState::Reconnecting);
                debug!(
                    entity = %self.name,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "scheduling reconnect"
                );
                Some(delay)
            }
            None => {
                warn!(entity = %self.name, error = %error, "reconnect budget exhausted");
                self.set_state(ConnectionState::Failed);
                None
            }
        }
    }

    pub fn is_closing_or_closed(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, ServiceUri};

    fn handler() -> ConnectionHandler {
        let config = ClientConfig::default();
        let pool = Arc::new(ConnectionPool::new(&config));
        let lookup = Arc::new(LookupService::new(
            Arc::clone(&pool),
            ServiceUri::parse(&config.service_url).unwrap(),
            config.service_url.clone(),
            Duration::from_millis(10),
        ));
        ConnectionHandler::new(
            "producer(test)",
            "persistent://a/b/c",
            lookup,
            pool,
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_check_if_active_by_state() {
        let mut h = handler();
        assert!(matches!(h.check_if_active(), Err(Error::NotConnected)));

        h.set_state(ConnectionState::Closing);
        assert!(matches!(h.check_if_active(), Err(Error::AlreadyClosed)));

        h.set_state(ConnectionState::Terminated);
        assert!(matches!(h.check_if_active(), Err(Error::TopicTerminated)));

        h.set_state(ConnectionState::Failed);
        assert!(matches!(h.check_if_active(), Err(Error::ConnectionFailed(_))));
    }

    #[test]
    fn test_fatal_error_fails_immediately() {
        let mut h = handler();
        assert!(h.next_reconnect_delay(&Error::TopicTerminated).is_none());
        assert!(matches!(h.state(), ConnectionState::Failed));
    }

    #[test]
    fn test_retriable_error_schedules() {
        let mut h = handler();
        let delay = h.next_reconnect_delay(&Error::NotConnected);
        assert!(delay.is_some());
        assert!(matches!(h.state(), ConnectionState::Reconnecting));
    }
}
