//! Connection sharing: one live [`Connection`] per broker endpoint.

use crate::config::{Authentication, ClientConfig};
use crate::connection::{BrokerAddress, Connection};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Lazily dials one connection per `(host, port)` and hands out shared
/// references. A connection found dead on acquisition is replaced; one with
/// no remaining registrations is closed on [`ConnectionPool::release_if_idle`].
pub struct ConnectionPool {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    auth: Option<Authentication>,
    operation_timeout: Duration,
    keep_alive_interval: Duration,
}

impl ConnectionPool {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            auth: config.authentication.clone(),
            operation_timeout: config.operation_timeout,
            keep_alive_interval: config.keep_alive_interval,
        }
    }

    pub async fn get_connection(&self, addr: &BrokerAddress) -> Result<Arc<Connection>> {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&addr.physical) {
            if existing.is_active() {
                return Ok(Arc::clone(existing));
            }
            debug!(broker = %addr.physical, "replacing dead pooled connection");
            connections.remove(&addr.physical);
        }

        let connection = Connection::connect(
            addr.clone(),
            self.auth.as_ref(),
            self.operation_timeout,
            self.keep_alive_interval,
        )
        .await?;
        connections.insert(addr.physical.clone(), Arc::clone(&connection));
        Ok(connection)
    }

    /// Close the endpoint's connection once the last producer/consumer has
    /// deregistered and nothing is awaiting a reply on it.
    pub async fn release_if_idle(&self, physical: &str) {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(physical) {
            if conn.registered_count() == 0 && conn.pending_count() == 0 {
                debug!(broker = %physical, "closing idle connection");
                conn.close();
                connections.remove(physical);
            }
        }
    }

    pub async fn close(&self) {
        let mut connections = self.connections.lock().await;
        for (_, conn) in connections.drain() {
            conn.close();
        }
    }
}
