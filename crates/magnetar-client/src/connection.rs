//! One framed TCP connection to a broker: request/response correlation plus
//! push routing to the producers and consumers registered on it.
//!
//! The reader task owns dispatch; the writer task serializes the write path.
//! Engines never touch the socket: they post frames through
//! [`Connection::send`] / [`Connection::send_request`] and receive pushes on
//! the inbox channel they registered.

use crate::config::{Authentication, CLIENT_VERSION};
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use magnetar_protocol::proto::{self, BaseCommand, CommandType, MessageMetadata, ServerError};
use magnetar_protocol::{commands, Frame, FrameCodec, ProtocolError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(0);

/// Resolved broker endpoint. `physical` is dialed; when `proxy` is set the
/// `logical` URL travels in CONNECT so the proxy can route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerAddress {
    pub logical: String,
    pub physical: String,
    pub proxy: bool,
}

// ============================================================================
// Push events
// ============================================================================

/// Pushes routed to a producer engine's inbox.
#[derive(Debug)]
pub enum ProducerEvent {
    Receipt(proto::CommandSendReceipt),
    SendError(proto::CommandSendError),
    /// Broker reported a checksum failure for this sequence id.
    RecoverChecksumError(u64),
    /// Broker asked this producer to close (it will reconnect).
    Closed,
    ConnectionClosed(u64),
}

/// Pushes routed to a consumer engine's inbox.
#[derive(Debug)]
pub enum ConsumerEvent {
    Message {
        command: proto::CommandMessage,
        metadata: MessageMetadata,
        payload: Bytes,
    },
    ReachedEndOfTopic,
    /// Broker asked this consumer to close (it will reconnect).
    Closed,
    ConnectionClosed(u64),
}

// ============================================================================
// Connection
// ============================================================================

type Waiter = oneshot::Sender<Result<BaseCommand>>;

#[derive(Default)]
struct Registry {
    pending: Mutex<HashMap<u64, Waiter>>,
    producers: Mutex<HashMap<u64, mpsc::UnboundedSender<ProducerEvent>>>,
    consumers: Mutex<HashMap<u64, mpsc::UnboundedSender<ConsumerEvent>>>,
}

pub struct Connection {
    id: u64,
    addr: BrokerAddress,
    writer_tx: mpsc::UnboundedSender<Frame>,
    registry: Arc<Registry>,
    active: Arc<AtomicBool>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Connection {
    /// Dial, handshake (CONNECT/CONNECTED), then spawn the reader, writer,
    /// and keep-alive tasks.
    pub async fn connect(
        addr: BrokerAddress,
        auth: Option<&Authentication>,
        operation_timeout: Duration,
        keep_alive_interval: Duration,
    ) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(operation_timeout, TcpStream::connect(&addr.physical))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {}", addr.physical)))?
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr.physical, e)))?;
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        let mut framed_read = FramedRead::new(read_half, FrameCodec);
        let mut framed_write = FramedWrite::new(write_half, FrameCodec);

        // Handshake happens inline, before any tasks exist.
        let proxy_url = addr.proxy.then(|| addr.logical.clone());
        let mut connect = commands::connect(CLIENT_VERSION, proxy_url);
        if let (Some(auth), Some(c)) = (auth, connect.connect.as_mut()) {
            c.auth_method_name = Some(auth.name.clone());
            c.auth_data = Some(auth.data.clone());
        }
        framed_write.send(Frame::command(connect)).await?;

        let connected = tokio::time::timeout(operation_timeout, framed_read.next())
            .await
            .map_err(|_| Error::Timeout(format!("CONNECTED from {}", addr.physical)))?
            .ok_or(Error::NotConnected)??;
        match CommandType::try_from(connected.command.r#type) {
            Ok(CommandType::Connected) => {
                debug!(
                    broker = %addr.physical,
                    version = connected
                        .command
                        .connected
                        .as_ref()
                        .map(|c| c.server_version.as_str())
                        .unwrap_or("?"),
                    "broker handshake complete"
                );
            }
            Ok(CommandType::Error) => {
                let e = connected.command.error.unwrap_or_default();
                return Err(Error::from_server_error(e.error, e.message));
            }
            _ => return Err(Error::UnexpectedResponse("CONNECTED")),
        }

        let id = CONNECTION_IDS.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::new(Registry::default());
        let active = Arc::new(AtomicBool::new(true));
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Frame>();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        // Writer task: the single owner of the write half. Dropping it on
        // shutdown closes the socket for the peer.
        let writer_active = Arc::clone(&active);
        let mut writer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = writer_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = framed_write.send(frame).await {
                                warn!(error = %e, "connection write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_shutdown.changed() => break,
                }
            }
            writer_active.store(false, Ordering::Release);
        });

        // Keep-alive task: ping on idle so half-open connections die fast.
        let ping_tx = writer_tx.clone();
        let ping_active = Arc::clone(&active);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keep_alive_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !ping_active.load(Ordering::Acquire) {
                    break;
                }
                if ping_tx.send(Frame::command(commands::ping())).is_err() {
                    break;
                }
            }
        });

        // Reader task: owns dispatch until the socket closes.
        let reader_registry = Arc::clone(&registry);
        let reader_active = Arc::clone(&active);
        let reader_writer_tx = writer_tx.clone();
        let conn_id = id;
        let mut reader_shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = framed_read.next() => next,
                    _ = reader_shutdown.changed() => break,
                };
                match next {
                    Some(Ok(frame)) => {
                        dispatch(conn_id, frame, &reader_registry, &reader_writer_tx)
                    }
                    Some(Err(ProtocolError::ChecksumMismatch {
                        sequence_id,
                        expected,
                        actual,
                    })) => {
                        // The decoder already consumed the frame, so the
                        // stream stays aligned; the corrupt entry is dropped
                        // and the broker will redeliver it unacked.
                        warn!(
                            sequence_id,
                            expected, actual, "discarding frame with bad checksum"
                        );
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "connection read failed");
                        break;
                    }
                    None => {
                        debug!(connection = conn_id, "connection closed by peer");
                        break;
                    }
                }
            }
            reader_active.store(false, Ordering::Release);
            teardown(conn_id, &reader_registry);
        });

        info!(connection = id, broker = %addr.physical, "connection established");
        Ok(Arc::new(Self {
            id,
            addr,
            writer_tx,
            registry,
            active,
            shutdown: shutdown_tx,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &BrokerAddress {
        &self.addr
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Fire-and-forget write. `false` means the connection is gone and the
    /// caller decides what to do about it.
    pub fn send(&self, frame: Frame) -> bool {
        self.is_active() && self.writer_tx.send(frame).is_ok()
    }

    /// Send a command carrying `request_id` and wait for the correlated
    /// reply. Broker `ERROR` replies surface as typed errors.
    pub async fn send_request(&self, request_id: u64, command: BaseCommand) -> Result<BaseCommand> {
        let (tx, rx) = oneshot::channel();
        self.registry
            .pending
            .lock()
            .unwrap()
            .insert(request_id, tx);

        if !self.send(Frame::command(command)) {
            self.registry.pending.lock().unwrap().remove(&request_id);
            return Err(Error::NotConnected);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::NotConnected),
        }
    }

    /// Register the inbox that receives pushes for `producer_id`.
    /// Re-registration after a reconnect replaces the previous entry.
    pub fn register_producer(&self, producer_id: u64, tx: mpsc::UnboundedSender<ProducerEvent>) {
        self.registry
            .producers
            .lock()
            .unwrap()
            .insert(producer_id, tx);
    }

    pub fn register_consumer(&self, consumer_id: u64, tx: mpsc::UnboundedSender<ConsumerEvent>) {
        self.registry
            .consumers
            .lock()
            .unwrap()
            .insert(consumer_id, tx);
    }

    pub fn remove_producer(&self, producer_id: u64) {
        self.registry.producers.lock().unwrap().remove(&producer_id);
    }

    pub fn remove_consumer(&self, consumer_id: u64) {
        self.registry.consumers.lock().unwrap().remove(&consumer_id);
    }

    /// How many engines still route through this connection.
    pub fn registered_count(&self) -> usize {
        self.registry.producers.lock().unwrap().len() + self.registry.consumers.lock().unwrap().len()
    }

    /// In-flight request/response waiters.
    pub fn pending_count(&self) -> usize {
        self.registry.pending.lock().unwrap().len()
    }

    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.shutdown.send(true);
        teardown(self.id, &self.registry);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr.physical)
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

fn dispatch(
    conn_id: u64,
    frame: Frame,
    registry: &Registry,
    writer_tx: &mpsc::UnboundedSender<Frame>,
) {
    let command = frame.command;
    trace!(connection = conn_id, command = command.type_name(), "inbound");

    match CommandType::try_from(command.r#type) {
        Ok(CommandType::Message) => {
            let Some(msg) = command.message else { return };
            let Some(payload) = frame.payload else {
                warn!(consumer = msg.consumer_id, "MESSAGE frame without payload");
                return;
            };
            forward_consumer(
                registry,
                msg.consumer_id,
                ConsumerEvent::Message {
                    command: msg,
                    metadata: payload.metadata,
                    payload: payload.data,
                },
            );
        }
        Ok(CommandType::SendReceipt) => {
            let Some(receipt) = command.send_receipt else { return };
            forward_producer(registry, receipt.producer_id, ProducerEvent::Receipt(receipt));
        }
        Ok(CommandType::SendError) => {
            let Some(send_error) = command.send_error else { return };
            let producer_id = send_error.producer_id;
            let event = if send_error.error == ServerError::ChecksumError as i32 {
                ProducerEvent::RecoverChecksumError(send_error.sequence_id)
            } else {
                ProducerEvent::SendError(send_error)
            };
            forward_producer(registry, producer_id, event);
        }
        Ok(CommandType::CloseProducer) => {
            if let Some(cmd) = command.close_producer {
                forward_producer(registry, cmd.producer_id, ProducerEvent::Closed);
            }
        }
        Ok(CommandType::CloseConsumer) => {
            if let Some(cmd) = command.close_consumer {
                forward_consumer(registry, cmd.consumer_id, ConsumerEvent::Closed);
            }
        }
        Ok(CommandType::ReachedEndOfTopic) => {
            if let Some(cmd) = command.reached_end_of_topic {
                forward_consumer(registry, cmd.consumer_id, ConsumerEvent::ReachedEndOfTopic);
            }
        }
        Ok(CommandType::ActiveConsumerChange) => {
            if let Some(cmd) = command.active_consumer_change {
                debug!(
                    consumer = cmd.consumer_id,
                    active = cmd.is_active.unwrap_or(false),
                    "active consumer change"
                );
            }
        }
        Ok(CommandType::Ping) => {
            let _ = writer_tx.send(Frame::command(commands::pong()));
        }
        Ok(CommandType::Pong) => {}
        _ => {
            // Everything else correlates to an in-flight request.
            match command.request_id() {
                Some(request_id) => {
                    let waiter = registry.pending.lock().unwrap().remove(&request_id);
                    match waiter {
                        Some(tx) => {
                            let result = if command.r#type == CommandType::Error as i32 {
                                let e = command.error.unwrap_or_default();
                                Err(Error::from_server_error(e.error, e.message))
                            } else {
                                Ok(command)
                            };
                            let _ = tx.send(result);
                        }
                        None => {
                            warn!(request_id, command = command.type_name(), "reply for unknown request id");
                        }
                    }
                }
                None => {
                    warn!(command = command.type_name(), "unroutable command");
                }
            }
        }
    }
}

fn forward_producer(registry: &Registry, producer_id: u64, event: ProducerEvent) {
    let tx = registry.producers.lock().unwrap().get(&producer_id).cloned();
    match tx {
        Some(tx) => {
            let _ = tx.send(event);
        }
        None => debug!(producer = producer_id, "push for unregistered producer"),
    }
}

fn forward_consumer(registry: &Registry, consumer_id: u64, event: ConsumerEvent) {
    let tx = registry.consumers.lock().unwrap().get(&consumer_id).cloned();
    match tx {
        Some(tx) => {
            let _ = tx.send(event);
        }
        None => debug!(consumer = consumer_id, "push for unregistered consumer"),
    }
}

/// Fail every waiter and tell every registered engine the connection died.
fn teardown(conn_id: u64, registry: &Registry) {
    for (_, waiter) in registry.pending.lock().unwrap().drain() {
        let _ = waiter.send(Err(Error::NotConnected));
    }
    for (_, tx) in registry.producers.lock().unwrap().drain() {
        let _ = tx.send(ProducerEvent::ConnectionClosed(conn_id));
    }
    for (_, tx) in registry.consumers.lock().unwrap().drain() {
        let _ = tx.send(ConsumerEvent::ConnectionClosed(conn_id));
    }
}
