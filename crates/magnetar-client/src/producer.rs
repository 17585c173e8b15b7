//! Producer engine: an actor owning the ordered send pipeline for one
//! topic partition.
//!
//! Every public call posts an operation into the engine's inbox and awaits a
//! reply future; the engine task is the only code that touches the pending
//! queue, the batch accumulator, and the connection state. Broker pushes
//! (receipts, send errors, connection loss) arrive on a second channel the
//! engine registered with the connection.

use crate::config::ProducerConfig;
use crate::connection::ProducerEvent;
use crate::error::{Error, Result};
use crate::handler::{ConnectionHandler, ConnectionState};
use crate::ids;
use crate::lookup::LookupService;
use crate::message::{BatchPosition, MessageId, ProducerMessage};
use crate::pool::ConnectionPool;
use bytes::{Bytes, BytesMut};
use magnetar_protocol::proto::{self, MessageMetadata, ServerError, SingleMessageMetadata};
use magnetar_protocol::{commands, payload_checksum, write_batch_entry, Frame};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type SendReply = oneshot::Sender<Result<MessageId>>;

enum ProducerOp {
    Send {
        message: ProducerMessage,
        reply: Option<SendReply>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
    Reconnect,
    BatchTick,
    SendTimeoutTick,
}

/// Completion side of one wire frame: a single message or a sealed batch.
enum SendCallback {
    Single(Option<SendReply>),
    Batch(Vec<Option<SendReply>>),
}

/// A frame sitting in the pending queue until its receipt arrives.
struct PendingMessage {
    sequence_id: u64,
    metadata: MessageMetadata,
    /// Compressed, wire-ready payload.
    payload: Bytes,
    /// CRC32C of the payload region as built; used to tell in-flight
    /// corruption from local corruption on `RecoverChecksumError`.
    checksum: u32,
    num_messages: Option<i32>,
    callback: SendCallback,
    created_at: Instant,
}

/// Item accumulated into the in-progress batch.
struct BatchItem {
    message: ProducerMessage,
    reply: Option<SendReply>,
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle to a producer engine. Cheap to clone; dropping every handle does
/// not close the producer, [`Producer::close`] does.
#[derive(Clone)]
pub struct Producer {
    topic: String,
    op_tx: mpsc::UnboundedSender<ProducerOp>,
}

impl Producer {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish and wait for the broker receipt.
    pub async fn send(&self, message: impl Into<ProducerMessage>) -> Result<MessageId> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ProducerOp::Send {
                message: message.into(),
                reply: Some(tx),
            })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Publish without waiting for the receipt; resolves once the message
    /// is accepted into the send pipeline.
    pub async fn send_forget(&self, message: impl Into<ProducerMessage>) -> Result<()> {
        self.op_tx
            .send(ProducerOp::Send {
                message: message.into(),
                reply: None,
            })
            .map_err(|_| Error::AlreadyClosed)
    }

    /// Seal and dispatch the in-progress batch immediately.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ProducerOp::Flush { reply: tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ProducerOp::Close { reply: tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }
}

/// Spawn the engine and wait for its first successful broker registration.
pub(crate) async fn create(
    config: ProducerConfig,
    lookup: Arc<LookupService>,
    pool: Arc<ConnectionPool>,
    operation_timeout: Duration,
) -> Result<Producer> {
    config.validate()?;

    let producer_id = ids::next_producer_id();
    let (op_tx, op_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    let handler = ConnectionHandler::new(
        format!("producer({}, {})", producer_id, config.topic),
        config.topic.clone(),
        lookup,
        Arc::clone(&pool),
        operation_timeout,
    );

    let engine = ProducerEngine {
        partition: crate::topic::TopicName::parse(&config.topic)?
            .partition_index()
            .unwrap_or(-1),
        config: config.clone(),
        producer_id,
        producer_name: config.producer_name.clone(),
        handler,
        pool,
        operation_timeout,
        pending: VecDeque::new(),
        batch: Vec::new(),
        op_tx: op_tx.clone(),
        event_tx,
    };
    tokio::spawn(engine.run(op_rx, event_rx, ready_tx));

    ready_rx.await.map_err(|_| Error::AlreadyClosed)??;
    Ok(Producer {
        topic: config.topic,
        op_tx,
    })
}

// ============================================================================
// Engine
// ============================================================================

struct ProducerEngine {
    config: ProducerConfig,
    producer_id: u64,
    /// User-provided or adopted from PRODUCER_SUCCESS.
    producer_name: Option<String>,
    partition: i32,
    handler: ConnectionHandler,
    pool: Arc<ConnectionPool>,
    operation_timeout: Duration,
    pending: VecDeque<PendingMessage>,
    batch: Vec<BatchItem>,
    op_tx: mpsc::UnboundedSender<ProducerOp>,
    event_tx: mpsc::UnboundedSender<ProducerEvent>,
}

impl ProducerEngine {
    async fn run(
        mut self,
        mut op_rx: mpsc::UnboundedReceiver<ProducerOp>,
        mut event_rx: mpsc::UnboundedReceiver<ProducerEvent>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let mut ready = Some(ready);
        self.connect_or_schedule(&mut ready).await;

        self.spawn_tickers();

        loop {
            tokio::select! {
                op = op_rx.recv() => match op {
                    Some(ProducerOp::Send { message, reply }) => self.handle_send(message, reply),
                    Some(ProducerOp::Flush { reply }) => {
                        self.seal_batch();
                        let _ = reply.send(Ok(()));
                    }
                    Some(ProducerOp::Close { reply }) => {
                        let result = self.handle_close().await;
                        let closed = result.is_ok();
                        let _ = reply.send(result);
                        if closed {
                            break;
                        }
                    }
                    Some(ProducerOp::Reconnect) => self.connect_or_schedule(&mut ready).await,
                    Some(ProducerOp::BatchTick) => self.seal_batch(),
                    Some(ProducerOp::SendTimeoutTick) => self.handle_send_timeout(),
                    None => break,
                },
                event = event_rx.recv() => match event {
                    Some(ProducerEvent::Receipt(receipt)) => self.handle_receipt(receipt),
                    Some(ProducerEvent::SendError(e)) => self.handle_send_error(e),
                    Some(ProducerEvent::RecoverChecksumError(seq)) => {
                        self.handle_checksum_recovery(seq)
                    }
                    Some(ProducerEvent::Closed) => self.handle_broker_close(&mut ready),
                    Some(ProducerEvent::ConnectionClosed(conn_id)) => {
                        if self.handler.connection_closed(conn_id) {
                            self.schedule_reconnect(&mut ready, &Error::NotConnected);
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(producer = self.producer_id, "producer engine stopped");
    }

    fn spawn_tickers(&self) {
        if self.config.batching_enabled {
            let tx = self.op_tx.clone();
            let period = self.config.max_batching_publish_delay;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    if tx.send(ProducerOp::BatchTick).is_err() {
                        break;
                    }
                }
            });
        }
        if !self.config.send_timeout.is_zero() {
            let tx = self.op_tx.clone();
            let period = self.config.send_timeout;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    if tx.send(ProducerOp::SendTimeoutTick).is_err() {
                        break;
                    }
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Connection management
    // ------------------------------------------------------------------

    async fn connect_or_schedule(&mut self, ready: &mut Option<oneshot::Sender<Result<()>>>) {
        if self.handler.is_closing_or_closed() {
            return;
        }
        match self.try_connect().await {
            Ok(()) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Err(e) => self.schedule_reconnect(ready, &e),
        }
    }

    /// Lookup, register on the connection, announce ourselves with PRODUCER,
    /// then retransmit the whole pending queue in order.
    async fn try_connect(&mut self) -> Result<()> {
        let conn = self.handler.grab_connection().await?;
        conn.register_producer(self.producer_id, self.event_tx.clone());

        let request_id = ids::next_request_id();
        let command = commands::producer(
            request_id,
            self.producer_id,
            &self.config.topic,
            self.producer_name.clone(),
            self.handler.epoch(),
        );
        let response = tokio::time::timeout(
            self.operation_timeout,
            conn.send_request(request_id, command),
        )
        .await
        .map_err(|_| Error::Timeout("producer registration".into()))??;

        let success = response
            .producer_success
            .ok_or(Error::UnexpectedResponse("PRODUCER_SUCCESS"))?;
        if self.producer_name.is_none() {
            info!(
                producer = self.producer_id,
                name = %success.producer_name,
                "adopted broker-assigned producer name"
            );
        }
        self.producer_name = Some(success.producer_name);

        // Reconnect resend: original frames, original sequence ids, original
        // order.
        for pending in &self.pending {
            conn.send(self.build_frame(pending));
        }
        Ok(())
    }

    fn schedule_reconnect(
        &mut self,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
        error: &Error,
    ) {
        match self.handler.next_reconnect_delay(error) {
            Some(delay) => {
                let tx = self.op_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(ProducerOp::Reconnect);
                });
            }
            None => {
                // Terminal: surface to creation (if still waiting) and to
                // every queued message.
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(self.handler.check_if_active().unwrap_err()));
                }
                self.fail_all(|| Error::ConnectionFailed("reconnect attempts exhausted".into()));
            }
        }
    }

    /// Broker pushed CLOSE_PRODUCER: drop back to reconnecting; a new
    /// lookup decides where this producer lives now.
    fn handle_broker_close(&mut self, ready: &mut Option<oneshot::Sender<Result<()>>>) {
        let conn = match self.handler.state() {
            ConnectionState::Ready(conn) => Arc::clone(conn),
            _ => return,
        };
        conn.remove_producer(self.producer_id);
        self.handler.set_state(ConnectionState::Reconnecting);
        self.schedule_reconnect(ready, &Error::NotConnected);
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    fn handle_send(&mut self, message: ProducerMessage, reply: Option<SendReply>) {
        // Queued sends survive reconnects, but a producer that is closed,
        // failed, or on a terminated topic rejects immediately.
        let rejection = match self.handler.state() {
            ConnectionState::Closing | ConnectionState::Closed => Some(Error::AlreadyClosed),
            ConnectionState::Terminated => Some(Error::TopicTerminated),
            ConnectionState::Failed => {
                Some(Error::ConnectionFailed("producer connection failed".into()))
            }
            _ => None,
        };
        if let Some(e) = rejection {
            if let Some(reply) = reply {
                let _ = reply.send(Err(e));
            }
            return;
        }

        if self.config.batching_enabled {
            self.batch.push(BatchItem { message, reply });
            if self.batch.len() >= self.config.max_messages_per_batch {
                self.seal_batch();
            }
        } else {
            match self.build_single(message, reply) {
                Ok(pending) => self.dispatch(pending),
                Err((e, reply)) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    fn base_metadata(&self, sequence_id: u64) -> MessageMetadata {
        MessageMetadata {
            producer_name: self.producer_name.clone().unwrap_or_default(),
            sequence_id,
            publish_time: now_millis(),
            compression: Some(self.config.compression.to_proto() as i32),
            ..Default::default()
        }
    }

    fn build_single(
        &self,
        message: ProducerMessage,
        reply: Option<SendReply>,
    ) -> std::result::Result<PendingMessage, (Error, Option<SendReply>)> {
        let sequence_id = ids::next_sequence_id();
        let mut metadata = self.base_metadata(sequence_id);
        metadata.uncompressed_size = Some(message.payload.len() as u32);
        metadata.partition_key = message.key;
        metadata.ordering_key = message.ordering_key;
        metadata.event_time = message.event_time;
        metadata.deliver_at_time = message.deliver_at;
        metadata.properties = to_key_values(&message.properties);

        let payload = match self.config.compression.compress(&message.payload) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => return Err((e.into(), reply)),
        };

        let checksum = payload_checksum(&metadata, &payload);
        Ok(PendingMessage {
            sequence_id,
            metadata,
            payload,
            checksum,
            num_messages: None,
            callback: SendCallback::Single(reply),
            created_at: Instant::now(),
        })
    }

    /// Seal the accumulator into one pending frame: each item becomes a
    /// length-prefixed `SingleMessageMetadata` + payload entry, and the
    /// concatenation is compressed as a unit.
    fn seal_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let items = std::mem::take(&mut self.batch);
        let num_messages = items.len() as i32;

        let mut buf = BytesMut::new();
        let mut replies = Vec::with_capacity(items.len());
        for item in items {
            let smm = SingleMessageMetadata {
                payload_size: item.message.payload.len() as i32,
                partition_key: item.message.key.clone(),
                ordering_key: item.message.ordering_key.clone(),
                event_time: item.message.event_time,
                properties: to_key_values(&item.message.properties),
                ..Default::default()
            };
            write_batch_entry(&mut buf, &smm, &item.message.payload);
            replies.push(item.reply);
        }

        let sequence_id = ids::next_sequence_id();
        let mut metadata = self.base_metadata(sequence_id);
        metadata.uncompressed_size = Some(buf.len() as u32);
        metadata.num_messages_in_batch = Some(num_messages);

        let payload = match self.config.compression.compress(&buf) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "batch compression failed");
                let e_msg = e.to_string();
                for reply in replies.into_iter().flatten() {
                    let _ = reply.send(Err(Error::Protocol(
                        magnetar_protocol::ProtocolError::Compression(e_msg.clone()),
                    )));
                }
                return;
            }
        };

        let checksum = payload_checksum(&metadata, &payload);
        debug!(
            producer = self.producer_id,
            sequence_id, num_messages, "sealed batch"
        );
        self.dispatch(PendingMessage {
            sequence_id,
            metadata,
            payload,
            checksum,
            num_messages: Some(num_messages),
            callback: SendCallback::Batch(replies),
            created_at: Instant::now(),
        });
    }

    /// Enqueue (backpressure permitting) and write out when connected.
    fn dispatch(&mut self, pending: PendingMessage) {
        if self.pending.len() >= self.config.max_pending_messages {
            fail_callback(pending.callback, || Error::ProducerQueueFull);
            return;
        }
        if let ConnectionState::Ready(conn) = self.handler.state() {
            conn.send(self.build_frame(&pending));
        }
        self.pending.push_back(pending);
    }

    fn build_frame(&self, pending: &PendingMessage) -> Frame {
        Frame::with_payload(
            commands::send(self.producer_id, pending.sequence_id, pending.num_messages),
            pending.metadata.clone(),
            pending.payload.clone(),
        )
    }

    // ------------------------------------------------------------------
    // Receipts and errors
    // ------------------------------------------------------------------

    /// Head-first receipt matching: the broker acks in send order, so a
    /// receipt ahead of the head means it skipped one of ours.
    fn handle_receipt(&mut self, receipt: proto::CommandSendReceipt) {
        let Some(head_seq) = self.pending.front().map(|p| p.sequence_id) else {
            debug!(
                producer = self.producer_id,
                sequence_id = receipt.sequence_id,
                "receipt with empty pending queue"
            );
            return;
        };

        if receipt.sequence_id > head_seq {
            // The broker acked past our head; force a reconnect so the
            // whole queue is retransmitted.
            warn!(
                producer = self.producer_id,
                receipt = receipt.sequence_id,
                head = head_seq,
                "receipt ahead of pending head, recycling connection"
            );
            if let ConnectionState::Ready(conn) = self.handler.state() {
                conn.close();
            }
            return;
        }
        if receipt.sequence_id < head_seq {
            // Ack for a message the send timeout already failed.
            debug!(
                producer = self.producer_id,
                receipt = receipt.sequence_id,
                head = head_seq,
                "late receipt dropped"
            );
            return;
        }

        let Some(pending) = self.pending.pop_front() else {
            return;
        };
        let message_id = receipt.message_id.unwrap_or_default();
        match pending.callback {
            SendCallback::Single(reply) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(MessageId {
                        ledger_id: message_id.ledger_id,
                        entry_id: message_id.entry_id,
                        partition: self.partition,
                        batch: None,
                        topic: self.config.topic.clone(),
                    }));
                }
            }
            SendCallback::Batch(replies) => {
                for (index, reply) in replies.into_iter().enumerate() {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(MessageId {
                            ledger_id: message_id.ledger_id,
                            entry_id: message_id.entry_id,
                            partition: self.partition,
                            batch: Some(BatchPosition {
                                index: index as i32,
                                acker: None,
                            }),
                            topic: self.config.topic.clone(),
                        }));
                    }
                }
            }
        }
    }

    fn handle_send_error(&mut self, error: proto::CommandSendError) {
        let kind = ServerError::try_from(error.error).unwrap_or(ServerError::UnknownError);
        match kind {
            ServerError::TopicTerminatedError => {
                info!(producer = self.producer_id, "topic terminated");
                self.handler.set_state(ConnectionState::Terminated);
                self.fail_all(|| Error::TopicTerminated);
            }
            ServerError::ProducerBlockedQuotaExceededException => {
                // Broker rejects outright: fail the affected message.
                if self
                    .pending
                    .front()
                    .is_some_and(|p| p.sequence_id == error.sequence_id)
                {
                    if let Some(pending) = self.pending.pop_front() {
                        fail_callback(pending.callback, || {
                            Error::ProducerBlockedQuotaExceededException
                        });
                    }
                }
            }
            kind => {
                // Persistence errors and friends: recycle the connection and
                // let the resend path retry the queue.
                warn!(
                    producer = self.producer_id,
                    error = ?kind,
                    message = %error.message,
                    "send error, recycling connection"
                );
                if let ConnectionState::Ready(conn) = self.handler.state() {
                    conn.close();
                }
            }
        }
    }

    /// The broker saw a corrupt frame for `sequence_id`. If our stored copy
    /// still checksums to what we built, the corruption happened in flight
    /// and resending fixes it; otherwise our buffer is bad and the send
    /// must fail.
    fn handle_checksum_recovery(&mut self, sequence_id: u64) {
        let Some(head) = self.pending.front() else {
            return;
        };
        if head.sequence_id != sequence_id {
            debug!(
                producer = self.producer_id,
                sequence_id, "checksum error for non-head sequence, ignoring"
            );
            return;
        }

        let recomputed = payload_checksum(&head.metadata, &head.payload);
        if recomputed == head.checksum {
            info!(
                producer = self.producer_id,
                sequence_id, "stored frame intact, retransmitting pending queue"
            );
            if let ConnectionState::Ready(conn) = self.handler.state() {
                for pending in &self.pending {
                    conn.send(self.build_frame(pending));
                }
            }
        } else {
            warn!(
                producer = self.producer_id,
                sequence_id, "local payload corrupted, failing send"
            );
            if let Some(pending) = self.pending.pop_front() {
                fail_callback(pending.callback, || Error::ChecksumFailed(sequence_id));
            }
        }
    }

    /// Send-timeout tick: when the head has waited out the budget, the
    /// whole queue fails (everything behind the head is younger but will
    /// not be acked before it).
    fn handle_send_timeout(&mut self) {
        let Some(head) = self.pending.front() else {
            return;
        };
        if head.created_at.elapsed() >= self.config.send_timeout {
            let timed_out = self.pending.len();
            warn!(
                producer = self.producer_id,
                timed_out, "send timeout expired, failing pending queue"
            );
            self.fail_all(|| Error::Timeout("send timeout".into()));
        }
    }

    fn fail_all(&mut self, make_error: impl Fn() -> Error) {
        for pending in self.pending.drain(..) {
            fail_callback(pending.callback, &make_error);
        }
        for item in self.batch.drain(..) {
            if let Some(reply) = item.reply {
                let _ = reply.send(Err(make_error()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    async fn handle_close(&mut self) -> Result<()> {
        if self.handler.is_closing_or_closed() {
            return Ok(());
        }
        // Outstanding work goes out before the producer goes away.
        self.seal_batch();

        let connection = match self.handler.state() {
            ConnectionState::Ready(conn) => Some(Arc::clone(conn)),
            _ => None,
        };
        self.handler.set_state(ConnectionState::Closing);

        if let Some(conn) = connection {
            let request_id = ids::next_request_id();
            let result = tokio::time::timeout(
                self.operation_timeout,
                conn.send_request(request_id, commands::close_producer(request_id, self.producer_id)),
            )
            .await
            .map_err(|_| Error::Timeout("close producer".into()))
            .and_then(|r| r.map(|_| ()));

            if let Err(e) = result {
                // Do not enter Closed: the caller may retry.
                self.handler.set_state(ConnectionState::Ready(Arc::clone(&conn)));
                return Err(e);
            }
            conn.remove_producer(self.producer_id);
            let physical = conn.addr().physical.clone();
            self.pool.release_if_idle(&physical).await;
        }

        self.handler.set_state(ConnectionState::Closed);
        self.fail_all(|| Error::AlreadyClosed);
        info!(producer = self.producer_id, "producer closed");
        Ok(())
    }
}

fn fail_callback(callback: SendCallback, make_error: impl Fn() -> Error) {
    match callback {
        SendCallback::Single(reply) => {
            if let Some(reply) = reply {
                let _ = reply.send(Err(make_error()));
            }
        }
        SendCallback::Batch(replies) => {
            for reply in replies.into_iter().flatten() {
                let _ = reply.send(Err(make_error()));
            }
        }
    }
}

fn to_key_values(properties: &std::collections::HashMap<String, String>) -> Vec<proto::KeyValue> {
    properties
        .iter()
        .map(|(k, v)| proto::KeyValue {
            key: k.clone(),
            value: v.clone(),
        })
        .collect()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
