//! Consumer engine: an actor owning the flow-controlled receive pipeline
//! for one topic partition.
//!
//! The engine task serializes everything: queue and permit accounting, ack
//! tracker state, batch explosion, redelivery, and seek. Public calls post
//! into the inbox; tracker tickers post into the same inbox; broker pushes
//! arrive on the channel registered with the connection.

use crate::config::ConsumerConfig;
use crate::connection::ConsumerEvent;
use crate::error::{Error, Result};
use crate::handler::{ConnectionHandler, ConnectionState};
use crate::ids;
use crate::lookup::LookupService;
use crate::message::{BatchAcker, BatchPosition, Message, MessageId};
use crate::pool::ConnectionPool;
use crate::topic::TopicName;
use crate::tracker::{AckBatch, AckGroupingTracker, NegativeAckTracker, UnackedMessageTracker};
use bytes::Bytes;
use magnetar_protocol::proto::{self, CommandType, MessageMetadata};
use magnetar_protocol::{commands, split_batch_payload, CompressionType, Frame};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Explicit-id redeliver commands go out in chunks of at most this many ids.
const MAX_REDELIVER_CHUNK: usize = 1000;

type ReceiveReply = oneshot::Sender<Result<Message>>;

enum ConsumerOp {
    Receive {
        reply: ReceiveReply,
    },
    Ack {
        id: MessageId,
        cumulative: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    NegativeAck {
        id: MessageId,
    },
    Redeliver {
        ids: Vec<MessageId>,
        reply: oneshot::Sender<Result<()>>,
    },
    RedeliverAll {
        reply: oneshot::Sender<Result<()>>,
    },
    Seek {
        target: SeekTarget,
        reply: oneshot::Sender<Result<()>>,
    },
    HasMessageAvailable {
        reply: oneshot::Sender<Result<bool>>,
    },
    LastMessageId {
        reply: oneshot::Sender<Result<MessageId>>,
    },
    Unsubscribe {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
    Reconnect,
    FlushAcksTick,
    UnackedTick,
    NegativeTick,
}

#[derive(Debug, Clone)]
pub enum SeekTarget {
    MessageId(MessageId),
    /// Publish-time position, epoch millis.
    Timestamp(u64),
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle to a consumer engine. Cheap to clone; [`Consumer::close`] shuts
/// the engine down.
#[derive(Clone)]
pub struct Consumer {
    topic: String,
    subscription: String,
    op_tx: mpsc::UnboundedSender<ConsumerOp>,
}

impl Consumer {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Next message, waiting for one to arrive if the queue is empty.
    pub async fn recv(&self) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ConsumerOp::Receive { reply: tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    pub async fn ack(&self, message: &Message) -> Result<()> {
        self.ack_id(message.id.clone()).await
    }

    pub async fn ack_id(&self, id: MessageId) -> Result<()> {
        self.send_ack(id, false).await
    }

    /// Acknowledge `message` and everything before it on this subscription.
    pub async fn ack_cumulative(&self, message: &Message) -> Result<()> {
        self.ack_cumulative_id(message.id.clone()).await
    }

    pub async fn ack_cumulative_id(&self, id: MessageId) -> Result<()> {
        self.send_ack(id, true).await
    }

    async fn send_ack(&self, id: MessageId, cumulative: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ConsumerOp::Ack {
                id,
                cumulative,
                reply: tx,
            })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Schedule redelivery of `message` after the configured delay.
    pub fn negative_ack(&self, message: &Message) -> Result<()> {
        self.negative_ack_id(message.id.clone())
    }

    pub fn negative_ack_id(&self, id: MessageId) -> Result<()> {
        self.op_tx
            .send(ConsumerOp::NegativeAck { id })
            .map_err(|_| Error::AlreadyClosed)
    }

    /// Ask the broker to redeliver these unacknowledged messages now
    /// (Shared / KeyShared; other subscription types redeliver everything).
    pub async fn redeliver_unacknowledged(&self, ids: Vec<MessageId>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ConsumerOp::Redeliver { ids, reply: tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    pub async fn redeliver_all_unacknowledged(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ConsumerOp::RedeliverAll { reply: tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Reposition the subscription to a message id.
    pub async fn seek(&self, id: MessageId) -> Result<()> {
        self.seek_target(SeekTarget::MessageId(id)).await
    }

    /// Reposition the subscription to a publish timestamp (epoch millis).
    pub async fn seek_timestamp(&self, timestamp: u64) -> Result<()> {
        self.seek_target(SeekTarget::Timestamp(timestamp)).await
    }

    async fn seek_target(&self, target: SeekTarget) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ConsumerOp::Seek { target, reply: tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    pub async fn has_message_available(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ConsumerOp::HasMessageAvailable { reply: tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Latest message id the broker has for this topic.
    pub async fn last_message_id(&self) -> Result<MessageId> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ConsumerOp::LastMessageId { reply: tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Drop the subscription on the broker, then close this consumer.
    pub async fn unsubscribe(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ConsumerOp::Unsubscribe { reply: tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(ConsumerOp::Close { reply: tx })
            .map_err(|_| Error::AlreadyClosed)?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }
}

/// Spawn the engine and wait for its first successful subscription.
pub(crate) async fn create(
    config: ConsumerConfig,
    lookup: Arc<LookupService>,
    pool: Arc<ConnectionPool>,
    operation_timeout: Duration,
) -> Result<Consumer> {
    config.validate()?;
    let topic_name = TopicName::parse(&config.topic)?;

    let consumer_id = ids::next_consumer_id();
    let (op_tx, op_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    let handler = ConnectionHandler::new(
        format!("consumer({}, {})", consumer_id, config.topic),
        config.topic.clone(),
        lookup,
        Arc::clone(&pool),
        operation_timeout,
    );

    let start_message_id = config
        .start_message_id
        .clone()
        .unwrap_or_else(MessageId::earliest);
    let topic = config.topic.clone();
    let subscription = config.subscription_name.clone();

    let engine = ConsumerEngine {
        consumer_name: config
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", consumer_id)),
        ack_tracker: AckGroupingTracker::new(
            config.acknowledgements_group_time,
            topic_name.persistent,
        ),
        unacked: UnackedMessageTracker::new(config.ack_timeout, config.ack_timeout_tick_time),
        negative: NegativeAckTracker::new(config.negative_ack_redelivery_delay),
        partition: topic_name.partition_index().unwrap_or(-1),
        last_dequeued: start_message_id.clone(),
        start_message_id: start_message_id.clone(),
        start_inclusive: config.reset_include_head,
        anything_dequeued: false,
        last_message_id_in_broker: None,
        terminated: false,
        config,
        consumer_id,
        handler,
        pool,
        operation_timeout,
        incoming: VecDeque::new(),
        waiters: VecDeque::new(),
        available_permits: 0,
        op_tx: op_tx.clone(),
        event_tx,
    };
    tokio::spawn(engine.run(op_rx, event_rx, ready_tx));

    ready_rx.await.map_err(|_| Error::AlreadyClosed)??;
    Ok(Consumer {
        topic,
        subscription,
        op_tx,
    })
}

// ============================================================================
// Engine
// ============================================================================

struct ConsumerEngine {
    config: ConsumerConfig,
    consumer_id: u64,
    consumer_name: String,
    partition: i32,
    handler: ConnectionHandler,
    pool: Arc<ConnectionPool>,
    operation_timeout: Duration,

    incoming: VecDeque<Message>,
    waiters: VecDeque<ReceiveReply>,
    available_permits: u32,

    ack_tracker: AckGroupingTracker,
    unacked: UnackedMessageTracker,
    negative: NegativeAckTracker,

    /// Current resume point for non-durable subscriptions; advanced on
    /// reconnect and seek.
    start_message_id: MessageId,
    /// Whether the start position itself should still be delivered.
    start_inclusive: bool,
    last_dequeued: MessageId,
    anything_dequeued: bool,
    last_message_id_in_broker: Option<MessageId>,
    terminated: bool,

    op_tx: mpsc::UnboundedSender<ConsumerOp>,
    event_tx: mpsc::UnboundedSender<ConsumerEvent>,
}

impl ConsumerEngine {
    async fn run(
        mut self,
        mut op_rx: mpsc::UnboundedReceiver<ConsumerOp>,
        mut event_rx: mpsc::UnboundedReceiver<ConsumerEvent>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let mut ready = Some(ready);
        self.connect_or_schedule(&mut ready).await;

        self.spawn_tickers();

        loop {
            tokio::select! {
                op = op_rx.recv() => match op {
                    Some(ConsumerOp::Receive { reply }) => self.handle_receive(reply),
                    Some(ConsumerOp::Ack { id, cumulative, reply }) => {
                        let result = self.handle_ack(id, cumulative);
                        let _ = reply.send(result);
                    }
                    Some(ConsumerOp::NegativeAck { id }) => self.handle_negative_ack(id),
                    Some(ConsumerOp::Redeliver { ids, reply }) => {
                        let result = self.redeliver(ids);
                        let _ = reply.send(result);
                    }
                    Some(ConsumerOp::RedeliverAll { reply }) => {
                        let result = self.redeliver_all();
                        let _ = reply.send(result);
                    }
                    Some(ConsumerOp::Seek { target, reply }) => {
                        let result = self.handle_seek(target).await;
                        let _ = reply.send(result);
                    }
                    Some(ConsumerOp::HasMessageAvailable { reply }) => {
                        let result = self.handle_has_message_available().await;
                        let _ = reply.send(result);
                    }
                    Some(ConsumerOp::LastMessageId { reply }) => {
                        let result = self.fetch_last_message_id().await;
                        let _ = reply.send(result);
                    }
                    Some(ConsumerOp::Unsubscribe { reply }) => {
                        let result = self.handle_shutdown(true).await;
                        let done = result.is_ok();
                        let _ = reply.send(result);
                        if done {
                            break;
                        }
                    }
                    Some(ConsumerOp::Close { reply }) => {
                        let result = self.handle_shutdown(false).await;
                        let done = result.is_ok();
                        let _ = reply.send(result);
                        if done {
                            break;
                        }
                    }
                    Some(ConsumerOp::Reconnect) => self.connect_or_schedule(&mut ready).await,
                    Some(ConsumerOp::FlushAcksTick) => {
                        let batches = self.ack_tracker.flush();
                        self.send_ack_batches(batches);
                    }
                    Some(ConsumerOp::UnackedTick) => {
                        let expired = self.unacked.tick();
                        if !expired.is_empty() {
                            warn!(
                                consumer = self.consumer_id,
                                count = expired.len(),
                                "ack timeout expired, requesting redelivery"
                            );
                            let _ = self.redeliver(expired);
                        }
                    }
                    Some(ConsumerOp::NegativeTick) => {
                        let due = self.negative.drain_due();
                        if !due.is_empty() {
                            let _ = self.redeliver(due);
                        }
                    }
                    None => break,
                },
                event = event_rx.recv() => match event {
                    Some(ConsumerEvent::Message { command, metadata, payload }) => {
                        self.handle_message(command, metadata, payload);
                    }
                    Some(ConsumerEvent::ReachedEndOfTopic) => {
                        info!(consumer = self.consumer_id, "reached end of topic");
                        self.terminated = true;
                        self.handler.set_state(ConnectionState::Terminated);
                    }
                    Some(ConsumerEvent::Closed) => self.handle_broker_close(&mut ready),
                    Some(ConsumerEvent::ConnectionClosed(conn_id)) => {
                        if self.handler.connection_closed(conn_id) {
                            self.schedule_reconnect(&mut ready, &Error::NotConnected);
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(consumer = self.consumer_id, "consumer engine stopped");
    }

    fn spawn_tickers(&self) {
        if !self.ack_tracker.is_immediate() {
            spawn_ticker(
                self.op_tx.clone(),
                self.config.acknowledgements_group_time,
                || ConsumerOp::FlushAcksTick,
            );
        }
        if self.unacked.is_enabled() {
            spawn_ticker(self.op_tx.clone(), self.config.ack_timeout_tick_time, || {
                ConsumerOp::UnackedTick
            });
        }
        spawn_ticker(self.op_tx.clone(), self.negative.tick_interval(), || {
            ConsumerOp::NegativeTick
        });
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

    /// Lookup, register, SUBSCRIBE, then grant the initial flow window.
    async fn try_connect(&mut self) -> Result<()> {
        // Non-durable subscriptions resume from the newest position we have
        // seen; the original start is only used the first time around.
        if !self.config.durable {
            if let Some(tail) = self.incoming.back() {
                self.start_message_id = tail.id.clone();
                self.start_inclusive = false;
            } else if self.anything_dequeued {
                self.start_message_id = self.last_dequeued.clone();
                self.start_inclusive = false;
            }
        }

        let conn = self.handler.grab_connection().await?;
        conn.register_consumer(self.consumer_id, self.event_tx.clone());

        let request_id = ids::next_request_id();
        let start = (!self.config.durable).then(|| self.start_message_id.to_proto());
        let command = commands::subscribe(
            request_id,
            self.consumer_id,
            &self.config.topic,
            &self.config.subscription_name,
            self.config.subscription_type.to_proto(),
            &self.consumer_name,
            self.config.durable,
            start,
            self.config.initial_position.to_proto(),
            self.config.read_compacted,
        );
        let response = tokio::time::timeout(
            self.operation_timeout,
            conn.send_request(request_id, command),
        )
        .await
        .map_err(|_| Error::Timeout("subscribe".into()))??;
        if response.r#type != CommandType::Success as i32 {
            return Err(Error::UnexpectedResponse("SUCCESS"));
        }

        // Fresh credit window; the broker's view of our permits reset with
        // the subscription.
        self.available_permits = 0;
        conn.send(Frame::command(commands::flow(
            self.consumer_id,
            self.config.receiver_queue_size,
        )));
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
                    let _ = tx.send(ConsumerOp::Reconnect);
                });
            }
            None => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(self.handler.check_if_active().unwrap_err()));
                }
                let e = self.handler.check_if_active().unwrap_err();
                self.fail_waiters(e);
            }
        }
    }

    fn handle_broker_close(&mut self, ready: &mut Option<oneshot::Sender<Result<()>>>) {
        let conn = match self.handler.state() {
            ConnectionState::Ready(conn) => Arc::clone(conn),
            _ => return,
        };
        conn.remove_consumer(self.consumer_id);
        self.handler.set_state(ConnectionState::Reconnecting);
        self.schedule_reconnect(ready, &Error::NotConnected);
    }

    fn fail_waiters(&mut self, error: Error) {
        let msg = error.to_string();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::ConnectionFailed(msg.clone())));
        }
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    fn handle_message(&mut self, command: proto::CommandMessage, metadata: MessageMetadata, payload: Bytes) {
        let entry_id = MessageId::from_proto(&command.message_id, &self.config.topic);
        let num_messages = metadata.num_messages_in_batch;

        // A redelivery of something we already acked: drop the entry and
        // hand its credit back.
        if self.ack_tracker.is_duplicate(&entry_id) {
            debug!(consumer = self.consumer_id, id = %entry_id, "dropping duplicate entry");
            self.increase_permits(num_messages.unwrap_or(1).max(1) as u32);
            return;
        }

        let compression = match CompressionType::from_proto(
            metadata.compression.unwrap_or(proto::CompressionType::None as i32),
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!(consumer = self.consumer_id, error = %e, "unknown compression, dropping entry");
                self.increase_permits(num_messages.unwrap_or(1).max(1) as u32);
                return;
            }
        };
        let uncompressed = match compression.decompress(
            &payload,
            metadata.uncompressed_size.unwrap_or(payload.len() as u32) as usize,
        ) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(consumer = self.consumer_id, error = %e, "decompression failed, dropping entry");
                self.increase_permits(num_messages.unwrap_or(1).max(1) as u32);
                return;
            }
        };

        let redelivery_count = command.redelivery_count.unwrap_or(0);
        match num_messages {
            None => self.deliver_single(entry_id, metadata, uncompressed, redelivery_count),
            Some(n) => {
                self.deliver_batch(entry_id, metadata, uncompressed, n, redelivery_count)
            }
        }
    }

    fn deliver_single(
        &mut self,
        id: MessageId,
        metadata: MessageMetadata,
        payload: Bytes,
        redelivery_count: u32,
    ) {
        if self.is_prior_entry(&id) {
            self.increase_permits(1);
            return;
        }
        let message = Message {
            id,
            payload,
            key: metadata.partition_key,
            properties: from_key_values(metadata.properties),
            publish_time: metadata.publish_time,
            event_time: metadata.event_time,
            producer_name: metadata.producer_name,
            redelivery_count,
        };
        self.deliver(message);
    }

    /// Explode a batch entry: each sub-message is parsed in index order,
    /// filtered, and delivered with the shared batch acker.
    fn deliver_batch(
        &mut self,
        entry_id: MessageId,
        metadata: MessageMetadata,
        payload: Bytes,
        num_messages: i32,
        redelivery_count: u32,
    ) {
        let entries = match split_batch_payload(payload, num_messages) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(consumer = self.consumer_id, error = %e, "malformed batch, dropping entry");
                self.increase_permits(num_messages.max(1) as u32);
                return;
            }
        };

        let acker = Arc::new(BatchAcker::new(entries.len()));
        for (index, entry) in entries.into_iter().enumerate() {
            let index = index as i32;
            if entry.metadata.compacted_out.unwrap_or(false)
                || self.is_prior_batch_index(&entry_id, index)
            {
                // Skipped sub-messages count as acked, otherwise the entry
                // could never reach all-acked.
                acker.ack(index);
                self.increase_permits(1);
                continue;
            }
            let id = MessageId {
                ledger_id: entry_id.ledger_id,
                entry_id: entry_id.entry_id,
                partition: self.partition,
                batch: Some(BatchPosition {
                    index,
                    acker: Some(Arc::clone(&acker)),
                }),
                topic: self.config.topic.clone(),
            };
            let message = Message {
                id,
                payload: entry.payload,
                key: entry.metadata.partition_key,
                properties: from_key_values(entry.metadata.properties),
                publish_time: metadata.publish_time,
                event_time: entry.metadata.event_time,
                producer_name: metadata.producer_name.clone(),
                redelivery_count,
            };
            self.deliver(message);
        }
    }

    /// Hand to a waiting receiver, else queue in broker order.
    fn deliver(&mut self, message: Message) {
        if let Some(waiter) = self.waiters.pop_front() {
            self.mark_dequeued(&message.id);
            let _ = waiter.send(Ok(message));
            self.increase_permits(1);
        } else {
            self.incoming.push_back(message);
        }
    }

    /// The ack-timeout clock starts when the application takes the message,
    /// not when it lands in the local queue.
    fn mark_dequeued(&mut self, id: &MessageId) {
        self.last_dequeued = id.clone();
        self.anything_dequeued = true;
        if self.unacked.is_enabled() {
            self.unacked.add(id.clone());
        }
    }

    /// Non-durable entry filter against the current start position.
    fn is_prior_entry(&self, id: &MessageId) -> bool {
        if self.config.durable || self.start_message_id.is_unset() {
            return false;
        }
        if id.ledger_id != self.start_message_id.ledger_id {
            return false;
        }
        if self.start_inclusive {
            id.entry_id < self.start_message_id.entry_id
        } else {
            id.entry_id <= self.start_message_id.entry_id
        }
    }

    /// Batch-index analogue: applies only inside the start entry itself.
    fn is_prior_batch_index(&self, entry_id: &MessageId, index: i32) -> bool {
        if self.config.durable || self.start_message_id.is_unset() {
            return false;
        }
        if entry_id.ledger_id != self.start_message_id.ledger_id
            || entry_id.entry_id != self.start_message_id.entry_id
        {
            // Different entry: the entry-level filter already decided.
            return self.is_prior_entry(entry_id);
        }
        let start_index = self.start_message_id.batch_index().unwrap_or(-1);
        if self.start_inclusive {
            index < start_index
        } else {
            index <= start_index
        }
    }

    /// Credit accounting: past half the window, re-grant everything.
    fn increase_permits(&mut self, n: u32) {
        self.available_permits += n;
        if self.available_permits >= self.config.receiver_queue_size / 2 {
            if let ConnectionState::Ready(conn) = self.handler.state() {
                let granted = self.available_permits;
                conn.send(Frame::command(commands::flow(self.consumer_id, granted)));
                self.available_permits = 0;
            }
        }
    }

    fn handle_receive(&mut self, reply: ReceiveReply) {
        if let Some(message) = self.incoming.pop_front() {
            self.mark_dequeued(&message.id);
            let _ = reply.send(Ok(message));
            self.increase_permits(1);
            return;
        }
        match self.handler.state() {
            ConnectionState::Closing | ConnectionState::Closed => {
                let _ = reply.send(Err(Error::AlreadyClosed));
            }
            ConnectionState::Failed => {
                let _ = reply.send(Err(Error::ConnectionFailed(
                    "consumer connection failed".into(),
                )));
            }
            // Reconnecting and even Terminated consumers keep waiting: the
            // queue may refill (or the caller races has_message_available).
            _ => self.waiters.push_back(reply),
        }
    }

    // ------------------------------------------------------------------
    // Acknowledgment
    // ------------------------------------------------------------------

    fn handle_ack(&mut self, id: MessageId, cumulative: bool) -> Result<()> {
        if self.handler.is_closing_or_closed() {
            return Err(Error::AlreadyClosed);
        }
        let batches = if cumulative {
            self.ack_cumulative_internal(id)
        } else {
            self.ack_individual_internal(id)
        };
        self.send_ack_batches(batches);
        Ok(())
    }

    fn ack_individual_internal(&mut self, id: MessageId) -> Vec<AckBatch> {
        self.unacked.remove(&id);
        match id.batch.as_ref().and_then(|b| b.acker.clone()) {
            Some(acker) => {
                acker.ack(id.batch_index().unwrap_or(-1));
                if acker.all_acked() {
                    // The whole batch is individually acked: one network ack
                    // for the entry covers it.
                    self.ack_tracker.add_individual(id.entry_level())
                } else {
                    Vec::new()
                }
            }
            None => self.ack_tracker.add_individual(id),
        }
    }

    fn ack_cumulative_internal(&mut self, id: MessageId) -> Vec<AckBatch> {
        self.unacked.remove_until(&id);
        match id.batch.as_ref().and_then(|b| b.acker.clone()) {
            Some(acker) => {
                // Cumulative inside a batch covers this sub-index and all
                // before it.
                let index = id.batch_index().unwrap_or(-1);
                for i in 0..=index {
                    acker.ack(i);
                }
                if acker.all_acked() {
                    self.ack_tracker.add_cumulative(id.entry_level())
                } else if !acker.prev_batch_cumulatively_acked() {
                    // The batch is only partially covered: everything before
                    // the batch is acknowledged through the previous entry.
                    acker.set_prev_batch_cumulatively_acked();
                    let prev = MessageId {
                        ledger_id: id.ledger_id,
                        entry_id: id.entry_id.wrapping_sub(1),
                        partition: id.partition,
                        batch: None,
                        topic: id.topic.clone(),
                    };
                    self.ack_tracker.add_cumulative(prev)
                } else {
                    Vec::new()
                }
            }
            None => self.ack_tracker.add_cumulative(id.entry_level()),
        }
    }

    fn send_ack_batches(&mut self, batches: Vec<AckBatch>) {
        if batches.is_empty() {
            return;
        }
        let ConnectionState::Ready(conn) = self.handler.state() else {
            // The broker forgets our acks on disconnect anyway; these will
            // be redelivered and re-acked.
            return;
        };
        for batch in batches {
            let ids = batch.ids.iter().map(|id| id.to_proto()).collect();
            conn.send(Frame::command(commands::ack(
                self.consumer_id,
                batch.ack_type,
                ids,
            )));
        }
    }

    fn handle_negative_ack(&mut self, id: MessageId) {
        self.unacked.remove(&id);
        self.negative.add(id);
    }

    // ------------------------------------------------------------------
    // Redelivery
    // ------------------------------------------------------------------

    fn redeliver(&mut self, ids: Vec<MessageId>) -> Result<()> {
        if self.handler.is_closing_or_closed() {
            return Err(Error::AlreadyClosed);
        }
        if !self
            .config
            .subscription_type
            .supports_individual_redelivery()
        {
            return self.redeliver_all();
        }

        // Entry-granular and deduped: redelivering one sub-message brings
        // back its whole entry.
        let mut seen = HashSet::new();
        let entry_ids: Vec<MessageId> = ids
            .into_iter()
            .map(|id| id.entry_level())
            .filter(|id| seen.insert(id.clone()))
            .collect();

        // Anything still queued locally is dropped; the broker sends it
        // again and its credit comes back now.
        let before = self.incoming.len();
        self.incoming.retain(|m| !seen.contains(&m.id.entry_level()));
        let dropped = (before - self.incoming.len()) as u32;
        if dropped > 0 {
            self.increase_permits(dropped);
        }

        if let ConnectionState::Ready(conn) = self.handler.state() {
            for chunk in entry_ids.chunks(MAX_REDELIVER_CHUNK) {
                let ids = chunk.iter().map(|id| id.to_proto()).collect();
                conn.send(Frame::command(commands::redeliver_unacknowledged_messages(
                    self.consumer_id,
                    ids,
                )));
            }
        }
        Ok(())
    }

    fn redeliver_all(&mut self) -> Result<()> {
        if self.handler.is_closing_or_closed() {
            return Err(Error::AlreadyClosed);
        }
        let cleared = self.incoming.len() as u32;
        self.incoming.clear();
        self.unacked.clear();
        if cleared > 0 {
            self.increase_permits(cleared);
        }
        if let ConnectionState::Ready(conn) = self.handler.state() {
            conn.send(Frame::command(commands::redeliver_unacknowledged_messages(
                self.consumer_id,
                Vec::new(),
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Seek
    // ------------------------------------------------------------------

    async fn handle_seek(&mut self, target: SeekTarget) -> Result<()> {
        self.handler.check_if_active()?;
        let conn = self.handler.connection()?;

        // Outstanding acks refer to pre-seek positions; they go out first.
        let batches = self.ack_tracker.flush();
        self.send_ack_batches(batches);

        let request_id = ids::next_request_id();
        let command = match &target {
            SeekTarget::MessageId(id) => {
                commands::seek_by_id(request_id, self.consumer_id, id.to_proto())
            }
            SeekTarget::Timestamp(ts) => commands::seek_by_time(request_id, self.consumer_id, *ts),
        };
        tokio::time::timeout(self.operation_timeout, conn.send_request(request_id, command))
            .await
            .map_err(|_| Error::Timeout("seek".into()))??;

        // Local state rewinds with the cursor.
        self.ack_tracker.flush_and_clean();
        let cleared = self.incoming.len() as u32;
        self.incoming.clear();
        self.unacked.clear();
        self.negative.clear();
        if cleared > 0 {
            self.increase_permits(cleared);
        }
        match target {
            SeekTarget::MessageId(id) => {
                self.last_dequeued = id.clone();
                self.start_message_id = id;
                self.start_inclusive = self.config.reset_include_head;
                self.anything_dequeued = false;
            }
            SeekTarget::Timestamp(_) => {
                self.last_dequeued = MessageId::earliest();
                self.start_message_id = MessageId::earliest();
                self.anything_dequeued = false;
            }
        }
        info!(consumer = self.consumer_id, "seek complete");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Last message id
    // ------------------------------------------------------------------

    async fn fetch_last_message_id(&mut self) -> Result<MessageId> {
        self.handler.check_if_active()?;
        let conn = self.handler.connection()?;
        let request_id = ids::next_request_id();
        let response = tokio::time::timeout(
            self.operation_timeout,
            conn.send_request(
                request_id,
                commands::get_last_message_id(request_id, self.consumer_id),
            ),
        )
        .await
        .map_err(|_| Error::Timeout("get last message id".into()))??;

        let last = response
            .get_last_message_id_response
            .ok_or(Error::UnexpectedResponse("GET_LAST_MESSAGE_ID_RESPONSE"))?;
        let id = MessageId::from_proto(&last.last_message_id, &self.config.topic);
        self.last_message_id_in_broker = Some(id.clone());
        Ok(id)
    }

    async fn handle_has_message_available(&mut self) -> Result<bool> {
        if !self.incoming.is_empty() {
            return Ok(true);
        }
        if self.broker_has_more() == Some(true) {
            return Ok(true);
        }
        self.fetch_last_message_id().await?;
        Ok(self.broker_has_more().unwrap_or(false) || !self.incoming.is_empty())
    }

    fn broker_has_more(&self) -> Option<bool> {
        let last = self.last_message_id_in_broker.as_ref()?;
        if last.is_unset() {
            return Some(false);
        }
        Some(if self.start_inclusive && !self.anything_dequeued {
            *last >= self.last_dequeued
        } else {
            *last > self.last_dequeued
        })
    }

    // ------------------------------------------------------------------
    // Close / unsubscribe
    // ------------------------------------------------------------------

    async fn handle_shutdown(&mut self, unsubscribe: bool) -> Result<()> {
        if self.handler.is_closing_or_closed() {
            return Ok(());
        }

        // Acks the application already issued should not be lost to the
        // shutdown.
        let batches = self.ack_tracker.flush();
        self.send_ack_batches(batches);

        let connection = match self.handler.state() {
            ConnectionState::Ready(conn) => Some(Arc::clone(conn)),
            _ => None,
        };
        self.handler.set_state(ConnectionState::Closing);

        if let Some(conn) = connection {
            let request_id = ids::next_request_id();
            let command = if unsubscribe {
                commands::unsubscribe(request_id, self.consumer_id)
            } else {
                commands::close_consumer(request_id, self.consumer_id)
            };
            let result = tokio::time::timeout(
                self.operation_timeout,
                conn.send_request(request_id, command),
            )
            .await
            .map_err(|_| Error::Timeout("close consumer".into()))
            .and_then(|r| r.map(|_| ()));

            if let Err(e) = result {
                self.handler
                    .set_state(ConnectionState::Ready(Arc::clone(&conn)));
                return Err(e);
            }
            conn.remove_consumer(self.consumer_id);
            let physical = conn.addr().physical.clone();
            self.pool.release_if_idle(&physical).await;
        }

        self.handler.set_state(ConnectionState::Closed);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::AlreadyClosed));
        }
        self.incoming.clear();
        self.unacked.clear();
        self.negative.clear();
        info!(consumer = self.consumer_id, unsubscribe, "consumer closed");
        Ok(())
    }
}

fn spawn_ticker<F>(tx: mpsc::UnboundedSender<ConsumerOp>, period: Duration, make_op: F)
where
    F: Fn() -> ConsumerOp + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.send(make_op()).is_err() {
                break;
            }
        }
    });
}

fn from_key_values(pairs: Vec<proto::KeyValue>) -> std::collections::HashMap<String, String> {
    pairs.into_iter().map(|kv| (kv.key, kv.value)).collect()
}
