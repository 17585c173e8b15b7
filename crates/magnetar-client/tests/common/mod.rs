//! In-process mock broker speaking enough of the wire protocol for
//! end-to-end client tests: connect, producer registration, stored topic
//! logs, flow-controlled delivery, acks, redelivery, seek, and key-shared
//! routing.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use magnetar_protocol::proto::{self, BaseCommand, CommandType, MessageMetadata, SubType};
use magnetar_protocol::{Frame, FrameCodec};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};

pub struct MockBroker {
    pub port: u16,
    state: Arc<BrokerState>,
    kill: broadcast::Sender<()>,
}

struct BrokerState {
    port: u16,
    topics: Mutex<HashMap<String, Topic>>,
    /// SEND names only the producer id; PRODUCER told us its topic.
    producer_topics: Mutex<HashMap<u64, String>>,
    producers_registered: AtomicU64,
}

#[derive(Default)]
struct Topic {
    /// Ledger 1; entry id == index.
    entries: Vec<(MessageMetadata, Bytes)>,
    subs: HashMap<String, Subscription>,
}

struct Subscription {
    sub_type: i32,
    cursor: usize,
    unacked: BTreeSet<usize>,
    acked: HashSet<usize>,
    mark_delete: i64,
    consumers: Vec<ConsumerSession>,
    key_assignment: HashMap<String, u64>,
    rr: usize,
}

struct ConsumerSession {
    consumer_id: u64,
    permits: i64,
    tx: mpsc::UnboundedSender<Frame>,
}

impl MockBroker {
    pub async fn start() -> Self {
        // RUST_LOG=debug surfaces the client's reconnect/dispatch tracing
        // when a test misbehaves.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(BrokerState {
            port,
            topics: Mutex::new(HashMap::new()),
            producer_topics: Mutex::new(HashMap::new()),
            producers_registered: AtomicU64::new(0),
        });
        let (kill, _) = broadcast::channel(4);

        let accept_state = Arc::clone(&state);
        let accept_kill = kill.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&accept_state);
                let kill_rx = accept_kill.subscribe();
                tokio::spawn(serve_connection(stream, state, kill_rx));
            }
        });

        Self { port, state, kill }
    }

    pub fn service_url(&self) -> String {
        format!("pulsar://127.0.0.1:{}", self.port)
    }

    /// Drop every open connection; the listener keeps accepting, so clients
    /// reconnect.
    pub fn kill_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Sequence ids of the SENDs stored for `topic`, in arrival order.
    pub fn stored_sequence_ids(&self, topic: &str) -> Vec<u64> {
        let topics = self.state.topics.lock().unwrap();
        topics
            .get(topic)
            .map(|t| t.entries.iter().map(|(m, _)| m.sequence_id).collect())
            .unwrap_or_default()
    }

    pub fn stored_entry_count(&self, topic: &str) -> usize {
        let topics = self.state.topics.lock().unwrap();
        topics.get(topic).map(|t| t.entries.len()).unwrap_or(0)
    }

    pub fn producers_registered(&self) -> u64 {
        self.state.producers_registered.load(Ordering::Relaxed)
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<BrokerState>,
    mut kill_rx: broadcast::Receiver<()>,
) {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, FrameCodec);
    let mut writer = FramedWrite::new(write_half, FrameCodec);

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Consumer ids registered on this connection, for cleanup.
    let mut local_consumers: Vec<(String, String, u64)> = Vec::new();

    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            _ = kill_rx.recv() => break,
        };
        let Some(Ok(frame)) = frame else { break };
        handle_frame(frame, &state, &tx, &mut local_consumers);
    }

    // Connection gone: deregister its consumers so later sessions get a
    // fresh exclusive slot.
    let mut topics = state.topics.lock().unwrap();
    for (topic, sub, consumer_id) in local_consumers {
        if let Some(t) = topics.get_mut(&topic) {
            if let Some(s) = t.subs.get_mut(&sub) {
                s.consumers.retain(|c| c.consumer_id != consumer_id);
            }
        }
    }
    drop(topics);
    writer_task.abort();
}

fn handle_frame(
    frame: Frame,
    state: &Arc<BrokerState>,
    tx: &mpsc::UnboundedSender<Frame>,
    local_consumers: &mut Vec<(String, String, u64)>,
) {
    let command = frame.command;
    match CommandType::try_from(command.r#type) {
        Ok(CommandType::Connect) => {
            send(tx, connected());
        }
        Ok(CommandType::Ping) => {
            send(
                tx,
                BaseCommand {
                    r#type: CommandType::Pong as i32,
                    pong: Some(proto::CommandPong {}),
                    ..Default::default()
                },
            );
        }
        Ok(CommandType::Pong) => {}
        Ok(CommandType::Lookup) => {
            let lookup = command.lookup_topic.unwrap();
            send(
                tx,
                BaseCommand {
                    r#type: CommandType::LookupResponse as i32,
                    lookup_topic_response: Some(proto::CommandLookupTopicResponse {
                        broker_service_url: Some(format!("pulsar://127.0.0.1:{}", state.port)),
                        response: Some(proto::LookupType::Connect as i32),
                        request_id: lookup.request_id,
                        authoritative: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            );
        }
        Ok(CommandType::PartitionedMetadata) => {
            let meta = command.partition_metadata.unwrap();
            send(
                tx,
                BaseCommand {
                    r#type: CommandType::PartitionedMetadataResponse as i32,
                    partition_metadata_response: Some(
                        proto::CommandPartitionedTopicMetadataResponse {
                            partitions: Some(0),
                            request_id: meta.request_id,
                            response: Some(proto::PartitionedResponse::Success as i32),
                            ..Default::default()
                        },
                    ),
                    ..Default::default()
                },
            );
        }
        Ok(CommandType::Producer) => {
            let producer = command.producer.unwrap();
            state
                .producer_topics
                .lock()
                .unwrap()
                .insert(producer.producer_id, producer.topic.clone());
            let n = state.producers_registered.fetch_add(1, Ordering::Relaxed);
            send(
                tx,
                BaseCommand {
                    r#type: CommandType::ProducerSuccess as i32,
                    producer_success: Some(proto::CommandProducerSuccess {
                        request_id: producer.request_id,
                        producer_name: producer
                            .producer_name
                            .unwrap_or_else(|| format!("mock-producer-{}", n)),
                        last_sequence_id: Some(-1),
                    }),
                    ..Default::default()
                },
            );
        }
        Ok(CommandType::Send) => {
            let send_cmd = command.send.unwrap();
            let payload = frame.payload.expect("SEND carries a payload");
            let topic_name = state
                .producer_topics
                .lock()
                .unwrap()
                .get(&send_cmd.producer_id)
                .cloned()
                .expect("SEND from unregistered producer");
            let mut topics = state.topics.lock().unwrap();
            let topic = topics.entry(topic_name).or_default();
            let entry_id = topic.entries.len() as u64;
            topic.entries.push((payload.metadata, payload.data));
            send(
                tx,
                BaseCommand {
                    r#type: CommandType::SendReceipt as i32,
                    send_receipt: Some(proto::CommandSendReceipt {
                        producer_id: send_cmd.producer_id,
                        sequence_id: send_cmd.sequence_id,
                        message_id: Some(proto::MessageIdData {
                            ledger_id: 1,
                            entry_id,
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            );
            pump(topic);
        }
        Ok(CommandType::Subscribe) => {
            let sub = command.subscribe.unwrap();
            let mut topics = state.topics.lock().unwrap();
            let topic = topics.entry(sub.topic.clone()).or_default();

            let cursor = if sub.durable.unwrap_or(true) {
                match topic.subs.get(&sub.subscription) {
                    // Durable cursor survives the consumer.
                    Some(existing) => existing.cursor,
                    None => match proto::InitialPosition::try_from(
                        sub.initial_position
                            .unwrap_or(proto::InitialPosition::Latest as i32),
                    ) {
                        Ok(proto::InitialPosition::Earliest) => 0,
                        _ => topic.entries.len(),
                    },
                }
            } else {
                // Non-durable: delivery starts at the client's start
                // position, inclusive; the client filters the head itself.
                match &sub.start_message_id {
                    Some(start) if start.entry_id != u64::MAX => start.entry_id as usize,
                    Some(_) => 0, // earliest sentinel
                    None => topic.entries.len(),
                }
            };

            let entry = topic
                .subs
                .entry(sub.subscription.clone())
                .or_insert_with(|| Subscription {
                    sub_type: sub.sub_type,
                    cursor,
                    unacked: BTreeSet::new(),
                    acked: HashSet::new(),
                    mark_delete: -1,
                    consumers: Vec::new(),
                    key_assignment: HashMap::new(),
                    rr: 0,
                });
            entry.consumers.push(ConsumerSession {
                consumer_id: sub.consumer_id,
                permits: 0,
                tx: tx.clone(),
            });
            local_consumers.push((sub.topic.clone(), sub.subscription.clone(), sub.consumer_id));
            send(tx, success(sub.request_id));
        }
        Ok(CommandType::Flow) => {
            let flow = command.flow.unwrap();
            let mut topics = state.topics.lock().unwrap();
            for topic in topics.values_mut() {
                for sub in topic.subs.values_mut() {
                    for consumer in sub.consumers.iter_mut() {
                        if consumer.consumer_id == flow.consumer_id {
                            consumer.permits += flow.message_permits as i64;
                        }
                    }
                }
                pump(topic);
            }
        }
        Ok(CommandType::Ack) => {
            let ack = command.ack.unwrap();
            let mut topics = state.topics.lock().unwrap();
            for topic in topics.values_mut() {
                for sub in topic.subs.values_mut() {
                    if !sub.consumers.iter().any(|c| c.consumer_id == ack.consumer_id) {
                        continue;
                    }
                    for id in &ack.message_id {
                        let entry = id.entry_id as usize;
                        if ack.ack_type == proto::AckType::Cumulative as i32 {
                            sub.mark_delete = sub.mark_delete.max(entry as i64);
                            sub.unacked.retain(|e| *e > entry);
                        } else {
                            sub.unacked.remove(&entry);
                            sub.acked.insert(entry);
                        }
                    }
                }
            }
        }
        Ok(CommandType::RedeliverUnacknowledgedMessages) => {
            let redeliver = command.redeliver_unacknowledged_messages.unwrap();
            let mut topics = state.topics.lock().unwrap();
            for topic in topics.values_mut() {
                let Some((name, _)) = topic
                    .subs
                    .iter()
                    .find(|(_, s)| s.consumers.iter().any(|c| c.consumer_id == redeliver.consumer_id))
                    .map(|(n, s)| (n.clone(), s.sub_type))
                else {
                    continue;
                };
                let indexes: Vec<usize> = if redeliver.message_ids.is_empty() {
                    topic.subs[&name].unacked.iter().copied().collect()
                } else {
                    redeliver
                        .message_ids
                        .iter()
                        .map(|id| id.entry_id as usize)
                        .filter(|e| topic.subs[&name].unacked.contains(e))
                        .collect()
                };
                redeliver_entries(topic, &name, &indexes);
            }
        }
        Ok(CommandType::Seek) => {
            let seek = command.seek.unwrap();
            let mut topics = state.topics.lock().unwrap();
            for topic in topics.values_mut() {
                let Some(name) = topic
                    .subs
                    .iter()
                    .find(|(_, s)| s.consumers.iter().any(|c| c.consumer_id == seek.consumer_id))
                    .map(|(n, _)| n.clone())
                else {
                    continue;
                };
                let cursor = if let Some(id) = &seek.message_id {
                    if id.entry_id == u64::MAX {
                        0
                    } else {
                        id.entry_id as usize
                    }
                } else if let Some(ts) = seek.message_publish_time {
                    topic
                        .entries
                        .iter()
                        .position(|(m, _)| m.publish_time >= ts)
                        .unwrap_or(topic.entries.len())
                } else {
                    0
                };
                let sub = topic.subs.get_mut(&name).unwrap();
                sub.cursor = cursor;
                sub.unacked.clear();
                pump(topic);
            }
            send(tx, success(seek.request_id));
        }
        Ok(CommandType::GetLastMessageId) => {
            let get = command.get_last_message_id.unwrap();
            let topics = state.topics.lock().unwrap();
            let last = topics
                .values()
                .find(|t| {
                    t.subs
                        .values()
                        .any(|s| s.consumers.iter().any(|c| c.consumer_id == get.consumer_id))
                })
                .map(|t| t.entries.len());
            let id = match last {
                Some(len) if len > 0 => proto::MessageIdData {
                    ledger_id: 1,
                    entry_id: len as u64 - 1,
                    ..Default::default()
                },
                _ => proto::MessageIdData {
                    ledger_id: u64::MAX,
                    entry_id: u64::MAX,
                    ..Default::default()
                },
            };
            send(
                tx,
                BaseCommand {
                    r#type: CommandType::GetLastMessageIdResponse as i32,
                    get_last_message_id_response: Some(proto::CommandGetLastMessageIdResponse {
                        last_message_id: id,
                        request_id: get.request_id,
                    }),
                    ..Default::default()
                },
            );
        }
        Ok(CommandType::CloseProducer) => {
            let close = command.close_producer.unwrap();
            send(tx, success(close.request_id));
        }
        Ok(CommandType::CloseConsumer) => {
            let close = command.close_consumer.unwrap();
            remove_consumer(state, close.consumer_id, false);
            send(tx, success(close.request_id));
        }
        Ok(CommandType::Unsubscribe) => {
            let unsub = command.unsubscribe.unwrap();
            remove_consumer(state, unsub.consumer_id, true);
            send(tx, success(unsub.request_id));
        }
        other => panic!("mock broker does not handle {:?}", other),
    }
}

/// Deliver stored entries to subscriptions with credit, in order.
fn pump(topic: &mut Topic) {
    let entries = &topic.entries;
    for sub in topic.subs.values_mut() {
        while sub.cursor < entries.len() {
            let index = sub.cursor;
            if sub.acked.contains(&index) || (index as i64) <= sub.mark_delete {
                sub.cursor += 1;
                continue;
            }
            if !deliver_one(sub, entries, index, 0) {
                break;
            }
            sub.unacked.insert(index);
            sub.cursor += 1;
        }
    }
}

fn redeliver_entries(topic: &mut Topic, sub_name: &str, indexes: &[usize]) {
    let entries = &topic.entries;
    let Some(sub) = topic.subs.get_mut(sub_name) else {
        return;
    };
    for &index in indexes {
        deliver_one(sub, entries, index, 1);
    }
}

/// Returns false when the chosen consumer has no permits left.
fn deliver_one(
    sub: &mut Subscription,
    entries: &[(MessageMetadata, Bytes)],
    index: usize,
    redelivery_count: u32,
) -> bool {
    if sub.consumers.is_empty() {
        return false;
    }
    let (metadata, payload) = &entries[index];

    let consumer_index = if sub.sub_type == SubType::KeyShared as i32 {
        let key = metadata.partition_key.clone().unwrap_or_default();
        let assigned = match sub.key_assignment.get(&key) {
            Some(id) => *id,
            None => {
                let id = sub.consumers[sub.rr % sub.consumers.len()].consumer_id;
                sub.rr += 1;
                sub.key_assignment.insert(key, id);
                id
            }
        };
        match sub.consumers.iter().position(|c| c.consumer_id == assigned) {
            Some(i) => i,
            None => return false,
        }
    } else if sub.sub_type == SubType::Shared as i32 {
        sub.rr = (sub.rr + 1) % sub.consumers.len();
        sub.rr
    } else {
        0
    };

    let consumer = &mut sub.consumers[consumer_index];
    let cost = metadata.num_messages_in_batch.unwrap_or(1) as i64;
    if consumer.permits < cost {
        return false;
    }
    consumer.permits -= cost;

    let command = BaseCommand {
        r#type: CommandType::Message as i32,
        message: Some(proto::CommandMessage {
            consumer_id: consumer.consumer_id,
            message_id: proto::MessageIdData {
                ledger_id: 1,
                entry_id: index as u64,
                ..Default::default()
            },
            redelivery_count: Some(redelivery_count),
        }),
        ..Default::default()
    };
    let _ = consumer
        .tx
        .send(Frame::with_payload(command, metadata.clone(), payload.clone()));
    true
}

fn remove_consumer(state: &Arc<BrokerState>, consumer_id: u64, drop_subscription: bool) {
    let mut topics = state.topics.lock().unwrap();
    for topic in topics.values_mut() {
        let mut to_drop = None;
        for (name, sub) in topic.subs.iter_mut() {
            let had = sub.consumers.iter().any(|c| c.consumer_id == consumer_id);
            sub.consumers.retain(|c| c.consumer_id != consumer_id);
            if had && drop_subscription {
                to_drop = Some(name.clone());
            }
        }
        if let Some(name) = to_drop {
            topic.subs.remove(&name);
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<Frame>, command: BaseCommand) {
    let _ = tx.send(Frame::command(command));
}

fn connected() -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Connected as i32,
        connected: Some(proto::CommandConnected {
            server_version: "mock-broker".into(),
            protocol_version: Some(proto::PROTOCOL_VERSION),
            max_message_size: None,
        }),
        ..Default::default()
    }
}

fn success(request_id: u64) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Success as i32,
        success: Some(proto::CommandSuccess { request_id }),
        ..Default::default()
    }
}

