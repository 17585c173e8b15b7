//! Constructors for the [`BaseCommand`] envelopes the client sends.
//!
//! Keeps the engines free of envelope boilerplate: every function returns a
//! fully-typed `BaseCommand` with the matching `type` tag set.

use crate::proto::*;

pub fn connect(client_version: &str, proxy_to_broker_url: Option<String>) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Connect as i32,
        connect: Some(CommandConnect {
            client_version: client_version.to_string(),
            protocol_version: Some(PROTOCOL_VERSION),
            proxy_to_broker_url,
            auth_method: None,
            auth_data: None,
            auth_method_name: None,
        }),
        ..Default::default()
    }
}

pub fn pong() -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Pong as i32,
        pong: Some(CommandPong {}),
        ..Default::default()
    }
}

pub fn ping() -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Ping as i32,
        ping: Some(CommandPing {}),
        ..Default::default()
    }
}

pub fn partitioned_metadata(request_id: u64, topic: &str) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::PartitionedMetadata as i32,
        partition_metadata: Some(CommandPartitionedTopicMetadata {
            topic: topic.to_string(),
            request_id,
        }),
        ..Default::default()
    }
}

pub fn lookup(request_id: u64, topic: &str, authoritative: bool) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Lookup as i32,
        lookup_topic: Some(CommandLookupTopic {
            topic: topic.to_string(),
            request_id,
            authoritative: Some(authoritative),
        }),
        ..Default::default()
    }
}

pub fn get_topics_of_namespace(request_id: u64, namespace: &str, mode: TopicsMode) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::GetTopicsOfNamespace as i32,
        get_topics_of_namespace: Some(CommandGetTopicsOfNamespace {
            request_id,
            namespace: namespace.to_string(),
            mode: Some(mode as i32),
        }),
        ..Default::default()
    }
}

pub fn producer(
    request_id: u64,
    producer_id: u64,
    topic: &str,
    producer_name: Option<String>,
    epoch: u64,
) -> BaseCommand {
    let user_provided = producer_name.is_some();
    BaseCommand {
        r#type: CommandType::Producer as i32,
        producer: Some(CommandProducer {
            topic: topic.to_string(),
            producer_id,
            request_id,
            producer_name,
            encrypted: None,
            metadata: Vec::new(),
            epoch: Some(epoch),
            user_provided_producer_name: Some(user_provided),
        }),
        ..Default::default()
    }
}

pub fn send(producer_id: u64, sequence_id: u64, num_messages: Option<i32>) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Send as i32,
        send: Some(CommandSend {
            producer_id,
            sequence_id,
            num_messages,
        }),
        ..Default::default()
    }
}

#[allow(clippy::too_many_arguments)]
pub fn subscribe(
    request_id: u64,
    consumer_id: u64,
    topic: &str,
    subscription: &str,
    sub_type: SubType,
    consumer_name: &str,
    durable: bool,
    start_message_id: Option<MessageIdData>,
    initial_position: InitialPosition,
    read_compacted: bool,
) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Subscribe as i32,
        subscribe: Some(CommandSubscribe {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            sub_type: sub_type as i32,
            consumer_id,
            request_id,
            consumer_name: Some(consumer_name.to_string()),
            priority_level: None,
            durable: Some(durable),
            start_message_id,
            metadata: Vec::new(),
            read_compacted: Some(read_compacted),
            initial_position: Some(initial_position as i32),
            replicate_subscription_state: None,
            force_topic_creation: None,
        }),
        ..Default::default()
    }
}

pub fn flow(consumer_id: u64, message_permits: u32) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Flow as i32,
        flow: Some(CommandFlow {
            consumer_id,
            message_permits,
        }),
        ..Default::default()
    }
}

pub fn ack(consumer_id: u64, ack_type: AckType, message_ids: Vec<MessageIdData>) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Ack as i32,
        ack: Some(CommandAck {
            consumer_id,
            ack_type: ack_type as i32,
            message_id: message_ids,
            request_id: None,
        }),
        ..Default::default()
    }
}

pub fn redeliver_unacknowledged_messages(
    consumer_id: u64,
    message_ids: Vec<MessageIdData>,
) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::RedeliverUnacknowledgedMessages as i32,
        redeliver_unacknowledged_messages: Some(CommandRedeliverUnacknowledgedMessages {
            consumer_id,
            message_ids,
        }),
        ..Default::default()
    }
}

pub fn seek_by_id(request_id: u64, consumer_id: u64, message_id: MessageIdData) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Seek as i32,
        seek: Some(CommandSeek {
            consumer_id,
            request_id,
            message_id: Some(message_id),
            message_publish_time: None,
        }),
        ..Default::default()
    }
}

pub fn seek_by_time(request_id: u64, consumer_id: u64, publish_time: u64) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Seek as i32,
        seek: Some(CommandSeek {
            consumer_id,
            request_id,
            message_id: None,
            message_publish_time: Some(publish_time),
        }),
        ..Default::default()
    }
}

pub fn get_last_message_id(request_id: u64, consumer_id: u64) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::GetLastMessageId as i32,
        get_last_message_id: Some(CommandGetLastMessageId {
            consumer_id,
            request_id,
        }),
        ..Default::default()
    }
}

pub fn unsubscribe(request_id: u64, consumer_id: u64) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::Unsubscribe as i32,
        unsubscribe: Some(CommandUnsubscribe {
            consumer_id,
            request_id,
        }),
        ..Default::default()
    }
}

pub fn close_producer(request_id: u64, producer_id: u64) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::CloseProducer as i32,
        close_producer: Some(CommandCloseProducer {
            producer_id,
            request_id,
        }),
        ..Default::default()
    }
}

pub fn close_consumer(request_id: u64, consumer_id: u64) -> BaseCommand {
    BaseCommand {
        r#type: CommandType::CloseConsumer as i32,
        close_consumer: Some(CommandCloseConsumer {
            consumer_id,
            request_id,
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_type_tags_match() {
        assert_eq!(connect("magnetar", None).type_name(), "CONNECT");
        assert_eq!(flow(1, 500).type_name(), "FLOW");
        assert_eq!(
            seek_by_time(1, 2, 1_700_000_000_000).type_name(),
            "SEEK"
        );
        assert_eq!(close_consumer(1, 2).type_name(), "CLOSE_CONSUMER");
    }

    #[test]
    fn test_subscribe_non_durable_carries_start() {
        let start = MessageIdData {
            ledger_id: 4,
            entry_id: 2,
            ..Default::default()
        };
        let cmd = subscribe(
            1,
            2,
            "persistent://public/default/t",
            "reader-abc",
            SubType::Exclusive,
            "reader",
            false,
            Some(start.clone()),
            InitialPosition::Latest,
            false,
        );
        let sub = cmd.subscribe.unwrap();
        assert_eq!(sub.durable, Some(false));
        assert_eq!(sub.start_message_id, Some(start));
    }
}
