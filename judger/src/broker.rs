//! The message broker adapter: timeout-polled, manually-committed
//! consumption of submissions, and keyed production of results.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer as RdConsumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};

use crate::error::BrokerError;

/// An inbound message, decoupled from the borrowed lifetime of the
/// underlying Kafka message so it can be handed off to a worker task.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl InboundMessage {
    /// Builds a standalone inbound message for use by test doubles and
    /// custom `MessageConsumer` implementations that have no real
    /// topic/partition/offset to report.
    pub fn for_test(payload: Vec<u8>) -> Self {
        Self {
            payload,
            topic: "test".into(),
            partition: 0,
            offset: 0,
        }
    }
}

#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Polls for one message. A `None` return on timeout is expected
    /// and must not be treated as an error by the caller.
    async fn poll(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError>;

    /// Durably records the message's offset. Must be called only after
    /// the judging outcome has been durably persisted.
    async fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Produces `payload` keyed by `key` (the submission id), so
    /// consumers partitioning by key see per-submission ordering.
    async fn produce(&self, key: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    pub fn new(brokers: &str, group_id: &str, topic: &str) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "10000")
            .create()
            .map_err(|e| BrokerError::Poll(e.to_string()))?;

        RdConsumer::subscribe(&consumer, &[topic]).map_err(|e| BrokerError::Poll(e.to_string()))?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(msg)) => {
                let payload = msg.payload().unwrap_or_default().to_vec();
                Ok(Some(InboundMessage {
                    payload,
                    topic: msg.topic().to_string(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                }))
            }
            Ok(Err(e)) => Err(BrokerError::Poll(e.to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )
        .map_err(|e| BrokerError::Commit(e.to_string()))?;

        self.consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Sync)
            .map_err(|e| BrokerError::Commit(e.to_string()))
    }
}

pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaProducer {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| BrokerError::Produce(e.to_string()))?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    async fn produce(&self, key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);
        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| BrokerError::Produce(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory broker pair used by processor tests: no network,
    /// no Kafka cluster.
    pub(crate) struct FakeBroker {
        pub inbox: Mutex<Vec<InboundMessage>>,
        pub committed: Mutex<Vec<(String, i32, i64)>>,
        pub produced: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl FakeBroker {
        pub fn new(payloads: Vec<Vec<u8>>) -> Self {
            let inbox = payloads
                .into_iter()
                .enumerate()
                .map(|(i, payload)| InboundMessage {
                    payload,
                    topic: "submissions".into(),
                    partition: 0,
                    offset: i as i64,
                })
                .collect();
            Self {
                inbox: Mutex::new(inbox),
                committed: Mutex::new(Vec::new()),
                produced: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessageConsumer for FakeBroker {
        async fn poll(&self, _timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
            Ok(self.inbox.lock().unwrap().pop())
        }

        async fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError> {
            self.committed.lock().unwrap().push((
                message.topic.clone(),
                message.partition,
                message.offset,
            ));
            Ok(())
        }
    }

    #[async_trait]
    impl MessageProducer for FakeBroker {
        async fn produce(&self, key: &str, payload: &[u8]) -> Result<(), BrokerError> {
            self.produced
                .lock()
                .unwrap()
                .push((key.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn poll_returns_none_when_empty_without_erroring() {
        let broker = FakeBroker::new(vec![]);
        let result = broker.poll(Duration::from_millis(10)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn commit_records_offset() {
        let broker = FakeBroker::new(vec![b"payload".to_vec()]);
        let msg = broker.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        broker.commit(&msg).await.unwrap();
        assert_eq!(broker.committed.lock().unwrap().len(), 1);
    }
}
