//! A broker held in memory, implementing the client seam for tests and
//! local runs. Partitions are append-only vectors, consumer groups keep
//! their committed offsets, and produce failures can be injected per topic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::broker::{
    BrokerClient, BrokerConsumer, BrokerProducer, ConsumedRecord, ProducerRecord,
};
use crate::config::ChannelConfig;
use crate::error::BrokerError;
use crate::types::{Partition, RecordHeaders};

const DEFAULT_GROUP: &str = "kafka-connector";

#[derive(Default)]
struct BrokerState {
    partitions: BTreeMap<Partition, Vec<ConsumedRecord>>,
    committed: HashMap<(String, Partition), i64>,
    commit_calls: Vec<(String, HashMap<Partition, i64>)>,
    failing_topics: HashSet<String>,
    consumers_created: usize,
    producers_created: usize,
    flushes: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    appended: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, record: ProducerRecord) -> i64 {
        let offset = {
            let mut state = self.state();
            let partition_number = record.partition.unwrap_or(0);
            let log = state
                .partitions
                .entry(Partition::new(record.topic.clone(), partition_number))
                .or_default();
            let offset = log.len() as i64;
            log.push(ConsumedRecord {
                topic: record.topic,
                partition: partition_number,
                offset,
                key: record.key,
                payload: record.payload,
                headers: record.headers,
                timestamp: None,
            });
            offset
        };
        self.appended.notify_waiters();
        offset
    }

    /// Appends a record to partition 0 of `topic`, returning its offset.
    pub fn produce(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> i64 {
        self.produce_to(topic, 0, key, payload, RecordHeaders::new())
    }

    pub fn produce_to(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        payload: &[u8],
        headers: RecordHeaders,
    ) -> i64 {
        self.push(ProducerRecord {
            topic: topic.to_string(),
            partition: Some(partition),
            key: key.map(<[u8]>::to_vec),
            payload: Some(payload.to_vec()),
            headers,
        })
    }

    /// Every record of a topic, ordered by partition then offset.
    pub fn records(&self, topic: &str) -> Vec<ConsumedRecord> {
        self.state()
            .partitions
            .iter()
            .filter(|(p, _)| p.topic() == topic)
            .flat_map(|(_, log)| log.iter().cloned())
            .collect()
    }

    pub fn fail_produce_to(&self, topic: &str) {
        self.state().failing_topics.insert(topic.to_string());
    }

    pub fn committed(&self, group: &str, partition: &Partition) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), partition.clone()))
            .copied()
    }

    /// Offsets of every commit call, in call order.
    pub fn commits(&self, group: &str) -> Vec<HashMap<Partition, i64>> {
        self.state()
            .commit_calls
            .iter()
            .filter(|(g, _)| g == group)
            .map(|(_, offsets)| offsets.clone())
            .collect()
    }

    pub fn consumers_created(&self) -> usize {
        self.state().consumers_created
    }

    pub fn producers_created(&self) -> usize {
        self.state().producers_created
    }

    /// Number of producer flushes requested so far.
    pub fn flushes(&self) -> usize {
        self.state().flushes
    }
}

impl BrokerClient for InMemoryBroker {
    fn create_consumer(
        &self,
        config: &ChannelConfig,
        topics: &[String],
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        let group = config.get_or("group.id", DEFAULT_GROUP).to_string();
        self.state().consumers_created += 1;
        debug!(group = %group, ?topics, "creating in-memory consumer");
        Ok(Arc::new(InMemoryConsumer {
            broker: self.clone(),
            group,
            topics: topics.to_vec(),
            positions: Mutex::new(HashMap::new()),
        }))
    }

    fn create_producer(
        &self,
        _config: &ChannelConfig,
    ) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        self.state().producers_created += 1;
        Ok(Arc::new(InMemoryProducer {
            broker: self.clone(),
        }))
    }
}

pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    topics: Vec<String>,
    positions: Mutex<HashMap<Partition, i64>>,
}

impl InMemoryConsumer {
    fn fetch(&self, max_records: usize) -> Vec<ConsumedRecord> {
        let state = self.broker.state();
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = Vec::new();

        for (partition, log) in state
            .partitions
            .iter()
            .filter(|(p, _)| self.topics.iter().any(|t| t == p.topic()))
        {
            let position = positions.entry(partition.clone()).or_insert_with(|| {
                state
                    .committed
                    .get(&(self.group.clone(), partition.clone()))
                    .copied()
                    .unwrap_or(0)
            });
            while records.len() < max_records {
                let Some(record) = usize::try_from(*position).ok().and_then(|i| log.get(i)) else {
                    break;
                };
                records.push(record.clone());
                *position += 1;
            }
        }
        records
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedRecord>, BrokerError> {
        let appended = self.broker.appended.notified();
        let records = self.fetch(max_records);
        if !records.is_empty() {
            return Ok(records);
        }
        if tokio::time::timeout(timeout, appended).await.is_err() {
            return Ok(Vec::new());
        }
        Ok(self.fetch(max_records))
    }

    async fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        for (partition, offset) in offsets {
            state
                .committed
                .insert((self.group.clone(), partition.clone()), *offset);
        }
        state.commit_calls.push((self.group.clone(), offsets.clone()));
        Ok(())
    }
}

pub struct InMemoryProducer {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerProducer for InMemoryProducer {
    async fn send(&self, record: ProducerRecord) -> Result<(), BrokerError> {
        if self.broker.state().failing_topics.contains(&record.topic) {
            return Err(BrokerError::Unavailable(format!(
                "topic {} rejects writes",
                record.topic
            )));
        }
        self.broker.push(record);
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.broker.state().flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(group: &str) -> ChannelConfig {
        ChannelConfig::new(
            "numbers",
            BTreeMap::from([("group.id".to_string(), group.to_string())]),
        )
    }

    #[tokio::test]
    async fn consumers_resume_from_committed_offsets() {
        let broker = InMemoryBroker::new();
        for i in 0..5u8 {
            broker.produce("numbers", None, &[i]);
        }
        let topics = vec!["numbers".to_string()];

        let first = broker.create_consumer(&config("g"), &topics).unwrap();
        let polled = first.poll(3, Duration::from_millis(10)).await.unwrap();
        assert_eq!(polled.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1, 2]);
        first
            .commit(&HashMap::from([(Partition::new("numbers", 0), 2)]))
            .await
            .unwrap();

        let second = broker.create_consumer(&config("g"), &topics).unwrap();
        let polled = second.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(polled.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(broker.consumers_created(), 2);
    }

    #[tokio::test]
    async fn empty_poll_waits_for_appends() {
        let broker = InMemoryBroker::new();
        let consumer = broker
            .create_consumer(&config("g"), &["late".to_string()])
            .unwrap();

        let writer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.produce("late", None, b"x");
        });

        let polled = consumer.poll(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(polled.len(), 1);
    }

    #[tokio::test]
    async fn injected_produce_failure() {
        let broker = InMemoryBroker::new();
        broker.fail_produce_to("dlq");
        let producer = broker.create_producer(&config("g")).unwrap();

        let result = producer
            .send(ProducerRecord {
                topic: "dlq".to_string(),
                partition: None,
                key: None,
                payload: Some(b"x".to_vec()),
                headers: RecordHeaders::new(),
            })
            .await;

        assert!(matches!(result, Err(BrokerError::Unavailable(_))));
        assert!(broker.records("dlq").is_empty());
    }
}
