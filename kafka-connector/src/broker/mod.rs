//! The broker client seam: polling, committing and producing records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ChannelConfig;
use crate::error::BrokerError;
use crate::types::{Partition, RecordHeaders};

pub mod kafka;
pub mod memory;

/// A record as delivered by a broker consumer, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: RecordHeaders,
    pub timestamp: Option<i64>,
}

impl ConsumedRecord {
    pub fn partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}

/// A serialized record to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: RecordHeaders,
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Waits up to `timeout` for records and returns at most `max_records`
    /// of them. An empty result is not an error.
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedRecord>, BrokerError>;

    /// Commits the next offset to consume for each partition.
    async fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Publishes a record, returning once the broker confirmed delivery.
    async fn send(&self, record: ProducerRecord) -> Result<(), BrokerError>;

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

/// Creates broker consumers and producers from resolved channel configurations.
pub trait BrokerClient: Send + Sync {
    fn create_consumer(
        &self,
        config: &ChannelConfig,
        topics: &[String],
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError>;

    fn create_producer(
        &self,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn BrokerProducer>, BrokerError>;
}
