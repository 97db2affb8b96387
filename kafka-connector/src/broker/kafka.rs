use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use health::HealthHandle;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::broker::{BrokerClient, BrokerConsumer, BrokerProducer, ConsumedRecord, ProducerRecord};
use crate::config::ChannelConfig;
use crate::error::BrokerError;
use crate::types::{Partition, RecordHeaders};

pub struct KafkaContext {
    liveness: Option<HealthHandle>,
}

impl From<Option<HealthHandle>> for KafkaContext {
    fn from(liveness: Option<HealthHandle>) -> Self {
        KafkaContext { liveness }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy_blocking();
        }
    }
}

impl ConsumerContext for KafkaContext {}

/// Kafka consumer configuration with the connector defaults: offsets are
/// stored and committed by the connector, never by librdkafka on its own.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn for_channel(config: &ChannelConfig) -> Self {
        let mut client_config = ClientConfig::new();
        let default_group = format!("kafka-connector-{}", config.channel());

        client_config
            .set("group.id", default_group)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000")
            .set("statistics.interval.ms", "10000");

        for (key, value) in config.client_properties() {
            client_config.set(key, value);
        }

        Self {
            config: client_config,
        }
    }

    /// Leaves commits to librdkafka, for channels using the `ignore` commit strategy.
    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("enable.auto.offset.store", "true")
                .set("enable.auto.commit", "true");
        }
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Broker client backed by librdkafka.
#[derive(Default)]
pub struct KafkaClient {
    liveness: Option<HealthHandle>,
}

impl KafkaClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports the client as healthy every time librdkafka emits statistics.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }
}

impl BrokerClient for KafkaClient {
    fn create_consumer(
        &self,
        config: &ChannelConfig,
        topics: &[String],
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        let auto_commit = config.get("commit-strategy") == Some("ignore");
        let client_config = ConsumerConfigBuilder::for_channel(config)
            .with_auto_commit(auto_commit)
            .build();
        debug!("rdkafka consumer configuration: {:?}", client_config);

        let consumer: StreamConsumer<KafkaContext> =
            client_config.create_with_context(self.liveness.clone().into())?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;
        info!(channel = config.channel(), ?topics, "subscribed Kafka consumer");

        Ok(Arc::new(KafkaConsumer { consumer }))
    }

    fn create_producer(
        &self,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        let mut client_config = ClientConfig::new();
        client_config.set("statistics.interval.ms", "10000");
        for (key, value) in config.client_properties() {
            client_config.set(key, value);
        }
        debug!("rdkafka producer configuration: {:?}", client_config);

        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(self.liveness.clone().into())?;

        // "Ping" the Kafka brokers by requesting metadata
        let metadata = producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))?;
        info!(
            channel = config.channel(),
            "connected to Kafka brokers, found {} topics",
            metadata.topics().len()
        );

        Ok(Arc::new(KafkaProducer { producer }))
    }
}

impl From<&BorrowedMessage<'_>> for ConsumedRecord {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            headers: message.headers().map(RecordHeaders::from).unwrap_or_default(),
            timestamp: message.timestamp().to_millis(),
        }
    }
}

pub struct KafkaConsumer {
    consumer: StreamConsumer<KafkaContext>,
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedRecord>, BrokerError> {
        let first = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(received) => received?,
        };
        let mut records = Vec::with_capacity(max_records);
        records.push(ConsumedRecord::from(&first));

        // Drain what librdkafka already buffered, without waiting again
        while records.len() < max_records {
            match self.consumer.recv().now_or_never() {
                Some(Ok(message)) => records.push(ConsumedRecord::from(&message)),
                Some(Err(e)) => {
                    debug!("stopping poll early after error: {e:#}");
                    break;
                }
                None => break,
            }
        }
        Ok(records)
    }

    async fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), BrokerError> {
        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next_offset),
            )?;
        }
        self.consumer.commit(&list, CommitMode::Async)?;
        Ok(())
    }
}

pub struct KafkaProducer {
    producer: FutureProducer<KafkaContext>,
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn send(&self, record: ProducerRecord) -> Result<(), BrokerError> {
        let future_record = FutureRecord {
            topic: &record.topic,
            key: record.key.as_deref(),
            payload: record.payload.as_deref(),
            timestamp: None,
            partition: record.partition,
            headers: Some(record.headers.to_owned_headers()),
        };

        let delivery = self
            .producer
            .send_result(future_record)
            .map_err(|(e, _)| BrokerError::Kafka(e))?;
        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(BrokerError::Kafka(e)),
            Err(_) => Err(BrokerError::Canceled(record.topic)),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BrokerError::Unavailable(format!("flush task failed: {e}")))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn channel(values: &[(&str, &str)]) -> ChannelConfig {
        ChannelConfig::new(
            "orders",
            values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn consumer_defaults_disable_auto_commit() {
        let config = ConsumerConfigBuilder::for_channel(&channel(&[
            ("bootstrap.servers", "kafka:9092"),
            ("value.deserializer", "integer"),
        ]))
        .build();

        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("group.id"), Some("kafka-connector-orders"));
        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(config.get("value.deserializer"), None);
    }

    #[test]
    fn channel_properties_override_defaults() {
        let config = ConsumerConfigBuilder::for_channel(&channel(&[
            ("group.id", "billing"),
            ("session.timeout.ms", "10000"),
        ]))
        .with_auto_commit(true)
        .build();

        assert_eq!(config.get("group.id"), Some("billing"));
        assert_eq!(config.get("session.timeout.ms"), Some("10000"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
    }
}
