//! Outgoing channel: publishes messages to the broker, acking each message
//! once its record is delivered.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, warn};

use crate::broker::{BrokerClient, BrokerProducer, ProducerRecord};
use crate::codec::{Codec, CodecRegistry, DefaultCodecs};
use crate::config::{ChannelConfig, OutgoingConfig};
use crate::error::{ConnectorError, WiringError};
use crate::message::Message;
use crate::metrics_consts::RECORDS_SENT;
use crate::propagation::TracePropagator;
use crate::source::ProducerHook;
use crate::types::RecordHeaders;

/// Terminal consumer of a mediator's output.
#[async_trait]
pub trait MessageSink<M>: Send + Sync {
    async fn send(&self, message: M) -> Result<(), ConnectorError>;
}

pub struct KafkaSink<K, V> {
    config: OutgoingConfig,
    producer: Arc<dyn BrokerProducer>,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    tracing: Option<TracePropagator>,
}

impl<K, V> KafkaSink<K, V>
where
    K: DefaultCodecs + Send + Sync,
    V: DefaultCodecs + Send + Sync,
{
    pub fn builder(
        config: ChannelConfig,
        client: Arc<dyn BrokerClient>,
    ) -> KafkaSinkBuilder<K, V> {
        KafkaSinkBuilder {
            config,
            client,
            key_codecs: K::codecs(),
            value_codecs: V::codecs(),
            tracing: None,
            producer_hooks: Vec::new(),
        }
    }
}

impl<K, V> KafkaSink<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn config(&self) -> &OutgoingConfig {
        &self.config
    }

    fn record(&self, message: &Message<K, V>) -> Result<ProducerRecord, ConnectorError> {
        let outgoing = message.metadata().outgoing();
        let topic = outgoing
            .and_then(|o| o.topic.clone())
            .unwrap_or_else(|| self.config.topic.clone());
        let partition = outgoing.and_then(|o| o.partition).or(self.config.partition);
        let mut headers = outgoing
            .map(|o| o.headers.clone())
            .unwrap_or_else(RecordHeaders::new);

        let key = message
            .key()
            .map(|k| self.key_codec.serialize(&topic, k))
            .transpose()?;
        let payload = self.value_codec.serialize(&topic, message.value())?;

        if let Some(tracing) = &self.tracing {
            tracing.on_produce(&topic, partition, message.metadata().tracing(), &mut headers);
        }

        Ok(ProducerRecord {
            topic,
            partition,
            key,
            payload: Some(payload),
            headers,
        })
    }
}

impl<K, V> KafkaSink<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Publishes a message, acking it on delivery. On failure the message is
    /// nacked and the failure returned.
    pub async fn publish(&self, message: Message<K, V>) -> Result<(), ConnectorError> {
        let record = match self.record(&message) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    channel = %self.config.channel,
                    "failed to serialize outgoing message: {e:#}"
                );
                message.nack(anyhow!("{e:#}")).await?;
                return Err(e);
            }
        };
        let topic = record.topic.clone();

        match self.producer.send(record).await {
            Ok(()) => {
                debug!(channel = %self.config.channel, topic = %topic, "record delivered");
                counter!(RECORDS_SENT, "channel" => self.config.channel.clone(), "status" => "ok")
                    .increment(1);
                message.ack().await
            }
            Err(source) => {
                warn!(
                    channel = %self.config.channel,
                    topic = %topic,
                    "failed to deliver record: {source:#}"
                );
                counter!(
                    RECORDS_SENT,
                    "channel" => self.config.channel.clone(),
                    "status" => "error"
                )
                .increment(1);
                message
                    .nack(anyhow!("failed to deliver record to {topic}: {source}"))
                    .await?;
                Err(ConnectorError::Send { topic, source })
            }
        }
    }

    /// Waits for records still queued in the producer.
    pub async fn flush(&self, timeout: Duration) -> Result<(), ConnectorError> {
        self.producer.flush(timeout).await?;
        Ok(())
    }
}

#[async_trait]
impl<K, V> MessageSink<Message<K, V>> for KafkaSink<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn send(&self, message: Message<K, V>) -> Result<(), ConnectorError> {
        match self.publish(message).await {
            // Nacked: the message's failure strategy owns the outcome
            Err(ConnectorError::Send { .. } | ConnectorError::Codec(_)) => Ok(()),
            Err(e) if e.is_message_scoped() => {
                warn!(channel = %self.config.channel, "message left unsettled: {e:#}");
                Ok(())
            }
            other => other,
        }
    }
}

pub struct KafkaSinkBuilder<K, V> {
    config: ChannelConfig,
    client: Arc<dyn BrokerClient>,
    key_codecs: CodecRegistry<K>,
    value_codecs: CodecRegistry<V>,
    tracing: Option<TracePropagator>,
    producer_hooks: Vec<ProducerHook>,
}

impl<K, V> KafkaSinkBuilder<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn key_codecs(mut self, codecs: CodecRegistry<K>) -> Self {
        self.key_codecs = codecs;
        self
    }

    pub fn value_codecs(mut self, codecs: CodecRegistry<V>) -> Self {
        self.value_codecs = codecs;
        self
    }

    pub fn tracing(mut self, propagator: TracePropagator) -> Self {
        self.tracing = Some(propagator);
        self
    }

    pub fn on_producer_created(
        mut self,
        hook: impl Fn(&dyn BrokerProducer) + Send + Sync + 'static,
    ) -> Self {
        self.producer_hooks.push(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<KafkaSink<K, V>, WiringError> {
        let config = OutgoingConfig::from_channel(&self.config)?;
        let key_codec = self.key_codecs.resolve(&config.key_serializer)?;
        let value_codec = self.value_codecs.resolve(&config.value_serializer)?;
        let producer = self
            .client
            .create_producer(&self.config)
            .map_err(|source| WiringError::Client {
                channel: config.channel.clone(),
                source,
            })?;
        for hook in &self.producer_hooks {
            hook(producer.as_ref());
        }
        let tracing = config
            .tracing_enabled
            .then(|| self.tracing.unwrap_or_default());

        Ok(KafkaSink {
            config,
            producer,
            key_codec,
            value_codec,
            tracing,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::error::BrokerError;
    use crate::message::tests::RecordingAcknowledger;
    use crate::message::Acknowledger;
    use crate::message::{Metadata, MetadataEntry, OutgoingKafkaRecordMetadata};

    fn sink(broker: &InMemoryBroker, extra: &[(&str, &str)]) -> KafkaSink<String, i32> {
        let mut values = BTreeMap::from([
            ("topic".to_string(), "out".to_string()),
            ("value.serializer".to_string(), "integer".to_string()),
        ]);
        for (k, v) in extra {
            values.insert(k.to_string(), v.to_string());
        }
        KafkaSink::builder(ChannelConfig::new("out-channel", values), Arc::new(broker.clone()))
            .build()
            .unwrap()
    }

    fn message(
        value: i32,
        metadata: Metadata,
    ) -> (Message<String, i32>, Arc<RecordingAcknowledger>) {
        let acker = Arc::new(RecordingAcknowledger::default());
        let message = Message::new(Some("k".to_string()), value, metadata, acker.clone());
        (message, acker)
    }

    #[tokio::test]
    async fn publishes_and_acks_on_delivery() {
        let broker = InMemoryBroker::new();
        let (message, acker) = message(5, Metadata::new());

        sink(&broker, &[("tracing-enabled", "false")])
            .publish(message)
            .await
            .unwrap();

        let records = broker.records("out");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some(b"k".as_slice()));
        assert_eq!(records[0].payload.as_deref(), Some([0, 0, 0, 5].as_slice()));
        assert!(records[0].headers.is_empty());
        assert_eq!(*acker.calls.lock().unwrap(), vec!["ack 5".to_string()]);
    }

    #[tokio::test]
    async fn outgoing_metadata_overrides_the_channel_topic() {
        let broker = InMemoryBroker::new();
        let metadata = Metadata::new().with(MetadataEntry::Outgoing(OutgoingKafkaRecordMetadata {
            topic: Some("elsewhere".to_string()),
            partition: Some(1),
            headers: RecordHeaders::new().insert("kind", "number"),
        }));
        let (message, _) = message(1, metadata);

        sink(&broker, &[("tracing-enabled", "false")])
            .publish(message)
            .await
            .unwrap();

        assert!(broker.records("out").is_empty());
        let records = broker.records("elsewhere");
        assert_eq!(records[0].partition, 1);
        assert_eq!(records[0].headers.last_str("kind"), Some("number"));
    }

    #[tokio::test]
    async fn delivery_failure_nacks_the_message() {
        let broker = InMemoryBroker::new();
        broker.fail_produce_to("out");
        let (message, acker) = message(2, Metadata::new());

        let result = sink(&broker, &[]).publish(message).await;

        assert!(matches!(result, Err(ConnectorError::Send { topic, .. }) if topic == "out"));
        let calls = acker.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("nack 2 failed to deliver record to out"));
    }

    #[tokio::test]
    async fn nacked_delivery_failures_do_not_fail_the_sink() {
        let broker = InMemoryBroker::new();
        broker.fail_produce_to("out");
        let (message, acker) = message(2, Metadata::new());

        let result = MessageSink::send(&sink(&broker, &[]), message).await;

        assert!(result.is_ok());
        assert_eq!(acker.calls.lock().unwrap().len(), 1);
    }

    /// Nacks as a channel whose dead-letter topic is unreachable would.
    struct UnreachableDeadLetter;

    #[async_trait]
    impl Acknowledger<String, i32> for UnreachableDeadLetter {
        async fn ack(&self, _: &Message<String, i32>) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn nack(
            &self,
            _: &Message<String, i32>,
            _: &anyhow::Error,
        ) -> Result<(), ConnectorError> {
            Err(ConnectorError::DeadLetter {
                topic: "out-dlq".to_string(),
                source: BrokerError::Unavailable("out-dlq rejects writes".to_string()),
            })
        }

        async fn ack_batch(&self, _: &[Message<String, i32>]) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn nack_batch(
            &self,
            _: &[Message<String, i32>],
            _: &anyhow::Error,
        ) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_dead_letter_nack_only_ends_the_message() {
        let broker = InMemoryBroker::new();
        broker.fail_produce_to("out");
        let sink = sink(&broker, &[]);
        let unsettled = |value: i32| -> Message<String, i32> {
            Message::new(None, value, Metadata::new(), Arc::new(UnreachableDeadLetter))
        };

        let published = sink.publish(unsettled(2)).await;
        let sent = MessageSink::send(&sink, unsettled(3)).await;

        assert!(matches!(published, Err(ConnectorError::DeadLetter { .. })));
        assert!(sent.is_ok());
    }

    #[tokio::test]
    async fn flush_reaches_the_producer() {
        let broker = InMemoryBroker::new();

        sink(&broker, &[]).flush(Duration::from_secs(1)).await.unwrap();

        assert_eq!(broker.flushes(), 1);
    }

    #[tokio::test]
    async fn injects_a_traceparent_header() {
        let broker = InMemoryBroker::new();
        let (message, _) = message(3, Metadata::new());

        sink(&broker, &[]).publish(message).await.unwrap();

        let records = broker.records("out");
        let traceparent = records[0].headers.last_str("traceparent");
        assert!(traceparent.is_some_and(|t| t.starts_with("00-")));
    }
}
