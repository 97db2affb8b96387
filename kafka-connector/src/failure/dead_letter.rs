use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use metrics::counter;
use tracing::{error, info};

use super::{coordinates, FailureHandler};
use crate::broker::{BrokerProducer, ProducerRecord};
use crate::codec::Codec;
use crate::error::ConnectorError;
use crate::message::Message;
use crate::metrics_consts::DEAD_LETTER_RECORDS;

pub const DEAD_LETTER_REASON: &str = "dead-letter-reason";
pub const DEAD_LETTER_CAUSE: &str = "dead-letter-cause";
pub const DEAD_LETTER_TOPIC: &str = "dead-letter-topic";
pub const DEAD_LETTER_PARTITION: &str = "dead-letter-partition";
pub const DEAD_LETTER_OFFSET: &str = "dead-letter-offset";

/// Republishes nacked records to a dead-letter topic, with headers
/// describing the failure and where the record came from.
pub struct KafkaDeadLetterQueue<K, V> {
    channel: String,
    topic: String,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    producer: Arc<dyn BrokerProducer>,
}

impl<K, V> KafkaDeadLetterQueue<K, V> {
    pub fn new(
        channel: impl Into<String>,
        topic: impl Into<String>,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        producer: Arc<dyn BrokerProducer>,
    ) -> Self {
        Self {
            channel: channel.into(),
            topic: topic.into(),
            key_codec,
            value_codec,
            producer,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn dead_letter_record(
        &self,
        message: &Message<K, V>,
        cause: &anyhow::Error,
    ) -> Result<ProducerRecord, ConnectorError> {
        let incoming = message.metadata().incoming().ok_or_else(|| {
            ConnectorError::Processing(anyhow!(
                "cannot dead-letter a message without incoming record metadata"
            ))
        })?;

        let key = message
            .key()
            .map(|k| self.key_codec.serialize(&self.topic, k))
            .transpose()?;
        let payload = self.value_codec.serialize(&self.topic, message.value())?;

        let mut headers = incoming.headers.clone();
        headers.set(DEAD_LETTER_REASON, cause.to_string());
        if let Some(source) = cause.chain().nth(1) {
            headers.set(DEAD_LETTER_CAUSE, source.to_string());
        }
        headers.set(DEAD_LETTER_TOPIC, incoming.topic.clone());
        headers.set(DEAD_LETTER_PARTITION, incoming.partition.to_string());
        headers.set(DEAD_LETTER_OFFSET, incoming.offset.to_string());

        Ok(ProducerRecord {
            topic: self.topic.clone(),
            partition: None,
            key,
            payload: Some(payload),
            headers,
        })
    }
}

#[async_trait]
impl<K, V> FailureHandler<K, V> for KafkaDeadLetterQueue<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn handle(
        &self,
        message: &Message<K, V>,
        cause: &anyhow::Error,
    ) -> Result<(), ConnectorError> {
        let record = coordinates(message);
        let dead_letter = self.dead_letter_record(message, cause)?;

        info!(
            channel = %self.channel,
            record = %record,
            "a message sent to channel {} has been nacked, sending the record to the dead letter topic {}",
            self.channel,
            self.topic
        );
        match self.producer.send(dead_letter).await {
            Ok(()) => {
                counter!(DEAD_LETTER_RECORDS, "channel" => self.channel.clone(), "status" => "ok")
                    .increment(1);
                Ok(())
            }
            Err(source) => {
                error!(
                    channel = %self.channel,
                    record = %record,
                    "failed to send {} to dead letter topic {}: {source}",
                    record,
                    self.topic
                );
                counter!(
                    DEAD_LETTER_RECORDS,
                    "channel" => self.channel.clone(),
                    "status" => "error"
                )
                .increment(1);
                Err(ConnectorError::DeadLetter {
                    topic: self.topic.clone(),
                    source,
                })
            }
        }
    }

    /// Every record is republished individually. The first failure is the
    /// batch outcome, after all records were attempted.
    async fn handle_batch(
        &self,
        records: &[Message<K, V>],
        cause: &anyhow::Error,
    ) -> Result<(), ConnectorError> {
        let mut first_failure = None;
        for record in records {
            if let Err(e) = self.handle(record, cause).await {
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
