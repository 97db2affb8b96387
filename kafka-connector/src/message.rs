use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::warn;

use crate::error::ConnectorError;
use crate::metrics_consts::DUPLICATE_ACKNOWLEDGMENTS;
use crate::propagation::TraceLink;
use crate::types::{Partition, RecordHeaders};

/// Coordinates of a record consumed from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingKafkaRecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
    pub headers: RecordHeaders,
}

impl IncomingKafkaRecordMetadata {
    pub fn partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}

/// Per-message overrides for an outgoing channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingKafkaRecordMetadata {
    pub topic: Option<String>,
    pub partition: Option<i32>,
    pub headers: RecordHeaders,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataEntry {
    Incoming(IncomingKafkaRecordMetadata),
    Outgoing(OutgoingKafkaRecordMetadata),
    Tracing(TraceLink),
}

impl MetadataEntry {
    fn same_kind(&self, other: &MetadataEntry) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Ordered metadata of a message, holding at most one entry per kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<MetadataEntry>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, replacing the existing one of the same kind in place.
    pub fn with(mut self, entry: MetadataEntry) -> Self {
        match self.entries.iter_mut().find(|e| e.same_kind(&entry)) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self
    }

    pub fn incoming(&self) -> Option<&IncomingKafkaRecordMetadata> {
        self.entries.iter().find_map(|e| match e {
            MetadataEntry::Incoming(m) => Some(m),
            _ => None,
        })
    }

    pub fn outgoing(&self) -> Option<&OutgoingKafkaRecordMetadata> {
        self.entries.iter().find_map(|e| match e {
            MetadataEntry::Outgoing(m) => Some(m),
            _ => None,
        })
    }

    pub fn tracing(&self) -> Option<&TraceLink> {
        self.entries.iter().find_map(|e| match e {
            MetadataEntry::Tracing(m) => Some(m),
            _ => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetadataEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Completes acknowledgments on behalf of the channel a message came from.
///
/// Implementations receive each message at most once: the settle flag of
/// `Message` and `RecordBatch` filters out repeated calls before they get here.
#[async_trait]
pub trait Acknowledger<K, V>: Send + Sync {
    async fn ack(&self, message: &Message<K, V>) -> Result<(), ConnectorError>;

    async fn nack(
        &self,
        message: &Message<K, V>,
        cause: &anyhow::Error,
    ) -> Result<(), ConnectorError>;

    async fn ack_batch(&self, records: &[Message<K, V>]) -> Result<(), ConnectorError>;

    async fn nack_batch(
        &self,
        records: &[Message<K, V>],
        cause: &anyhow::Error,
    ) -> Result<(), ConnectorError>;
}

/// Acknowledger for messages created by the application itself.
pub struct NoopAcknowledger;

#[async_trait]
impl<K, V> Acknowledger<K, V> for NoopAcknowledger
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn ack(&self, _message: &Message<K, V>) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn nack(
        &self,
        _message: &Message<K, V>,
        _cause: &anyhow::Error,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn ack_batch(&self, _records: &[Message<K, V>]) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn nack_batch(
        &self,
        _records: &[Message<K, V>],
        _cause: &anyhow::Error,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Flips a settle flag, returns false (and counts it) if it was already set.
pub(crate) fn settle(flag: &AtomicBool, operation: &str, subject: &dyn fmt::Display) -> bool {
    if flag.swap(true, Ordering::AcqRel) {
        warn!(
            "ignoring {} of {}: already acknowledged or negatively acknowledged",
            operation, subject
        );
        counter!(DUPLICATE_ACKNOWLEDGMENTS, "operation" => operation.to_string()).increment(1);
        return false;
    }
    true
}

/// A payload with its key, metadata and acknowledgment.
///
/// Clones share their acknowledgment state: whichever clone is acked or
/// nacked first settles the message, later calls are logged and ignored.
pub struct Message<K, V> {
    key: Option<K>,
    value: V,
    metadata: Metadata,
    acker: Arc<dyn Acknowledger<K, V>>,
    settled: Arc<AtomicBool>,
}

impl<K: Clone, V: Clone> Clone for Message<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            metadata: self.metadata.clone(),
            acker: self.acker.clone(),
            settled: self.settled.clone(),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Message<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("metadata", &self.metadata)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<K, V> fmt::Display for Message<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.metadata.incoming() {
            Some(m) => write!(f, "message {}-{}@{}", m.topic, m.partition, m.offset),
            None => write!(f, "message"),
        }
    }
}

impl<K, V> Message<K, V> {
    pub fn new(
        key: Option<K>,
        value: V,
        metadata: Metadata,
        acker: Arc<dyn Acknowledger<K, V>>,
    ) -> Self {
        Self {
            key,
            value,
            metadata,
            acker,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn with_key(mut self, key: K) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_metadata(mut self, entry: MetadataEntry) -> Self {
        self.metadata = self.metadata.with(entry);
        self
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub(crate) fn try_settle(&self, operation: &str) -> bool {
        settle(&self.settled, operation, self)
    }
}

impl<K, V> Message<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// A message without broker coordinates whose acknowledgment does nothing.
    pub fn of(value: V) -> Self {
        Self::new(None, value, Metadata::new(), Arc::new(NoopAcknowledger))
    }

    pub async fn ack(&self) -> Result<(), ConnectorError> {
        if !self.try_settle("ack") {
            return Ok(());
        }
        self.acker.ack(self).await
    }

    /// Negatively acknowledges the message. The returned future completes
    /// once the channel failure strategy has handled it.
    pub async fn nack(&self, cause: anyhow::Error) -> Result<(), ConnectorError> {
        if !self.try_settle("nack") {
            return Ok(());
        }
        self.acker.nack(self, &cause).await
    }
}

/// What a mediator dispatches: a single message or a batch of records.
#[async_trait]
pub trait Envelope: Clone + Send + Sync + 'static {
    type Payload: Send + 'static;

    fn payload(&self) -> Self::Payload;

    async fn ack(&self) -> Result<(), ConnectorError>;

    async fn nack(&self, cause: anyhow::Error) -> Result<(), ConnectorError>;
}

#[async_trait]
impl<K, V> Envelope for Message<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Payload = V;

    fn payload(&self) -> V {
        self.value.clone()
    }

    async fn ack(&self) -> Result<(), ConnectorError> {
        Message::ack(self).await
    }

    async fn nack(&self, cause: anyhow::Error) -> Result<(), ConnectorError> {
        Message::nack(self, cause).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records every call made by the messages it acknowledges.
    #[derive(Default)]
    pub(crate) struct RecordingAcknowledger {
        pub(crate) calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Acknowledger<String, i32> for RecordingAcknowledger {
        async fn ack(&self, message: &Message<String, i32>) -> Result<(), ConnectorError> {
            self.calls.lock().unwrap().push(format!("ack {}", message.value()));
            Ok(())
        }

        async fn nack(
            &self,
            message: &Message<String, i32>,
            cause: &anyhow::Error,
        ) -> Result<(), ConnectorError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("nack {} {cause}", message.value()));
            Ok(())
        }

        async fn ack_batch(&self, records: &[Message<String, i32>]) -> Result<(), ConnectorError> {
            let values: Vec<_> = records.iter().map(|r| r.value().to_string()).collect();
            self.calls
                .lock()
                .unwrap()
                .push(format!("ack batch {}", values.join(",")));
            Ok(())
        }

        async fn nack_batch(
            &self,
            records: &[Message<String, i32>],
            cause: &anyhow::Error,
        ) -> Result<(), ConnectorError> {
            let values: Vec<_> = records.iter().map(|r| r.value().to_string()).collect();
            self.calls
                .lock()
                .unwrap()
                .push(format!("nack batch {} {cause}", values.join(",")));
            Ok(())
        }
    }

    fn incoming(offset: i64) -> MetadataEntry {
        MetadataEntry::Incoming(IncomingKafkaRecordMetadata {
            topic: "numbers".to_string(),
            partition: 0,
            offset,
            timestamp: None,
            headers: RecordHeaders::new(),
        })
    }

    #[tokio::test]
    async fn second_acknowledgment_is_ignored() {
        let acker = Arc::new(RecordingAcknowledger::default());
        let message = Message::new(None, 7, Metadata::new().with(incoming(3)), acker.clone());
        let copy = message.clone();

        message.ack().await.unwrap();
        copy.ack().await.unwrap();
        message.nack(anyhow::anyhow!("late")).await.unwrap();

        assert_eq!(*acker.calls.lock().unwrap(), vec!["ack 7".to_string()]);
        assert!(copy.is_settled());
    }

    #[tokio::test]
    async fn nack_passes_the_cause() {
        let acker = Arc::new(RecordingAcknowledger::default());
        let message = Message::new(None, 1, Metadata::new(), acker.clone());

        message.nack(anyhow::anyhow!("boom")).await.unwrap();

        assert_eq!(*acker.calls.lock().unwrap(), vec!["nack 1 boom".to_string()]);
    }

    #[test]
    fn metadata_replaces_entries_of_the_same_kind() {
        let metadata = Metadata::new()
            .with(incoming(1))
            .with(MetadataEntry::Outgoing(OutgoingKafkaRecordMetadata::default()))
            .with(incoming(2));

        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata.incoming().map(|m| m.offset), Some(2));
        assert!(metadata.tracing().is_none());
    }

    #[test]
    fn display_uses_record_coordinates() {
        let message: Message<String, i32> =
            Message::of(5).with_metadata(incoming(42));
        assert_eq!(message.to_string(), "message numbers-0@42");
    }
}
