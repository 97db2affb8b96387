use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ConnectorError;
use crate::message::{settle, Acknowledger, Envelope, Message};
use crate::types::Partition;

/// Records delivered by one poll, acknowledged as a whole.
///
/// Acking or nacking the batch settles every contained record; records that
/// were already settled on their own are left out of the batch operation.
pub struct RecordBatch<K, V> {
    records: Vec<Message<K, V>>,
    acker: Arc<dyn Acknowledger<K, V>>,
    settled: Arc<AtomicBool>,
}

impl<K: Clone, V: Clone> Clone for RecordBatch<K, V> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            acker: self.acker.clone(),
            settled: self.settled.clone(),
        }
    }
}

impl<K, V> fmt::Display for RecordBatch<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch of {} records", self.records.len())
    }
}

impl<K, V> RecordBatch<K, V> {
    pub fn new(records: Vec<Message<K, V>>, acker: Arc<dyn Acknowledger<K, V>>) -> Self {
        Self {
            records,
            acker,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn records(&self) -> &[Message<K, V>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The last record of each partition, in partition order.
    pub fn latest_offset_records(&self) -> BTreeMap<Partition, &Message<K, V>> {
        let mut latest = BTreeMap::new();
        for record in &self.records {
            if let Some(incoming) = record.metadata().incoming() {
                latest.insert(incoming.partition(), record);
            }
        }
        latest
    }

    fn unsettled(&self, operation: &str) -> Option<Vec<Message<K, V>>>
    where
        K: Clone,
        V: Clone,
    {
        if !settle(&self.settled, operation, self) {
            return None;
        }
        Some(
            self.records
                .iter()
                .filter(|r| r.try_settle(operation))
                .cloned()
                .collect(),
        )
    }
}

impl<K, V> RecordBatch<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn payloads(&self) -> Vec<V> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    pub async fn ack(&self) -> Result<(), ConnectorError> {
        match self.unsettled("ack") {
            Some(records) => self.acker.ack_batch(&records).await,
            None => Ok(()),
        }
    }

    pub async fn nack(&self, cause: anyhow::Error) -> Result<(), ConnectorError> {
        match self.unsettled("nack") {
            Some(records) => self.acker.nack_batch(&records, &cause).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<K, V> Envelope for RecordBatch<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Payload = Vec<V>;

    fn payload(&self) -> Vec<V> {
        self.payloads()
    }

    async fn ack(&self) -> Result<(), ConnectorError> {
        RecordBatch::ack(self).await
    }

    async fn nack(&self, cause: anyhow::Error) -> Result<(), ConnectorError> {
        RecordBatch::nack(self, cause).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::tests::RecordingAcknowledger;
    use crate::message::{IncomingKafkaRecordMetadata, Metadata, MetadataEntry};
    use crate::types::RecordHeaders;

    fn batch(acker: Arc<RecordingAcknowledger>, values: &[(i32, i64)]) -> RecordBatch<String, i32> {
        let records = values
            .iter()
            .map(|(value, offset)| {
                let metadata = Metadata::new().with(MetadataEntry::Incoming(
                    IncomingKafkaRecordMetadata {
                        topic: "numbers".to_string(),
                        partition: (*offset % 2) as i32,
                        offset: *offset,
                        timestamp: None,
                        headers: RecordHeaders::new(),
                    },
                ));
                Message::new(None, *value, metadata, acker.clone())
            })
            .collect();
        RecordBatch::new(records, acker)
    }

    #[tokio::test]
    async fn batch_ack_is_all_or_nothing() {
        let acker = Arc::new(RecordingAcknowledger::default());
        let batch = batch(acker.clone(), &[(0, 0), (1, 1), (2, 2)]);

        batch.ack().await.unwrap();
        batch.nack(anyhow::anyhow!("too late")).await.unwrap();

        assert_eq!(*acker.calls.lock().unwrap(), vec!["ack batch 0,1,2".to_string()]);
        assert!(batch.records().iter().all(Message::is_settled));
    }

    #[tokio::test]
    async fn records_settled_alone_are_skipped() {
        let acker = Arc::new(RecordingAcknowledger::default());
        let batch = batch(acker.clone(), &[(3, 3), (4, 4), (5, 5)]);

        batch.records()[1].ack().await.unwrap();
        batch.nack(anyhow::anyhow!("nack all")).await.unwrap();

        assert_eq!(
            *acker.calls.lock().unwrap(),
            vec!["ack 4".to_string(), "nack batch 3,5 nack all".to_string()]
        );
    }

    #[test]
    fn latest_offset_per_partition() {
        let acker = Arc::new(RecordingAcknowledger::default());
        let batch = batch(acker, &[(0, 10), (1, 11), (2, 12), (3, 13)]);

        let latest: Vec<_> = batch
            .latest_offset_records()
            .into_iter()
            .map(|(p, m)| (p.partition_number(), *m.value()))
            .collect();
        assert_eq!(latest, vec![(0, 2), (1, 3)]);
    }
}
