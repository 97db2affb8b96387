use async_trait::async_trait;
use metrics::counter;
use tracing::warn;

use super::{coordinates, FailureHandler};
use crate::error::ConnectorError;
use crate::message::Message;
use crate::metrics_consts::IGNORED_FAILURES;

/// Logs the failure and moves on. The nacked offsets count as acknowledged,
/// so a restart will not redeliver them.
pub struct KafkaIgnoreFailure {
    channel: String,
}

impl KafkaIgnoreFailure {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl<K, V> FailureHandler<K, V> for KafkaIgnoreFailure
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn handle(
        &self,
        message: &Message<K, V>,
        cause: &anyhow::Error,
    ) -> Result<(), ConnectorError> {
        warn!(
            channel = %self.channel,
            record = %coordinates(message),
            "a message sent to channel {} has been nacked, ignored failure: {cause:#}",
            self.channel
        );
        counter!(IGNORED_FAILURES, "channel" => self.channel.clone()).increment(1);
        Ok(())
    }

    async fn handle_batch(
        &self,
        records: &[Message<K, V>],
        cause: &anyhow::Error,
    ) -> Result<(), ConnectorError> {
        warn!(
            channel = %self.channel,
            records = records.len(),
            "a batch sent to channel {} has been nacked, ignored failure: {cause:#}",
            self.channel
        );
        counter!(IGNORED_FAILURES, "channel" => self.channel.clone())
            .increment(records.len() as u64);
        Ok(())
    }
}
