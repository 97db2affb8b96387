use async_trait::async_trait;
use health::HealthHandle;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::{coordinates, FailureHandler};
use crate::error::ConnectorError;
use crate::message::Message;
use crate::metrics_consts::CHANNEL_FAILURES;

/// Stops the channel on the first nack. Nothing is acknowledged, so the
/// failed records are redelivered once the channel restarts.
pub struct KafkaFailStop {
    channel: String,
    cancel: CancellationToken,
    health: Option<HealthHandle>,
}

impl KafkaFailStop {
    pub fn new(
        channel: impl Into<String>,
        cancel: CancellationToken,
        health: Option<HealthHandle>,
    ) -> Self {
        Self {
            channel: channel.into(),
            cancel,
            health,
        }
    }

    async fn stop(&self, reason: String) -> ConnectorError {
        counter!(CHANNEL_FAILURES, "channel" => self.channel.clone()).increment(1);
        if let Some(health) = &self.health {
            health.report_unhealthy(&reason).await;
        }
        self.cancel.cancel();
        ConnectorError::ChannelFailed {
            channel: self.channel.clone(),
            reason,
        }
    }
}

#[async_trait]
impl<K, V> FailureHandler<K, V> for KafkaFailStop
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
        error!(
            channel = %self.channel,
            record = %record,
            "a message sent to channel {} has been nacked, fail-stop: {cause:#}", self.channel
        );
        Err(self.stop(format!("{record}: {cause:#}")).await)
    }

    async fn handle_batch(
        &self,
        records: &[Message<K, V>],
        cause: &anyhow::Error,
    ) -> Result<(), ConnectorError> {
        error!(
            channel = %self.channel,
            records = records.len(),
            "a batch sent to channel {} has been nacked, fail-stop: {cause:#}",
            self.channel
        );
        Err(self
            .stop(format!("batch of {} records: {cause:#}", records.len()))
            .await)
    }
}
