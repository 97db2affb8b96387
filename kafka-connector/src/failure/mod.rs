//! Failure strategies applied to nacked records and batches.
//!
//! A handler returning `Ok` has dealt with the failure locally: the nacked
//! offsets are then acknowledged for commit purposes. An `Err` is the nack
//! outcome, seen by whoever awaited the nack.

use async_trait::async_trait;

use crate::message::Message;

mod dead_letter;
mod fail;
mod ignore;

pub use dead_letter::{
    KafkaDeadLetterQueue, DEAD_LETTER_CAUSE, DEAD_LETTER_OFFSET, DEAD_LETTER_PARTITION,
    DEAD_LETTER_REASON, DEAD_LETTER_TOPIC,
};
pub use fail::KafkaFailStop;
pub use ignore::KafkaIgnoreFailure;

use crate::error::ConnectorError;

#[async_trait]
pub trait FailureHandler<K, V>: Send + Sync {
    async fn handle(
        &self,
        message: &Message<K, V>,
        cause: &anyhow::Error,
    ) -> Result<(), ConnectorError>;

    /// Applies the strategy to every record of a batch at once.
    async fn handle_batch(
        &self,
        records: &[Message<K, V>],
        cause: &anyhow::Error,
    ) -> Result<(), ConnectorError>;
}

/// `topic-partition@offset` of a message, for logs.
pub(crate) fn coordinates<K, V>(message: &Message<K, V>) -> String {
    match message.metadata().incoming() {
        Some(m) => format!("{}-{}@{}", m.topic, m.partition, m.offset),
        None => "unknown record".to_string(),
    }
}
