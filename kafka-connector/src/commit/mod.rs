use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::BrokerConsumer;
use crate::config::CommitStrategy;
use crate::error::BrokerError;
use crate::metrics_consts::{LAST_COMMITTED_OFFSET, OFFSET_COMMITS};
use crate::types::Partition;

pub mod coordinator;

pub use coordinator::OffsetCommitCoordinator;

/// Turns acknowledgments into broker commits according to the channel's
/// commit strategy.
pub struct CommitHandler {
    channel: String,
    strategy: CommitStrategy,
    coordinator: OffsetCommitCoordinator,
    consumer: Arc<dyn BrokerConsumer>,
    health: Option<HealthHandle>,
    // Serializes commit calls so offsets reach the broker in order
    commit_lock: tokio::sync::Mutex<()>,
}

impl CommitHandler {
    pub fn new(
        channel: impl Into<String>,
        strategy: CommitStrategy,
        consumer: Arc<dyn BrokerConsumer>,
        health: Option<HealthHandle>,
    ) -> Self {
        Self {
            channel: channel.into(),
            strategy,
            coordinator: OffsetCommitCoordinator::new(),
            consumer,
            health,
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn strategy(&self) -> CommitStrategy {
        self.strategy
    }

    pub fn coordinator(&self) -> &OffsetCommitCoordinator {
        &self.coordinator
    }

    pub fn received(&self, partition: &Partition, offset: i64) {
        if self.strategy != CommitStrategy::Ignore {
            self.coordinator.received(partition, offset);
        }
    }

    /// Records an acknowledged offset. With the `latest` strategy, commits
    /// right away when the partition watermark advanced.
    pub async fn acknowledged(&self, partition: &Partition, offset: i64) {
        if self.strategy == CommitStrategy::Ignore {
            return;
        }
        let advanced = self.coordinator.acknowledge(partition, offset);
        if self.strategy == CommitStrategy::Latest && advanced.is_some() {
            // Failures are reported inside and retried on the next advance
            if self.commit_now().await.is_err() {
                debug!(channel = %self.channel, "deferring failed commit");
            }
        }
    }

    /// Commits every partition whose watermark moved since the last commit.
    /// A failed commit leaves the coordinator untouched so the offsets are
    /// retried next time.
    pub async fn commit_now(&self) -> Result<(), BrokerError> {
        if self.strategy == CommitStrategy::Ignore {
            return Ok(());
        }
        let _guard = self.commit_lock.lock().await;

        let offsets = self.coordinator.committable_offsets();
        if offsets.is_empty() {
            return Ok(());
        }

        match self.consumer.commit(&offsets).await {
            Ok(()) => {
                debug!(
                    channel = %self.channel,
                    "committed offsets for {} partitions",
                    offsets.len()
                );
                counter!(OFFSET_COMMITS, "channel" => self.channel.clone(), "status" => "ok")
                    .increment(1);
                record_committed(&offsets);
                self.coordinator.mark_committed(&offsets);
                Ok(())
            }
            Err(e) => {
                warn!(channel = %self.channel, "failed to commit offsets: {e:#}");
                counter!(OFFSET_COMMITS, "channel" => self.channel.clone(), "status" => "error")
                    .increment(1);
                if let Some(health) = &self.health {
                    health
                        .report_unhealthy(format!("offset commit failed: {e}"))
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Spawns the periodic commit task of the `throttled` strategy. The task
    /// stops when `cancel` fires.
    pub fn start(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if self.strategy != CommitStrategy::Throttled {
            return None;
        }
        let handler = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(channel = %handler.channel, "stopping periodic offset commits");
                        break;
                    }
                    _ = ticker.tick() => {
                        if handler.commit_now().await.is_err() {
                            debug!(channel = %handler.channel, "will retry commit on next tick");
                        }
                    }
                }
            }
        }))
    }
}

fn record_committed(offsets: &HashMap<Partition, i64>) {
    for (partition, offset) in offsets {
        metrics::gauge!(
            LAST_COMMITTED_OFFSET,
            "topic" => partition.topic().to_string(),
            "partition" => partition.partition_number().to_string()
        )
        .set(*offset as f64);
    }
}
