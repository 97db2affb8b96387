//! Incoming channel: polls the broker and turns records into messages whose
//! acknowledgments drive offset commits and the failure strategy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use health::{HealthHandle, HealthRegistry};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batch::RecordBatch;
use crate::broker::{BrokerClient, BrokerConsumer, BrokerProducer, ConsumedRecord};
use crate::codec::{Codec, CodecRegistry, DefaultCodecs};
use crate::commit::CommitHandler;
use crate::config::{ChannelConfig, FailureDecision, IncomingConfig};
use crate::error::{CodecError, ConnectorError, WiringError};
use crate::failure::{FailureHandler, KafkaDeadLetterQueue, KafkaFailStop, KafkaIgnoreFailure};
use crate::message::{Acknowledger, IncomingKafkaRecordMetadata, Message, Metadata, MetadataEntry};
use crate::metrics_consts::{
    CHANNEL_FAILURES, DESERIALIZATION_FAILURES, MESSAGES_COMPLETED, MESSAGES_RECEIVED,
};
use crate::propagation::TracePropagator;

pub type ConsumerHook = Box<dyn Fn(&dyn BrokerConsumer) + Send + Sync>;
pub type ProducerHook = Box<dyn Fn(&dyn BrokerProducer) + Send + Sync>;

const DEFAULT_HEALTH_DEADLINE: Duration = Duration::from_secs(30);
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Completes acknowledgments for the messages of one incoming channel.
struct ChannelAcknowledger<K, V> {
    channel: String,
    commit: Arc<CommitHandler>,
    failure: Arc<dyn FailureHandler<K, V>>,
}

impl<K, V> ChannelAcknowledger<K, V> {
    async fn acknowledge_offset(&self, message: &Message<K, V>) {
        if let Some(incoming) = message.metadata().incoming() {
            self.commit
                .acknowledged(&incoming.partition(), incoming.offset)
                .await;
        }
    }

    fn completed(&self, status: &'static str, count: usize) {
        counter!(MESSAGES_COMPLETED, "channel" => self.channel.clone(), "status" => status)
            .increment(count as u64);
    }
}

#[async_trait]
impl<K, V> Acknowledger<K, V> for ChannelAcknowledger<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn ack(&self, message: &Message<K, V>) -> Result<(), ConnectorError> {
        self.completed("acked", 1);
        self.acknowledge_offset(message).await;
        Ok(())
    }

    async fn nack(
        &self,
        message: &Message<K, V>,
        cause: &anyhow::Error,
    ) -> Result<(), ConnectorError> {
        self.completed("nacked", 1);
        self.failure.handle(message, cause).await?;
        // Handled locally: the record counts as done for commits
        self.acknowledge_offset(message).await;
        Ok(())
    }

    async fn ack_batch(&self, records: &[Message<K, V>]) -> Result<(), ConnectorError> {
        self.completed("acked", records.len());
        for record in records {
            self.acknowledge_offset(record).await;
        }
        Ok(())
    }

    async fn nack_batch(
        &self,
        records: &[Message<K, V>],
        cause: &anyhow::Error,
    ) -> Result<(), ConnectorError> {
        self.completed("nacked", records.len());
        self.failure.handle_batch(records, cause).await?;
        for record in records {
            self.acknowledge_offset(record).await;
        }
        Ok(())
    }
}

struct SourceInner<K, V> {
    incoming: IncomingConfig,
    group_id: Option<String>,
    consumer: Arc<dyn BrokerConsumer>,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    acker: Arc<dyn Acknowledger<K, V>>,
    commit: Arc<CommitHandler>,
    tracing: Option<TracePropagator>,
    health: Option<HealthHandle>,
    cancel: CancellationToken,
}

struct Polled<K, V> {
    messages: Vec<Message<K, V>>,
    failure: Option<ConnectorError>,
}

impl<K, V> SourceInner<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn channel(&self) -> &str {
        &self.incoming.channel
    }

    /// Polls once. Returns `None` once the channel is cancelled.
    async fn poll_once(&self) -> Option<Polled<K, V>> {
        let poll = self
            .consumer
            .poll(self.incoming.max_poll_records, self.incoming.poll_timeout);
        let polled = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            polled = poll => polled,
        };

        let records = match polled {
            Ok(records) => records,
            Err(e) => {
                warn!(channel = self.channel(), "failed to poll records: {e:#}");
                if let Some(health) = &self.health {
                    health.report_unhealthy(format!("poll failed: {e:#}")).await;
                }
                // Let the broker client recover before polling again
                tokio::select! {
                    _ = self.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(self.incoming.poll_timeout) => {}
                }
                return Some(Polled {
                    messages: Vec::new(),
                    failure: None,
                });
            }
        };

        if let Some(health) = &self.health {
            health.report_healthy().await;
        }
        if records.is_empty() {
            return Some(Polled {
                messages: Vec::new(),
                failure: None,
            });
        }
        counter!(MESSAGES_RECEIVED, "channel" => self.channel().to_string())
            .increment(records.len() as u64);

        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            let partition = record.partition();
            self.commit.received(&partition, record.offset);

            match self.decode(&record) {
                Ok((key, value)) => messages.push(self.message(record, key, value)),
                Err(e) => {
                    counter!(DESERIALIZATION_FAILURES, "channel" => self.channel().to_string())
                        .increment(1);
                    if self.incoming.fail_on_deserialization_failure {
                        error!(
                            channel = self.channel(),
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            "deserialization failure, stopping the channel: {e:#}"
                        );
                        return Some(Polled {
                            messages,
                            failure: Some(ConnectorError::Codec(e)),
                        });
                    }
                    warn!(
                        channel = self.channel(),
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "skipping record that cannot be deserialized: {e:#}"
                    );
                    self.commit.acknowledged(&partition, record.offset).await;
                }
            }
        }
        Some(Polled {
            messages,
            failure: None,
        })
    }

    fn decode(&self, record: &ConsumedRecord) -> Result<(Option<K>, V), CodecError> {
        let key = record
            .key
            .as_deref()
            .map(|k| self.key_codec.deserialize(&record.topic, k))
            .transpose()?;
        let payload = record
            .payload
            .as_deref()
            .ok_or_else(|| CodecError::Deserialize {
                topic: record.topic.clone(),
                reason: format!("record at offset {} has no value", record.offset),
            })?;
        let value = self.value_codec.deserialize(&record.topic, payload)?;
        Ok((key, value))
    }

    fn message(&self, record: ConsumedRecord, key: Option<K>, value: V) -> Message<K, V> {
        let trace = self
            .tracing
            .as_ref()
            .map(|t| t.on_consume(&record, self.group_id.as_deref()));

        let mut metadata = Metadata::new().with(MetadataEntry::Incoming(
            IncomingKafkaRecordMetadata {
                topic: record.topic,
                partition: record.partition,
                offset: record.offset,
                timestamp: record.timestamp,
                headers: record.headers,
            },
        ));
        if let Some(link) = trace {
            metadata = metadata.with(MetadataEntry::Tracing(link));
        }
        Message::new(key, value, metadata, self.acker.clone())
    }

    /// Stops the channel after a failure observed by the source itself.
    async fn stop(&self, failure: &ConnectorError) {
        counter!(CHANNEL_FAILURES, "channel" => self.channel().to_string()).increment(1);
        if let Some(health) = &self.health {
            health.report_unhealthy(failure).await;
        }
        self.cancel.cancel();
    }
}

struct PollState<K, V, T> {
    inner: Arc<SourceInner<K, V>>,
    queue: VecDeque<T>,
    terminal: Option<ConnectorError>,
}

fn single<K, V>(_: &SourceInner<K, V>, messages: Vec<Message<K, V>>) -> Vec<Message<K, V>> {
    messages
}

fn batched<K, V>(
    inner: &SourceInner<K, V>,
    messages: Vec<Message<K, V>>,
) -> Vec<RecordBatch<K, V>> {
    if messages.is_empty() {
        return Vec::new();
    }
    vec![RecordBatch::new(messages, inner.acker.clone())]
}

/// Lazily polls the broker; dropping the stream stops polling.
///
/// Items already polled are not delivered once the channel is cancelled, so
/// a fail-stop nack is the last thing the application sees.
fn poll_stream<K, V, T>(
    inner: Arc<SourceInner<K, V>>,
    group: fn(&SourceInner<K, V>, Vec<Message<K, V>>) -> Vec<T>,
) -> BoxStream<'static, Result<T, ConnectorError>>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    T: Send + 'static,
{
    let state = PollState {
        inner,
        queue: VecDeque::new(),
        terminal: None,
    };
    stream::unfold(state, move |mut state| async move {
        loop {
            if state.inner.cancel.is_cancelled() {
                return None;
            }
            if let Some(item) = state.queue.pop_front() {
                return Some((Ok(item), state));
            }
            if let Some(failure) = state.terminal.take() {
                state.inner.stop(&failure).await;
                return Some((Err(failure), state));
            }

            let polled = state.inner.poll_once().await?;
            let items = group(&state.inner, polled.messages);
            state.queue.extend(items);
            state.terminal = polled.failure;
        }
    })
    .boxed()
}

/// An incoming channel bound to one consumer.
pub struct KafkaSource<K, V> {
    inner: Arc<SourceInner<K, V>>,
    subscribed: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    dead_letter: Option<Arc<dyn BrokerProducer>>,
}

impl<K, V> KafkaSource<K, V>
where
    K: DefaultCodecs + Clone + Send + Sync,
    V: DefaultCodecs + Clone + Send + Sync,
{
    pub fn builder(
        config: ChannelConfig,
        client: Arc<dyn BrokerClient>,
    ) -> KafkaSourceBuilder<K, V> {
        KafkaSourceBuilder {
            config,
            client,
            key_codecs: K::codecs(),
            value_codecs: V::codecs(),
            health: None,
            health_deadline: DEFAULT_HEALTH_DEADLINE,
            tracing: None,
            cancel: CancellationToken::new(),
            consumer_hooks: Vec::new(),
            producer_hooks: Vec::new(),
        }
    }
}

impl<K, V> KafkaSource<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn channel(&self) -> &str {
        self.inner.channel()
    }

    pub fn config(&self) -> &IncomingConfig {
        &self.inner.incoming
    }

    pub fn commit_handler(&self) -> &CommitHandler {
        &self.inner.commit
    }

    /// Cancelling this token stops polling and the periodic commits.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    fn subscribe(&self, batch: bool) -> Result<(), WiringError> {
        if self.inner.incoming.batch != batch {
            return Err(WiringError::InvalidShape {
                method: self.channel().to_string(),
                reason: format!(
                    "channel is configured with batch={}",
                    self.inner.incoming.batch
                ),
            });
        }
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return Err(WiringError::AlreadyRunning(self.channel().to_string()));
        }
        Ok(())
    }

    /// The message stream of a channel consuming records one by one.
    pub fn stream(
        &self,
    ) -> Result<BoxStream<'static, Result<Message<K, V>, ConnectorError>>, WiringError> {
        self.subscribe(false)?;
        Ok(poll_stream(self.inner.clone(), single))
    }

    /// The batch stream of a channel configured with `batch=true`.
    pub fn batch_stream(
        &self,
    ) -> Result<BoxStream<'static, Result<RecordBatch<K, V>, ConnectorError>>, WiringError> {
        self.subscribe(true)?;
        Ok(poll_stream(self.inner.clone(), batched))
    }

    /// Stops polling, commits what was acknowledged so far and flushes the
    /// dead-letter producer.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            if let Err(e) = ticker.await {
                warn!(channel = self.channel(), "commit task failed: {e:#}");
            }
        }
        if let Err(e) = self.inner.commit.commit_now().await {
            warn!(channel = self.channel(), "final offset commit failed: {e:#}");
        }
        if let Some(producer) = &self.dead_letter {
            if let Err(e) = producer.flush(SHUTDOWN_FLUSH_TIMEOUT).await {
                warn!(channel = self.channel(), "dead-letter producer flush failed: {e:#}");
            }
        }
        info!(channel = self.channel(), "incoming channel stopped");
    }
}

pub struct KafkaSourceBuilder<K, V> {
    config: ChannelConfig,
    client: Arc<dyn BrokerClient>,
    key_codecs: CodecRegistry<K>,
    value_codecs: CodecRegistry<V>,
    health: Option<HealthRegistry>,
    health_deadline: Duration,
    tracing: Option<TracePropagator>,
    cancel: CancellationToken,
    consumer_hooks: Vec<ConsumerHook>,
    producer_hooks: Vec<ProducerHook>,
}

impl<K, V> KafkaSourceBuilder<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn key_codecs(mut self, codecs: CodecRegistry<K>) -> Self {
        self.key_codecs = codecs;
        self
    }

    pub fn value_codecs(mut self, codecs: CodecRegistry<V>) -> Self {
        self.value_codecs = codecs;
        self
    }

    pub fn health(mut self, registry: HealthRegistry, deadline: Duration) -> Self {
        self.health = Some(registry);
        self.health_deadline = deadline;
        self
    }

    pub fn tracing(mut self, propagator: TracePropagator) -> Self {
        self.tracing = Some(propagator);
        self
    }

    /// Use a token owned by the caller, e.g. shared with a mediator.
    pub fn cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Called once the consumer of the channel is created.
    pub fn on_consumer_created(
        mut self,
        hook: impl Fn(&dyn BrokerConsumer) + Send + Sync + 'static,
    ) -> Self {
        self.consumer_hooks.push(Box::new(hook));
        self
    }

    /// Called once the dead-letter producer of the channel is created.
    pub fn on_producer_created(
        mut self,
        hook: impl Fn(&dyn BrokerProducer) + Send + Sync + 'static,
    ) -> Self {
        self.producer_hooks.push(Box::new(hook));
        self
    }

    pub async fn build(self) -> Result<KafkaSource<K, V>, WiringError> {
        let channel = self.config.channel().to_string();
        let incoming = IncomingConfig::from_channel(&self.config, |name| {
            self.value_codecs
                .serializer_for(name)
                .or_else(|| self.key_codecs.serializer_for(name))
                .map(str::to_string)
        })?;
        let key_codec = self.key_codecs.resolve(&incoming.key_deserializer)?;
        let value_codec = self.value_codecs.resolve(&incoming.value_deserializer)?;
        let client_error = |source| WiringError::Client {
            channel: channel.clone(),
            source,
        };

        let consumer = self
            .client
            .create_consumer(&self.config, &incoming.topics)
            .map_err(client_error)?;
        for hook in &self.consumer_hooks {
            hook(consumer.as_ref());
        }

        let health = match (&self.health, incoming.health_enabled) {
            (Some(registry), true) => Some(
                registry
                    .register(format!("kafka-incoming-{channel}"), self.health_deadline)
                    .await,
            ),
            _ => None,
        };

        let mut dead_letter = None;
        let failure: Arc<dyn FailureHandler<K, V>> = match &incoming.failure {
            FailureDecision::Fail => Arc::new(KafkaFailStop::new(
                channel.clone(),
                self.cancel.clone(),
                health.clone(),
            )),
            FailureDecision::Ignore => Arc::new(KafkaIgnoreFailure::new(channel.clone())),
            FailureDecision::DeadLetter {
                topic,
                key_serializer,
                value_serializer,
            } => {
                let key_serializer = self.key_codecs.resolve(key_serializer)?;
                let value_serializer = self.value_codecs.resolve(value_serializer)?;
                let producer = self
                    .client
                    .create_producer(&self.config)
                    .map_err(client_error)?;
                for hook in &self.producer_hooks {
                    hook(producer.as_ref());
                }
                dead_letter = Some(producer.clone());
                Arc::new(KafkaDeadLetterQueue::new(
                    channel.clone(),
                    topic.clone(),
                    key_serializer,
                    value_serializer,
                    producer,
                ))
            }
        };

        let commit = Arc::new(CommitHandler::new(
            channel.clone(),
            incoming.commit_strategy,
            consumer.clone(),
            health.clone(),
        ));
        let ticker = commit.start(incoming.commit_interval, self.cancel.clone());

        let acker: Arc<dyn Acknowledger<K, V>> = Arc::new(ChannelAcknowledger {
            channel: channel.clone(),
            commit: commit.clone(),
            failure,
        });
        let tracing = incoming
            .tracing_enabled
            .then(|| self.tracing.unwrap_or_default());

        info!(
            channel = %channel,
            topics = ?incoming.topics,
            failure_strategy = ?incoming.failure,
            commit_strategy = ?incoming.commit_strategy,
            "incoming channel ready"
        );

        Ok(KafkaSource {
            inner: Arc::new(SourceInner {
                group_id: self.config.get("group.id").map(str::to_string),
                incoming,
                consumer,
                key_codec,
                value_codec,
                acker,
                commit,
                tracing,
                health,
                cancel: self.cancel,
            }),
            subscribed: AtomicBool::new(false),
            ticker: Mutex::new(ticker),
            dead_letter,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    use futures::TryStreamExt;

    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::types::Partition;

    fn config(extra: &[(&str, &str)]) -> ChannelConfig {
        let mut values = BTreeMap::from([
            ("topic".to_string(), "numbers".to_string()),
            ("group.id".to_string(), "g".to_string()),
            ("value.deserializer".to_string(), "integer".to_string()),
            ("poll-timeout".to_string(), "20".to_string()),
            ("commit-strategy".to_string(), "latest".to_string()),
        ]);
        for (k, v) in extra {
            values.insert(k.to_string(), v.to_string());
        }
        ChannelConfig::new("numbers-in", values)
    }

    fn publish(broker: &InMemoryBroker, values: std::ops::Range<i32>) {
        for i in values {
            broker.produce("numbers", None, &i.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn delivers_decoded_messages_and_commits_acks() {
        let broker = InMemoryBroker::new();
        publish(&broker, 0..3);
        let source = KafkaSource::<String, i32>::builder(config(&[]), Arc::new(broker.clone()))
            .build()
            .await
            .unwrap();

        let messages: Vec<_> = source.stream().unwrap().take(3).try_collect().await.unwrap();
        let values: Vec<i32> = messages.iter().map(|m| *m.value()).collect();
        assert_eq!(values, vec![0, 1, 2]);

        for message in &messages {
            message.ack().await.unwrap();
        }
        assert_eq!(broker.committed("g", &Partition::new("numbers", 0)), Some(3));
    }

    #[tokio::test]
    async fn stream_can_only_be_taken_once() {
        let broker = InMemoryBroker::new();
        let source = KafkaSource::<String, i32>::builder(config(&[]), Arc::new(broker))
            .build()
            .await
            .unwrap();

        assert!(source.stream().is_ok());
        assert!(matches!(source.stream(), Err(WiringError::AlreadyRunning(_))));
        assert!(matches!(source.batch_stream(), Err(WiringError::InvalidShape { .. })));
    }

    #[tokio::test]
    async fn undecodable_record_stops_the_channel() {
        let broker = InMemoryBroker::new();
        publish(&broker, 0..1);
        broker.produce("numbers", None, b"xy");
        publish(&broker, 2..3);
        let source = KafkaSource::<String, i32>::builder(config(&[]), Arc::new(broker))
            .build()
            .await
            .unwrap();

        let items: Vec<_> = source.stream().unwrap().collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().map(|m| *m.value()).ok(), Some(0));
        assert!(matches!(items[1], Err(ConnectorError::Codec(_))));
        assert!(source.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn undecodable_record_can_be_skipped() {
        let broker = InMemoryBroker::new();
        broker.produce("numbers", None, b"xy");
        publish(&broker, 1..2);
        let source = KafkaSource::<String, i32>::builder(
            config(&[("fail-on-deserialization-failure", "false")]),
            Arc::new(broker.clone()),
        )
        .build()
        .await
        .unwrap();

        let message = source.stream().unwrap().try_next().await.unwrap().unwrap();
        assert_eq!(*message.value(), 1);
        message.ack().await.unwrap();

        assert_eq!(broker.committed("g", &Partition::new("numbers", 0)), Some(2));
    }

    #[tokio::test]
    async fn lifecycle_hooks_run_once_per_client() {
        let broker = InMemoryBroker::new();
        let consumers = Arc::new(AtomicUsize::new(0));
        let producers = Arc::new(AtomicUsize::new(0));
        let (c, p) = (consumers.clone(), producers.clone());

        let _source = KafkaSource::<String, i32>::builder(
            config(&[("failure-strategy", "dead-letter-queue")]),
            Arc::new(broker.clone()),
        )
        .on_consumer_created(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .on_producer_created(move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .await
        .unwrap();

        assert_eq!(consumers.load(Ordering::SeqCst), 1);
        assert_eq!(producers.load(Ordering::SeqCst), 1);
        assert_eq!(broker.producers_created(), 1);
    }

    #[tokio::test]
    async fn unknown_deserializer_is_a_wiring_error() {
        let broker = InMemoryBroker::new();
        let result = KafkaSource::<String, i32>::builder(
            config(&[("value.deserializer", "com.acme.AvroDeserializer")]),
            Arc::new(broker.clone()),
        )
        .build()
        .await;

        assert!(matches!(result, Err(WiringError::UnknownCodec(_))));
        assert_eq!(broker.consumers_created(), 0);
    }

    #[tokio::test]
    async fn shutdown_flushes_acknowledged_offsets() {
        let broker = InMemoryBroker::new();
        publish(&broker, 0..2);
        let source = KafkaSource::<String, i32>::builder(
            config(&[
                ("commit-strategy", "throttled"),
                ("auto.commit.interval.ms", "60000"),
            ]),
            Arc::new(broker.clone()),
        )
        .build()
        .await
        .unwrap();

        let messages: Vec<_> = source.stream().unwrap().take(2).try_collect().await.unwrap();
        for message in &messages {
            message.ack().await.unwrap();
        }
        source.shutdown().await;

        assert_eq!(broker.committed("g", &Partition::new("numbers", 0)), Some(2));
        assert_eq!(broker.flushes(), 0);
    }

    #[tokio::test]
    async fn shutdown_flushes_the_dead_letter_producer() {
        let broker = InMemoryBroker::new();
        let source = KafkaSource::<String, i32>::builder(
            config(&[("failure-strategy", "dead-letter-queue")]),
            Arc::new(broker.clone()),
        )
        .build()
        .await
        .unwrap();

        source.shutdown().await;

        assert_eq!(broker.producers_created(), 1);
        assert_eq!(broker.flushes(), 1);
    }
}
