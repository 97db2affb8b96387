use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::WiringError;

/// Attribute selecting the named shared layer of a channel.
pub const KAFKA_CONFIGURATION_ATTRIBUTE: &str = "kafka-configuration";

/// Attributes consumed by the connector itself; every other attribute is
/// passed through to the broker client.
const CONNECTOR_ATTRIBUTES: &[&str] = &[
    KAFKA_CONFIGURATION_ATTRIBUTE,
    "topic",
    "topics",
    "batch",
    "max.poll.records",
    "poll-timeout",
    "key.deserializer",
    "value.deserializer",
    "key.serializer",
    "value.serializer",
    "failure-strategy",
    "dead-letter-queue.topic",
    "dead-letter-queue.key.serializer",
    "dead-letter-queue.value.serializer",
    "commit-strategy",
    "tracing-enabled",
    "fail-on-deserialization-failure",
    "health-enabled",
    "partition",
];

/// Process-wide defaults, read from the environment. They form the lowest
/// priority configuration layer of every channel.
#[derive(Envconfig, Clone, Debug)]
pub struct ConnectorConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "500")]
    pub kafka_max_poll_records: usize,

    #[envconfig(default = "1000")]
    pub kafka_poll_timeout_ms: u64,

    #[envconfig(default = "5000")]
    pub kafka_commit_interval_ms: u64,

    #[envconfig(default = "30")]
    pub health_deadline_secs: u64,

    #[envconfig(default = "20")]
    pub worker_pool_size: usize,
}

impl ConnectorConfig {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        ConnectorConfig::init_from_env()
    }

    pub fn health_deadline(&self) -> Duration {
        Duration::from_secs(self.health_deadline_secs)
    }

    /// The global defaults layer shared by every channel.
    pub fn defaults_layer(&self) -> ConfigLayer {
        let mut layer = ConfigLayer::new("global")
            .with("bootstrap.servers", &self.kafka_hosts)
            .with("auto.offset.reset", &self.kafka_consumer_offset_reset)
            .with("max.poll.records", self.kafka_max_poll_records.to_string())
            .with("poll-timeout", self.kafka_poll_timeout_ms.to_string())
            .with(
                "auto.commit.interval.ms",
                self.kafka_commit_interval_ms.to_string(),
            )
            .with("linger.ms", self.kafka_producer_linger_ms.to_string())
            .with(
                "message.timeout.ms",
                self.kafka_message_timeout_ms.to_string(),
            )
            .with("compression.codec", &self.kafka_compression_codec);
        if self.kafka_tls {
            layer = layer
                .with("security.protocol", "ssl")
                .with("enable.ssl.certificate.verification", "false");
        }
        layer
    }
}

/// One source of key/value configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigLayer {
    name: String,
    values: BTreeMap<String, String>,
}

impl ConfigLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Builds a layer from flat properties, keeping only the keys under
    /// `prefix` (e.g. `mp.messaging.incoming.orders.`) with the prefix stripped.
    pub fn from_prefixed<'a>(
        name: impl Into<String>,
        properties: impl IntoIterator<Item = (&'a str, &'a str)>,
        prefix: &str,
    ) -> Self {
        let values = properties
            .into_iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .filter(|attr| !attr.is_empty())
                    .map(|attr| (attr.to_string(), v.to_string()))
            })
            .collect();
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Merges layers ordered from highest to lowest priority: for every key the
/// first layer defining it wins.
pub fn merge_layers<'a>(
    layers: impl IntoIterator<Item = &'a ConfigLayer>,
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        for (key, value) in &layer.values {
            merged
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
    merged
}

/// The resolved, read-only configuration of one channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    channel: String,
    values: BTreeMap<String, String>,
}

impl ChannelConfig {
    pub fn new(channel: impl Into<String>, values: BTreeMap<String, String>) -> Self {
        Self {
            channel: channel.into(),
            values,
        }
    }

    /// Resolves a channel's configuration from its own layer, the named
    /// shared layers and the global defaults.
    ///
    /// The named layer is the one designated by the `kafka-configuration`
    /// attribute, which must exist, or else the one named after the channel,
    /// if any.
    pub fn resolve(
        channel: &str,
        channel_layer: &ConfigLayer,
        named: &HashMap<String, ConfigLayer>,
        global: &ConfigLayer,
    ) -> Result<Self, WiringError> {
        let shared = match channel_layer.get(KAFKA_CONFIGURATION_ATTRIBUTE) {
            Some(name) => Some(
                named
                    .get(name)
                    .ok_or_else(|| WiringError::UnknownNamedConfiguration(name.to_string()))?,
            ),
            None => named.get(channel),
        };

        let layers = std::iter::once(channel_layer)
            .chain(shared)
            .chain(std::iter::once(global));
        Ok(Self::new(channel, merge_layers(layers)))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn require(&self, key: &str) -> Result<&str, WiringError> {
        self.get(key).ok_or_else(|| WiringError::MissingProperty {
            channel: self.channel.clone(),
            key: key.to_string(),
        })
    }

    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, WiringError> {
        self.get(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|_| WiringError::InvalidProperty {
                    channel: self.channel.clone(),
                    key: key.to_string(),
                    value: raw.to_string(),
                })
            })
            .transpose()
    }

    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, WiringError> {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Properties for the broker client: everything the connector does not
    /// interpret itself.
    pub fn client_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .filter(|(k, _)| {
                !CONNECTOR_ATTRIBUTES.contains(&k.as_str()) && !k.starts_with("dead-letter-queue.")
            })
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Subscribed topics: `topics` (comma separated) or `topic`, defaulting
    /// to the channel name.
    pub fn topics(&self) -> Vec<String> {
        match self.get("topics") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            None => vec![self.get_or("topic", &self.channel).to_string()],
        }
    }

    fn invalid(&self, key: &str, value: &str) -> WiringError {
        WiringError::InvalidProperty {
            channel: self.channel.clone(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// How a nacked record is handled, derived once when the channel is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Fail,
    Ignore,
    DeadLetter {
        topic: String,
        key_serializer: String,
        value_serializer: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStrategy {
    /// Commit contiguous acknowledged offsets periodically
    Throttled,
    /// Commit whenever an acknowledgment advances a partition
    Latest,
    /// Never commit, the broker client auto-commits
    Ignore,
}

impl FromStr for CommitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "throttled" => Ok(CommitStrategy::Throttled),
            "latest" => Ok(CommitStrategy::Latest),
            "ignore" => Ok(CommitStrategy::Ignore),
            _ => Err(format!("unknown commit strategy: {s}")),
        }
    }
}

/// Typed view of an incoming channel configuration.
#[derive(Debug, Clone)]
pub struct IncomingConfig {
    pub channel: String,
    pub topics: Vec<String>,
    pub batch: bool,
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
    pub key_deserializer: String,
    pub value_deserializer: String,
    pub failure: FailureDecision,
    pub commit_strategy: CommitStrategy,
    pub commit_interval: Duration,
    pub tracing_enabled: bool,
    pub fail_on_deserialization_failure: bool,
    pub health_enabled: bool,
}

impl IncomingConfig {
    /// `serializer_for` maps a deserializer name to its paired serializer
    /// name, giving the dead-letter defaults.
    pub fn from_channel(
        config: &ChannelConfig,
        serializer_for: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, WiringError> {
        let topics = config.topics();
        let key_deserializer = config.get_or("key.deserializer", "string").to_string();
        let value_deserializer = config.require("value.deserializer")?.to_string();

        let failure = match config.get_or("failure-strategy", "fail") {
            "fail" => FailureDecision::Fail,
            "ignore" => FailureDecision::Ignore,
            "dead-letter-queue" => {
                let source_topic = topics.first().map(String::as_str).unwrap_or(config.channel());
                let topic = config
                    .get("dead-letter-queue.topic")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{source_topic}-dead-letter-topic"));
                let key_serializer = match config.get("dead-letter-queue.key.serializer") {
                    Some(name) => name.to_string(),
                    None => serializer_for(&key_deserializer)
                        .unwrap_or_else(|| key_deserializer.clone()),
                };
                let value_serializer = match config.get("dead-letter-queue.value.serializer") {
                    Some(name) => name.to_string(),
                    None => serializer_for(&value_deserializer)
                        .unwrap_or_else(|| value_deserializer.clone()),
                };
                FailureDecision::DeadLetter {
                    topic,
                    key_serializer,
                    value_serializer,
                }
            }
            other => return Err(config.invalid("failure-strategy", other)),
        };

        let commit_strategy = config
            .get("commit-strategy")
            .map(|raw| {
                raw.parse::<CommitStrategy>()
                    .map_err(|_| config.invalid("commit-strategy", raw))
            })
            .transpose()?
            .unwrap_or(CommitStrategy::Throttled);

        let max_poll_records = config.parse_or("max.poll.records", 500usize)?;
        if max_poll_records == 0 {
            return Err(config.invalid("max.poll.records", "0"));
        }

        Ok(Self {
            channel: config.channel().to_string(),
            topics,
            batch: config.parse_or("batch", false)?,
            max_poll_records,
            poll_timeout: Duration::from_millis(config.parse_or("poll-timeout", 1000u64)?),
            key_deserializer,
            value_deserializer,
            failure,
            commit_strategy,
            commit_interval: Duration::from_millis(
                config.parse_or("auto.commit.interval.ms", 5000u64)?,
            ),
            tracing_enabled: config.parse_or("tracing-enabled", true)?,
            fail_on_deserialization_failure: config
                .parse_or("fail-on-deserialization-failure", true)?,
            health_enabled: config.parse_or("health-enabled", true)?,
        })
    }
}

/// Typed view of an outgoing channel configuration.
#[derive(Debug, Clone)]
pub struct OutgoingConfig {
    pub channel: String,
    pub topic: String,
    pub partition: Option<i32>,
    pub key_serializer: String,
    pub value_serializer: String,
    pub tracing_enabled: bool,
}

impl OutgoingConfig {
    pub fn from_channel(config: &ChannelConfig) -> Result<Self, WiringError> {
        Ok(Self {
            channel: config.channel().to_string(),
            topic: config.get_or("topic", config.channel()).to_string(),
            partition: config.parse("partition")?,
            key_serializer: config.get_or("key.serializer", "string").to_string(),
            value_serializer: config.require("value.serializer")?.to_string(),
            tracing_enabled: config.parse_or("tracing-enabled", true)?,
        })
    }
}
