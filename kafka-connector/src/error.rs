use thiserror::Error;

/// Errors detected while wiring a channel or a mediator. They are fatal at
/// startup and are reported before any message flows.
#[derive(Error, Debug)]
pub enum WiringError {
    #[error("missing required property `{key}` for channel {channel}")]
    MissingProperty { channel: String, key: String },
    #[error("invalid value `{value}` for property `{key}` of channel {channel}")]
    InvalidProperty {
        channel: String,
        key: String,
        value: String,
    },
    #[error("cannot find the Kafka configuration named `{0}`")]
    UnknownNamedConfiguration(String),
    #[error("no codec registered under `{0}`")]
    UnknownCodec(String),
    #[error("invalid method shape for {method}: {reason}")]
    InvalidShape { method: String, reason: String },
    #[error("mediator for {0} is not connected to an upstream")]
    NotConnected(String),
    #[error("mediator for {0} is already running")]
    AlreadyRunning(String),
    #[error("failed to subscribe {method} to its upstream: {source:#}")]
    Subscription {
        method: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to create broker client for channel {channel}: {source}")]
    Client {
        channel: String,
        #[source]
        source: BrokerError,
    },
}

/// Failures observed while messages flow: processing failures, nack
/// outcomes, dead-letter publication and commits.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("processing failed: {0:#}")]
    Processing(#[source] anyhow::Error),
    #[error("channel {channel} stopped after failure: {reason}")]
    ChannelFailed { channel: String, reason: String },
    #[error("failed to publish to dead-letter topic {topic}: {source}")]
    DeadLetter {
        topic: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to send record to {topic}: {source}")]
    Send {
        topic: String,
        #[source]
        source: BrokerError,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("downstream rejected message: {0:#}")]
    Downstream(#[source] anyhow::Error),
}

impl ConnectorError {
    /// Failures that end the message they were raised for but leave its
    /// channel running. A record whose dead-letter publication failed stays
    /// unacknowledged and is redelivered after a restart.
    pub fn is_message_scoped(&self) -> bool {
        matches!(self, ConnectorError::DeadLetter { .. })
    }
}

/// Errors raised by a broker client implementation.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("delivery of record to {0} was cancelled")]
    Canceled(String),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to serialize record for {topic}: {reason}")]
    Serialize { topic: String, reason: String },
    #[error("failed to deserialize record from {topic}: {reason}")]
    Deserialize { topic: String, reason: String },
}
