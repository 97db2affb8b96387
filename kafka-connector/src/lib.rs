//! Kafka connector: binds processing methods to broker topics with
//! at-least-once delivery.
//!
//! An incoming channel ([`source::KafkaSource`]) polls records and hands them
//! out as [`message::Message`]s or [`batch::RecordBatch`]es. A
//! [`mediator::Mediator`] invokes the processing method for each of them and
//! acks or nacks according to its [`mediator::AckStrategy`]. Acks advance the
//! committed offsets of each partition contiguously, nacks go through the
//! channel failure strategy (fail, ignore or dead-letter queue). Outgoing
//! channels ([`sink::KafkaSink`]) publish messages and propagate trace
//! context.
//!
//! When logging errors with a cause chain use `{e:#}` so the root cause
//! stays visible.

pub mod batch;
pub mod broker;
pub mod codec;
pub mod commit;
pub mod config;
pub mod error;
pub mod failure;
pub mod mediator;
pub mod message;
pub mod metrics_consts;
pub mod propagation;
pub mod sink;
pub mod source;
pub mod types;

pub use batch::RecordBatch;
pub use config::{ChannelConfig, ConfigLayer, ConnectorConfig};
pub use error::{BrokerError, CodecError, ConnectorError, WiringError};
pub use mediator::{AckStrategy, Mediator, MediatorConfiguration, ProcessingMethod, WorkerPool};
pub use message::{Envelope, Message};
pub use sink::{KafkaSink, MessageSink};
pub use source::KafkaSource;
