#![allow(dead_code)]

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use kafka_connector::broker::memory::InMemoryBroker;
use kafka_connector::{ChannelConfig, ProcessingMethod, RecordBatch};

pub const TOPIC: &str = "numbers";
pub const GROUP: &str = "numbers-receiver";
pub const DEAD_LETTER_TOPIC: &str = "numbers-dead-letter-topic";

pub type Batch = RecordBatch<String, i32>;

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

pub fn publish_numbers(broker: &InMemoryBroker, values: Range<i32>) {
    for value in values {
        broker.produce(TOPIC, Some(format!("key-{value}").as_bytes()), &value.to_be_bytes());
    }
}

/// Incoming channel reading integers from `numbers`, three per poll.
pub fn incoming_channel(failure_strategy: &str, extra: &[(&str, &str)]) -> ChannelConfig {
    let mut values = BTreeMap::from([
        ("topic".to_string(), TOPIC.to_string()),
        ("group.id".to_string(), GROUP.to_string()),
        ("value.deserializer".to_string(), "integer".to_string()),
        ("batch".to_string(), "true".to_string()),
        ("max.poll.records".to_string(), "3".to_string()),
        ("poll-timeout".to_string(), "20".to_string()),
        ("commit-strategy".to_string(), "latest".to_string()),
        ("failure-strategy".to_string(), failure_strategy.to_string()),
    ]);
    for (key, value) in extra {
        values.insert(key.to_string(), value.to_string());
    }
    ChannelConfig::new("numbers-in", values)
}

/// Records the values it sees and nacks any batch holding a non-zero
/// multiple of three. With `stop_at_failure`, values after the failing one
/// are not recorded.
pub fn nack_multiples_of_three(
    received: Arc<Mutex<Vec<i32>>>,
    stop_at_failure: bool,
) -> ProcessingMethod<Batch> {
    ProcessingMethod::message_async(move |batch: Batch| {
        let received = received.clone();
        async move {
            let values = batch.payloads();
            let mut failing = None;
            {
                let mut received = received.lock().unwrap();
                for value in &values {
                    received.push(*value);
                    if *value != 0 && value % 3 == 0 {
                        failing = failing.or(Some(*value));
                        if stop_at_failure {
                            break;
                        }
                    }
                }
            }
            match failing {
                Some(value) => batch.nack(anyhow!("nack all - {value}")).await?,
                None => batch.ack().await?,
            }
            Ok::<_, anyhow::Error>(())
        }
    })
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
