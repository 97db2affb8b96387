use std::fmt;

use rdkafka::message::{BorrowedHeaders, Header, Headers, OwnedHeaders};
use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// Ordered record headers. Keys may repeat; lookups return the last value,
/// like the Java client's `lastHeader`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordHeaders {
    entries: Vec<(String, Option<Vec<u8>>)>,
}

impl RecordHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.push((key.into(), Some(value.into())));
    }

    /// Replaces every header with the given key.
    pub fn set(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.entries.retain(|(k, _)| k != key);
        self.push(key, value);
    }

    pub fn last(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn last_str(&self, key: &str) -> Option<&str> {
        self.last(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extend(&mut self, other: &RecordHeaders) {
        self.entries.extend(other.entries.iter().cloned());
    }

    pub fn to_owned_headers(&self) -> OwnedHeaders {
        self.entries.iter().fold(
            OwnedHeaders::new_with_capacity(self.entries.len()),
            |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: value.as_deref(),
                })
            },
        )
    }
}

impl From<&BorrowedHeaders> for RecordHeaders {
    fn from(headers: &BorrowedHeaders) -> Self {
        Self {
            entries: headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.map(|v| v.to_vec())))
                .collect(),
        }
    }
}
