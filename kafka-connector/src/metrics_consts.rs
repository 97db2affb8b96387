// ==== Incoming channel metrics ====
/// Counter for records delivered by the broker client, labelled by channel
pub const MESSAGES_RECEIVED: &str = "kafka_connector_messages_received_total";

/// Counter for records that could not be decoded
pub const DESERIALIZATION_FAILURES: &str = "kafka_connector_deserialization_failures_total";

/// Counter for completed acknowledgments, labelled by status (acked, nacked)
pub const MESSAGES_COMPLETED: &str = "kafka_connector_messages_completed_total";

/// Counter for second ack/nack calls that were ignored
pub const DUPLICATE_ACKNOWLEDGMENTS: &str = "kafka_connector_duplicate_acknowledgments_total";

// ==== Failure strategy metrics ====
/// Counter for channels stopped by the fail strategy
pub const CHANNEL_FAILURES: &str = "kafka_connector_channel_failures_total";

/// Counter for nacks swallowed by the ignore strategy
pub const IGNORED_FAILURES: &str = "kafka_connector_ignored_failures_total";

/// Counter for records republished to a dead-letter topic, labelled by status
pub const DEAD_LETTER_RECORDS: &str = "kafka_connector_dead_letter_records_total";

// ==== Offset commit metrics ====
/// Counter for commit calls, labelled by status (ok, error)
pub const OFFSET_COMMITS: &str = "kafka_connector_offset_commits_total";

/// Gauge for acknowledged offsets waiting behind an unacknowledged one
pub const PENDING_ACKS: &str = "kafka_connector_partition_pending_acks";

/// Gauge for the last committed offset per partition
pub const LAST_COMMITTED_OFFSET: &str = "kafka_connector_partition_last_committed_offset";

// ==== Outgoing channel metrics ====
/// Counter for records sent by a sink, labelled by status
pub const RECORDS_SENT: &str = "kafka_connector_records_sent_total";

// ==== Mediator metrics ====
/// Counter for invocations of a processing method, labelled by outcome
pub const INVOCATIONS: &str = "kafka_connector_invocations_total";

/// Counter for messages left unsettled because their nack could not complete
pub const UNSETTLED_MESSAGES: &str = "kafka_connector_unsettled_messages_total";
