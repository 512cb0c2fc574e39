use relq_domain::QueueKey;

/// Row key of the per-topic affinity record in the topic table.
pub const AFFINITY_ROW_KEY: &str = "_affinity";

/// Row key of the per-topic sequence counter in the topic table.
pub const SEQUENCE_ROW_KEY: &str = "_sequence";

/// Backend resource names for one queue.
///
/// These names are a compatibility contract: existing stored data is
/// addressed through them, so the mangling must reproduce exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueResources {
    /// Blob container holding message bodies.
    pub container: String,
    /// Backend FIFO queue carrying notifications.
    pub fifo_queue: String,
    /// Table of message records; partition = topic identifier, row =
    /// message id.
    pub state_table: String,
    /// Table of per-topic rows (affinity, sequence counter); partition =
    /// topic identifier.
    pub topic_table: String,
}

impl QueueResources {
    pub fn for_queue(key: &QueueKey) -> Self {
        QueueResources {
            container: format!("reliable-queue-body-{}", key.identifier()),
            fifo_queue: format!("reliable-queue-{}", key.identifier()),
            state_table: format!("ReliableQueueState{}", key.table_identifier()),
            topic_table: format!("ReliableQueueTopic{}", key.table_identifier()),
        }
    }
}
