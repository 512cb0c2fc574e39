use serde::{Deserialize, Serialize};

use crate::keys::{QueueKey, Topic};
use crate::record::{MessageId, MessageRecord};

/// The payload placed on the backend FIFO queue.
///
/// A notification only points at a [`MessageRecord`]; receivers treat the
/// record, not the notification, as the source of truth, which makes
/// duplicate delivery harmless. Field names are part of the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub queue_key: QueueKey,
    pub message_id: MessageId,
    #[serde(default)]
    pub topic: Topic,
    pub sequence: i64,
    /// Attempt count at the time this notification was enqueued. A hint
    /// only; the record is authoritative.
    pub attempt_hint: u32,
}

impl Notification {
    pub fn for_record(record: &MessageRecord) -> Self {
        Notification {
            queue_key: record.queue_key.clone(),
            message_id: record.message_id,
            topic: record.topic.clone(),
            sequence: record.sequence,
            attempt_hint: record.attempts,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
