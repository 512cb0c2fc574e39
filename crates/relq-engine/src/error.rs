use std::time::Duration;

use relq_config::Mode;
use relq_domain::{MessageId, MessageState, QueueKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown queue: {0}")]
    UnknownQueue(QueueKey),

    #[error("queue {0} is disabled")]
    QueueDisabled(QueueKey),

    #[error("queue {queue} mode '{mode}' does not permit send")]
    ModeDoesNotPermitSend { queue: QueueKey, mode: Mode },

    #[error("queue {queue} mode '{mode}' does not permit receive")]
    ModeDoesNotPermitReceive { queue: QueueKey, mode: Mode },

    #[error("queue {0} has no storage connection configured")]
    MissingConnectionString(QueueKey),

    #[error("payload of {size} bytes exceeds the {limit} byte limit on queue {queue}")]
    PayloadTooLarge {
        queue: QueueKey,
        size: u64,
        limit: u64,
    },

    #[error(
        "message {message_id} on queue {queue}: expected state {expected}, found {actual}"
    )]
    UnexpectedState {
        queue: QueueKey,
        message_id: MessageId,
        expected: MessageState,
        actual: MessageState,
    },

    #[error("invalid notification payload: {0}")]
    BadNotification(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Domain(#[from] relq_domain::DomainError),

    #[error(transparent)]
    Store(#[from] relq_store::StoreError),
}
