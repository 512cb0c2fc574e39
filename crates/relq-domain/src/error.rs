use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::record::{MessageId, MessageState};

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid queue key: {0:?}")]
    InvalidQueueKey(String),

    #[error("illegal transition '{event}' from state {from}")]
    IllegalTransition {
        from: MessageState,
        event: &'static str,
    },

    #[error("lease on message {message_id} still held until {expires_at:?}")]
    LeaseStillHeld {
        message_id: MessageId,
        expires_at: Option<DateTime<Utc>>,
    },
}
