pub mod error;
pub mod keys;
pub mod machine;
pub mod notification;
pub mod record;

pub use error::DomainError;
pub use keys::{canonical_identifier, canonical_table_identifier, QueueKey, Topic};
pub use machine::{transition, TransitionEvent};
pub use notification::Notification;
pub use record::{
    EndpointId, Lease, MessageId, MessageRecord, MessageState, TopicAffinityRecord,
};
