use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keys::{QueueKey, Topic};

/// Unique message identifier, client-assigned at send (UUID v4).
pub type MessageId = Uuid;

// ── Message lifecycle states ──────────────────────────────────────────────────

/// The durable lifecycle state of a message.
///
/// Transitions:
///   New → Queued → Claimed → Processing
///   Processing → Delivered | Queued (retry) | Poison
///   Claimed | Processing → Queued (lease expired)
///   Queued | Claimed | Processing → Expired (TTL elapsed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Constructed but not yet durably queued.
    New,
    /// Durable and awaiting delivery.
    Queued,
    /// A receiver holds a lease but has not started the handler.
    Claimed,
    /// The handler is running under a live lease.
    Processing,
    /// Handler acknowledged; terminal.
    Delivered,
    /// Delivery attempts exhausted; terminal.
    Poison,
    /// Time-to-live elapsed before successful delivery; terminal.
    Expired,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageState::Delivered | MessageState::Poison | MessageState::Expired
        )
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageState::New => "new",
            MessageState::Queued => "queued",
            MessageState::Claimed => "claimed",
            MessageState::Processing => "processing",
            MessageState::Delivered => "delivered",
            MessageState::Poison => "poison",
            MessageState::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

// ── EndpointId ────────────────────────────────────────────────────────────────

/// Identifies one service instance for leases and topic affinity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl EndpointId {
    pub fn new(s: impl Into<String>) -> Self {
        EndpointId(s.into())
    }

    /// Fresh process-unique endpoint id for instances without a configured
    /// name.
    pub fn generate() -> Self {
        EndpointId(format!("endpoint-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Lease ─────────────────────────────────────────────────────────────────────

/// A time-bounded claim on a record. A record is in `Claimed`/`Processing`
/// iff its lease is present and unexpired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub owner_endpoint_id: EndpointId,
    pub lease_expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at > now
    }
}

// ── MessageRecord ─────────────────────────────────────────────────────────────

/// The durable authority on a message. Everything else (the notification on
/// the backend queue, the in-memory ordering buffer) is a pointer to this
/// row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub queue_key: QueueKey,
    #[serde(default)]
    pub topic: Topic,
    /// Monotonically increasing per (queue, topic), assigned at send.
    pub sequence: i64,
    pub state: MessageState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub lease: Option<Lease>,
    /// Address of the payload in the blob store. Immutable after creation.
    pub body_blob_path: String,
    pub size_bytes: u64,
    pub content_type: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl MessageRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_id: MessageId,
        queue_key: QueueKey,
        topic: Topic,
        sequence: i64,
        body_blob_path: String,
        size_bytes: u64,
        content_type: String,
        metadata: HashMap<String, String>,
        now: DateTime<Utc>,
        time_to_live: Duration,
    ) -> Self {
        MessageRecord {
            message_id,
            queue_key,
            topic,
            sequence,
            state: MessageState::New,
            attempts: 0,
            created_at: now,
            last_attempted_at: None,
            expires_at: now + time_to_live,
            lease: None,
            body_blob_path,
            size_bytes,
            content_type,
            metadata,
        }
    }

    /// Canonical table row key: the hyphenated 128-bit id string.
    pub fn row_key(&self) -> String {
        self.message_id.to_string()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && self.expires_at <= now
    }

    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().map_or(false, |l| l.is_live(now))
    }
}

// ── TopicAffinityRecord ───────────────────────────────────────────────────────

/// Advisory per-(queue, topic) row recording which endpoint last delivered
/// on the topic. Receivers on other endpoints briefly defer to the recorded
/// owner so a topic's ordering state concentrates on one node at a time.
/// Never ownership; claiming still goes through the lease protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicAffinityRecord {
    pub last_owner_endpoint_id: EndpointId,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TopicAffinityRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
