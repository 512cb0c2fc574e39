use chrono::{DateTime, Utc};

use crate::error::DomainError;
use crate::record::{EndpointId, Lease, MessageRecord, MessageState};

// ── Transition events ─────────────────────────────────────────────────────────

/// An event applied to a [`MessageRecord`] through [`transition`].
///
/// Every durable application of a transition is an etag-conditional replace
/// of the record row; on conflict the caller re-reads and re-evaluates
/// rather than retrying the same transition blindly.
#[derive(Debug, Clone)]
pub enum TransitionEvent {
    /// `New → Queued`, performed by the sender before the initial insert.
    Send,
    /// `Queued → Claimed`. Increments `attempts` and installs the lease in
    /// the same conditional write.
    Claim {
        endpoint: EndpointId,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    /// `Claimed → Processing`.
    Begin,
    /// `Processing → Delivered`.
    Ack,
    /// `Processing → Queued` while attempts remain, else `Processing →
    /// Poison`. Classification compares the already-incremented attempt
    /// count against `max_attempts`.
    Nack { max_attempts: u32, now: DateTime<Utc> },
    /// `Claimed | Processing → Queued` once the lease has lapsed.
    LeaseExpired { now: DateTime<Utc> },
    /// Any non-terminal state → `Expired`.
    TtlExpired,
}

impl TransitionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransitionEvent::Send => "send",
            TransitionEvent::Claim { .. } => "claim",
            TransitionEvent::Begin => "begin",
            TransitionEvent::Ack => "ack",
            TransitionEvent::Nack { .. } => "nack",
            TransitionEvent::LeaseExpired { .. } => "lease_expired",
            TransitionEvent::TtlExpired => "ttl_expired",
        }
    }
}

// ── Transition function ───────────────────────────────────────────────────────

/// Apply `event` to `record`, returning the successor record or refusing
/// with [`DomainError::IllegalTransition`]. Pure; callers persist the result
/// with an etag-conditional replace.
pub fn transition(
    record: &MessageRecord,
    event: &TransitionEvent,
) -> Result<MessageRecord, DomainError> {
    use MessageState::*;

    let mut next = record.clone();
    match (record.state, event) {
        (New, TransitionEvent::Send) => {
            next.state = Queued;
        }
        (
            Queued,
            TransitionEvent::Claim {
                endpoint,
                lease_expires_at,
                now,
            },
        ) => {
            next.state = Claimed;
            next.attempts += 1;
            next.last_attempted_at = Some(*now);
            next.lease = Some(Lease {
                owner_endpoint_id: endpoint.clone(),
                lease_expires_at: *lease_expires_at,
            });
        }
        (Claimed, TransitionEvent::Begin) => {
            next.state = Processing;
        }
        (Processing, TransitionEvent::Ack) => {
            next.state = Delivered;
            next.lease = None;
        }
        (Processing, TransitionEvent::Nack { max_attempts, now }) => {
            next.state = if record.attempts >= *max_attempts {
                Poison
            } else {
                Queued
            };
            next.lease = None;
            next.last_attempted_at = Some(*now);
        }
        (Claimed | Processing, TransitionEvent::LeaseExpired { now }) => {
            if record.has_live_lease(*now) {
                return Err(DomainError::LeaseStillHeld {
                    message_id: record.message_id,
                    expires_at: record.lease.as_ref().map(|l| l.lease_expires_at),
                });
            }
            next.state = Queued;
            next.lease = None;
        }
        (Queued | Claimed | Processing, TransitionEvent::TtlExpired) => {
            next.state = Expired;
            next.lease = None;
        }
        _ => {
            return Err(DomainError::IllegalTransition {
                from: record.state,
                event: event.name(),
            })
        }
    }
    Ok(next)
}
