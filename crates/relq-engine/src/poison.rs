use chrono::Utc;
use relq_domain::{machine, MessageRecord, MessageState, Notification, TransitionEvent};
use relq_store::StoreError;
use tracing::{debug, error};

use crate::error::EngineError;
use crate::queue::QueueClient;

impl QueueClient {
    /// Resolve a failed delivery attempt: requeue while attempts remain,
    /// quarantine as poison once the budget is spent.
    ///
    /// The record keeps its blob so operators can inspect poisoned messages
    /// out-of-band, and a poisoned sequence counts as complete so it never
    /// blocks the topic's ordering.
    pub(crate) async fn resolve_nack(
        &self,
        record: MessageRecord,
        etag: String,
        reason: &str,
    ) -> Result<(), EngineError> {
        let storage = self.storage()?;
        let nack = TransitionEvent::Nack {
            max_attempts: self.settings().max_attempts,
            now: Utc::now(),
        };
        let next = machine::transition(&record, &nack)?;
        match storage.replace_record(&next, &etag).await {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => {
                // Lost the lease; re-read so the error carries the state
                // the record actually reached.
                debug!(
                    queue = %self.key(),
                    message_id = %record.message_id,
                    "nack outcome discarded after losing the lease"
                );
                return match storage.read_record(&record.topic, record.message_id).await? {
                    Some((actual, _)) => Err(EngineError::UnexpectedState {
                        queue: self.key().clone(),
                        message_id: record.message_id,
                        expected: MessageState::Processing,
                        actual: actual.state,
                    }),
                    None => Ok(()),
                };
            }
            Err(e) => return Err(e.into()),
        }
        match next.state {
            MessageState::Queued => {
                debug!(
                    queue = %self.key(),
                    message_id = %next.message_id,
                    attempts = next.attempts,
                    max_attempts = self.settings().max_attempts,
                    reason,
                    "delivery failed; requeued for retry"
                );
                // The transition itself re-enqueues the retry notification
                // rather than waiting out the visibility timeout.
                storage
                    .enqueue_notification(&Notification::for_record(&next), None)
                    .await?;
            }
            MessageState::Poison => {
                error!(
                    queue = %self.key(),
                    message_id = %next.message_id,
                    topic = %next.topic,
                    sequence = next.sequence,
                    attempts = next.attempts,
                    reason,
                    "message quarantined as poison"
                );
                self.ordering().mark_complete(&next.topic, next.sequence);
            }
            _ => {}
        }
        Ok(())
    }
}
