use std::collections::HashSet;

use chrono::Utc;
use relq_domain::{machine, MessageRecord, MessageState, Notification, Topic, TransitionEvent};
use relq_store::StoreError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::queue::{to_chrono, QueueClient};

impl QueueClient {
    pub(crate) async fn janitor_worker(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.settings().janitor_interval;
        debug!(queue = %self.key(), "janitor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.sweep_once().await {
                        warn!(queue = %self.key(), error = %err, "janitor sweep failed");
                    }
                }
            }
        }
        debug!(queue = %self.key(), "janitor stopped");
    }

    /// One pass over the queue's durable state: TTL expiry, abandoned-lease
    /// reclaim, notify-orphan re-enqueue, orphaned-blob deletion, and
    /// expired affinity removal. Every mutation is etag-conditional; a
    /// conflict means another actor moved first and the row is skipped.
    pub async fn sweep_once(&self) -> Result<(), EngineError> {
        let storage = self.storage()?;
        let now = Utc::now();
        let records = storage.scan_records().await?;

        let mut live_ids: HashSet<relq_domain::MessageId> = HashSet::new();
        let mut touched_topics: HashSet<Topic> = HashSet::new();

        for (record, etag) in records {
            // Poison records keep their body for out-of-band inspection, so
            // their blobs are not orphans.
            if !record.state.is_terminal() || record.state == MessageState::Poison {
                live_ids.insert(record.message_id);
            }
            if record.state.is_terminal() {
                continue;
            }

            if record.is_expired(now) {
                touched_topics.insert(record.topic.clone());
                if let Err(err) = self.expire_record(record, etag).await {
                    warn!(queue = %self.key(), error = %err, "expiry sweep failed for record");
                }
                continue;
            }

            match record.state {
                MessageState::Claimed | MessageState::Processing => {
                    if !record.has_live_lease(now) {
                        self.reclaim_lease(record, etag, now).await;
                    }
                }
                MessageState::Queued => {
                    let idle_since = record.last_attempted_at.unwrap_or(record.created_at);
                    if now - idle_since >= to_chrono(self.settings().notify_orphan_after) {
                        debug!(
                            queue = %self.key(),
                            message_id = %record.message_id,
                            "re-enqueueing notification for stale queued record"
                        );
                        if let Err(err) = storage
                            .enqueue_notification(&Notification::for_record(&record), None)
                            .await
                        {
                            warn!(queue = %self.key(), error = %err, "orphan re-enqueue failed");
                        }
                    }
                }
                _ => {}
            }
        }

        // Blobs whose record is gone or terminal, past the grace period.
        let grace = to_chrono(self.settings().blob_orphan_grace);
        for blob in storage.list_bodies().await? {
            let Some(message_id) = storage.message_id_from_body_path(&blob.path) else {
                continue;
            };
            if live_ids.contains(&message_id) {
                continue;
            }
            if now - blob.created_at >= grace {
                debug!(queue = %self.key(), message_id = %message_id, "deleting orphaned blob");
                if let Err(err) = storage.delete_body(&blob.path).await {
                    warn!(queue = %self.key(), error = %err, "orphaned blob delete failed");
                }
            }
        }

        // Affinity rows past their expiry are stale hints.
        for (partition, affinity, etag) in storage.scan_affinities().await? {
            if !affinity.is_live(now) {
                match storage.delete_affinity_row(&partition, &etag).await {
                    Ok(()) => debug!(queue = %self.key(), partition, "expired affinity removed"),
                    Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {}
                    Err(err) => {
                        warn!(queue = %self.key(), error = %err, "affinity cleanup failed")
                    }
                }
            }
        }

        for topic in &touched_topics {
            self.pump(topic).await;
        }
        Ok(())
    }

    /// TTL elapsed: move the record to its terminal `Expired` state and
    /// drop the body.
    pub(crate) async fn expire_record(
        &self,
        record: MessageRecord,
        etag: String,
    ) -> Result<(), EngineError> {
        let storage = self.storage()?;
        let expired = machine::transition(&record, &TransitionEvent::TtlExpired)?;
        match storage.replace_record(&expired, &etag).await {
            Ok(_) => {
                info!(
                    queue = %self.key(),
                    message_id = %expired.message_id,
                    topic = %expired.topic,
                    sequence = expired.sequence,
                    "message expired before delivery"
                );
                if let Err(err) = storage.delete_body(&expired.body_blob_path).await {
                    debug!(queue = %self.key(), error = %err, "expired body delete failed");
                }
                self.ordering()
                    .mark_complete(&expired.topic, expired.sequence);
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(
                    queue = %self.key(),
                    message_id = %record.message_id,
                    "expiry raced another transition"
                );
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn reclaim_lease(
        &self,
        record: MessageRecord,
        etag: String,
        now: chrono::DateTime<Utc>,
    ) {
        let Ok(storage) = self.storage() else { return };
        let requeued = match machine::transition(&record, &TransitionEvent::LeaseExpired { now }) {
            Ok(requeued) => requeued,
            Err(err) => {
                // The lease sprang back to life between the scan and here.
                debug!(queue = %self.key(), message_id = %record.message_id, error = %err, "lease not reclaimable");
                return;
            }
        };
        match storage.replace_record(&requeued, &etag).await {
            Ok(_) => {
                info!(
                    queue = %self.key(),
                    message_id = %requeued.message_id,
                    attempts = requeued.attempts,
                    "reclaimed abandoned lease"
                );
                if let Err(err) = storage
                    .enqueue_notification(&Notification::for_record(&requeued), None)
                    .await
                {
                    warn!(queue = %self.key(), error = %err, "reclaim re-enqueue failed");
                }
            }
            Err(StoreError::Conflict { .. }) => {}
            Err(err) => {
                warn!(queue = %self.key(), error = %err, "lease reclaim write failed");
            }
        }
    }
}
