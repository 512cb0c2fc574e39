use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use relq_domain::{machine, MessageRecord, MessageState, Notification, Topic, TransitionEvent};
use relq_store::{ReceiptHandle, StoreError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::handler::Delivery;
use crate::ordering::Admission;
use crate::queue::{to_chrono, QueueClient};

/// How long an idle pull worker waits before polling again.
const IDLE_POLL_DELAY: Duration = Duration::from_millis(100);
/// Pause after a dequeue failure before retrying.
const ERROR_POLL_DELAY: Duration = Duration::from_millis(500);
/// Visibility delay when deferring to a topic's preferred owner.
const AFFINITY_DEFER_DELAY: Duration = Duration::from_millis(250);
/// Visibility delay when no handler is attached yet.
const NO_HANDLER_DELAY: Duration = Duration::from_millis(500);
/// Slack added to the sliding window before draining buffered sequences.
const WINDOW_DRAIN_SLACK: Duration = Duration::from_millis(50);

/// Where a notification came from. A pull notification owns a receipt
/// handle that must be acked or released; push and buffered notifications
/// have no backing queue message.
pub(crate) enum NotificationSource {
    Pull(ReceiptHandle),
    Push,
    Buffered,
}

/// Shared between the delivery path and its lease-renewal task; the etag
/// tracks the record across renewals so the final transition still wins.
struct LeaseCell {
    record: MessageRecord,
    etag: String,
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl QueueClient {
    /// External push path: feed a notification payload straight into the
    /// delivery pipeline, for environments without a listener.
    pub async fn on_received(&self, payload: &str) -> Result<(), EngineError> {
        self.ensure_enabled()?;
        if !self.settings().mode.permits_receive() {
            return Err(EngineError::ModeDoesNotPermitReceive {
                queue: self.key().clone(),
                mode: self.settings().mode,
            });
        }
        let notification = Notification::from_json(payload)
            .map_err(|e| EngineError::BadNotification(e.to_string()))?;
        if notification.queue_key != *self.key() {
            return Err(EngineError::BadNotification(format!(
                "notification for queue {} delivered to {}",
                notification.queue_key,
                self.key()
            )));
        }
        let topic = notification.topic.clone();
        let result = self
            .handle_notification(notification, NotificationSource::Push)
            .await;
        self.pump(&topic).await;
        result
    }

    pub(crate) async fn pull_worker(&self, mut shutdown: watch::Receiver<bool>) {
        debug!(queue = %self.key(), endpoint = %self.endpoint(), "pull worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = self.poll_once() => {}
            }
        }
        debug!(queue = %self.key(), "pull worker stopped");
    }

    async fn poll_once(&self) {
        let Ok(storage) = self.storage() else {
            tokio::time::sleep(ERROR_POLL_DELAY).await;
            return;
        };
        let visibility = self.settings().default_timeout;
        match storage.dequeue_notification(visibility).await {
            Ok(Some(message)) => match Notification::from_json(&message.payload) {
                Ok(notification) => {
                    let topic = notification.topic.clone();
                    if let Err(err) = self
                        .handle_notification(notification, NotificationSource::Pull(message.handle))
                        .await
                    {
                        warn!(queue = %self.key(), error = %err, "notification processing failed");
                    }
                    self.pump(&topic).await;
                }
                Err(err) => {
                    warn!(queue = %self.key(), error = %err, "dropping malformed notification");
                    if let Err(err) = storage.ack_notification(&message.handle).await {
                        debug!(queue = %self.key(), error = %err, "notification ack failed");
                    }
                }
            },
            Ok(None) => tokio::time::sleep(IDLE_POLL_DELAY).await,
            Err(err) => {
                warn!(queue = %self.key(), error = %err, "dequeue failed");
                tokio::time::sleep(ERROR_POLL_DELAY).await;
            }
        }
    }

    /// Front half of the receive pipeline: load the record, expire or drop
    /// dead notifications, gate on affinity and ordering, then deliver.
    pub(crate) async fn handle_notification(
        &self,
        notification: Notification,
        source: NotificationSource,
    ) -> Result<(), EngineError> {
        let storage = self.storage()?;
        let now = Utc::now();

        // The record is the source of truth; a notification without a live
        // record is noise.
        let Some((record, etag)) = storage
            .read_record(&notification.topic, notification.message_id)
            .await?
        else {
            debug!(
                queue = %self.key(),
                message_id = %notification.message_id,
                "record missing; dropping notification"
            );
            self.finish_source(&source).await;
            return Ok(());
        };

        if record.state.is_terminal() {
            self.ordering()
                .mark_complete(&notification.topic, notification.sequence);
            self.finish_source(&source).await;
            return Ok(());
        }

        if record.is_expired(now) {
            self.expire_record(record, etag).await?;
            self.finish_source(&source).await;
            return Ok(());
        }

        if !matches!(source, NotificationSource::Buffered) {
            self.ensure_topic_tracked(&notification.topic).await?;

            // Cross-node affinity: defer briefly to the endpoint that last
            // delivered on this topic, unless we have already waited a full
            // sliding window for it.
            let foreign_owner = match storage.read_affinity(&notification.topic).await? {
                Some((affinity, _))
                    if affinity.last_owner_endpoint_id != *self.endpoint()
                        && affinity.is_live(now) =>
                {
                    Some(affinity.last_owner_endpoint_id)
                }
                _ => None,
            };
            match foreign_owner {
                Some(owner)
                    if self
                        .ordering()
                        .should_defer_for_affinity(&notification.topic, Instant::now()) =>
                {
                    debug!(
                        queue = %self.key(),
                        topic = %notification.topic,
                        owner = %owner,
                        "deferring to the topic's preferred owner"
                    );
                    if let NotificationSource::Pull(handle) = &source {
                        if let Err(err) = storage
                            .extend_notification(handle, AFFINITY_DEFER_DELAY)
                            .await
                        {
                            debug!(queue = %self.key(), error = %err, "deferred release failed");
                        }
                    } else {
                        self.schedule_push_retry(notification.clone());
                    }
                    return Ok(());
                }
                Some(_) => {}
                None => self.ordering().clear_affinity_defer(&notification.topic),
            }

            match self.ordering().admit(&notification, Instant::now()) {
                Admission::Deliver | Admission::Stale => {}
                Admission::Buffered => {
                    debug!(
                        queue = %self.key(),
                        topic = %notification.topic,
                        sequence = notification.sequence,
                        "buffered out-of-order sequence"
                    );
                    // The record stays queued, so the buffer may be lossy:
                    // the notify-orphan sweep re-enqueues anything a crash
                    // drops here.
                    self.finish_source(&source).await;
                    self.schedule_window_drain(notification.topic.clone());
                    return Ok(());
                }
            }
        }

        self.deliver(record, etag, &source).await
    }

    /// Back half: claim the record, invoke handlers and record the outcome.
    async fn deliver(
        &self,
        record: MessageRecord,
        etag: String,
        source: &NotificationSource,
    ) -> Result<(), EngineError> {
        let storage = self.storage()?;
        let now = Utc::now();

        if record.state != MessageState::Queued {
            // Claimed or processing under a live lease elsewhere; the
            // janitor reclaims it if the lease lapses.
            debug!(
                queue = %self.key(),
                message_id = %record.message_id,
                state = %record.state,
                "record not claimable"
            );
            self.finish_source(source).await;
            return Ok(());
        }

        let handlers = self.subscribers_snapshot();
        if handlers.is_empty() {
            debug!(queue = %self.key(), "no handler attached; leaving message queued");
            if let NotificationSource::Pull(handle) = source {
                if let Err(err) = storage.extend_notification(handle, NO_HANDLER_DELAY).await {
                    debug!(queue = %self.key(), error = %err, "release failed");
                }
            }
            return Ok(());
        }

        // Queued → Claimed: the attempt increment and the lease land in one
        // conditional write.
        let lease_duration = self.settings().default_timeout;
        let claim = TransitionEvent::Claim {
            endpoint: self.endpoint().clone(),
            lease_expires_at: now + to_chrono(lease_duration),
            now,
        };
        let claimed = machine::transition(&record, &claim)?;
        let etag = match storage.replace_record(&claimed, &etag).await {
            Ok(etag) => etag,
            Err(StoreError::Conflict { .. }) => {
                // Someone else claimed between our read and our write.
                debug!(
                    queue = %self.key(),
                    message_id = %record.message_id,
                    "claim lost to another receiver"
                );
                self.finish_source(source).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let record = claimed;

        let processing = machine::transition(&record, &TransitionEvent::Begin)?;
        let etag = match storage.replace_record(&processing, &etag).await {
            Ok(etag) => etag,
            Err(StoreError::Conflict { .. }) => {
                warn!(
                    queue = %self.key(),
                    message_id = %record.message_id,
                    "lost lease before processing began"
                );
                self.finish_source(source).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let record = processing;

        let Some(blob) = storage.get_body(&record.body_blob_path).await? else {
            warn!(
                queue = %self.key(),
                message_id = %record.message_id,
                "message body missing from blob store"
            );
            let result = self.resolve_nack(record, etag, "message body missing").await;
            self.finish_source(source).await;
            return result;
        };

        let delivery = Delivery::new(
            self.key().clone(),
            record.topic.clone(),
            record.message_id,
            record.attempts,
            blob.content_type.clone(),
            record.metadata.clone(),
            blob.bytes,
        );

        // Keep the lease (and the pull notification) alive while the
        // handler runs; renewal stops when the guard drops.
        let lease = Arc::new(tokio::sync::Mutex::new(LeaseCell {
            record: record.clone(),
            etag,
        }));
        let renewal = self.spawn_lease_renewal(lease.clone(), source);

        let mut handled = false;
        let mut failure: Option<String> = None;
        for handler in handlers {
            match handler.handle(delivery.clone()).await {
                Ok(true) => {
                    handled = true;
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        queue = %self.key(),
                        message_id = %record.message_id,
                        attempts = record.attempts,
                        error = %err,
                        "handler failed"
                    );
                    failure = Some(err.to_string());
                }
            }
        }
        drop(renewal);

        let (record, etag) = {
            let cell = lease.lock().await;
            (cell.record.clone(), cell.etag.clone())
        };

        if handled {
            let delivered = machine::transition(&record, &TransitionEvent::Ack)?;
            match storage.replace_record(&delivered, &etag).await {
                Ok(_) => {
                    info!(
                        queue = %self.key(),
                        message_id = %delivered.message_id,
                        topic = %delivered.topic,
                        sequence = delivered.sequence,
                        attempts = delivered.attempts,
                        "message delivered"
                    );
                    self.refresh_affinity(&delivered.topic).await;
                    if let Err(err) = storage.delete_body(&delivered.body_blob_path).await {
                        debug!(
                            queue = %self.key(),
                            error = %err,
                            "body cleanup failed; the janitor will collect it"
                        );
                    }
                    self.ordering()
                        .mark_complete(&delivered.topic, delivered.sequence);
                    self.finish_source(source).await;
                    Ok(())
                }
                Err(StoreError::Conflict { .. }) => {
                    // The lease lapsed mid-handler and someone else moved
                    // the record; their outcome stands. Re-read so the
                    // error names both sides of the disagreement.
                    self.finish_source(source).await;
                    match storage.read_record(&record.topic, record.message_id).await? {
                        Some((actual, _)) => Err(EngineError::UnexpectedState {
                            queue: self.key().clone(),
                            message_id: record.message_id,
                            expected: MessageState::Processing,
                            actual: actual.state,
                        }),
                        None => {
                            warn!(
                                queue = %self.key(),
                                message_id = %record.message_id,
                                "record vanished mid-delivery"
                            );
                            Ok(())
                        }
                    }
                }
                // Not acked: the notification redelivers and the handler
                // may run again, which the contract permits.
                Err(e) => Err(e.into()),
            }
        } else {
            let reason = failure.unwrap_or_else(|| "handler declined the message".to_string());
            let result = self.resolve_nack(record, etag, &reason).await;
            self.finish_source(source).await;
            result
        }
    }

    /// Drain every buffered sequence that is ready: contiguous successors
    /// after a delivery, or the smallest buffered sequence once the sliding
    /// window has expired on a gap.
    pub(crate) async fn pump(&self, topic: &Topic) {
        loop {
            let Some(notification) = self.ordering().pop_ready(topic, Instant::now()) else {
                break;
            };
            debug!(
                queue = %self.key(),
                topic = %topic,
                sequence = notification.sequence,
                "draining buffered sequence"
            );
            if let Err(err) = self
                .handle_notification(notification, NotificationSource::Buffered)
                .await
            {
                warn!(queue = %self.key(), topic = %topic, error = %err, "buffered delivery failed");
                break;
            }
        }
    }

    /// Initialize the topic watermark from the smallest non-terminal
    /// sequence in the state table. A node that starts mid-stream must not
    /// wait for sequences that finished before it existed.
    async fn ensure_topic_tracked(&self, topic: &Topic) -> Result<(), EngineError> {
        if self.ordering().is_tracked(topic) {
            return Ok(());
        }
        let storage = self.storage()?;
        let records = storage.query_topic_records(topic).await?;
        let next = records
            .iter()
            .filter(|(record, _)| !record.state.is_terminal())
            .map(|(record, _)| record.sequence)
            .min();
        if let Some(next) = next {
            debug!(queue = %self.key(), topic = %topic, next, "tracking topic");
            self.ordering().track(topic, next);
        }
        Ok(())
    }

    fn schedule_push_retry(&self, notification: Notification) {
        let client = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(AFFINITY_DEFER_DELAY).await;
            let topic = notification.topic.clone();
            if let Err(err) = client
                .handle_notification(notification, NotificationSource::Push)
                .await
            {
                warn!(queue = %client.key(), error = %err, "push retry failed");
            }
            client.pump(&topic).await;
        });
    }

    fn schedule_window_drain(&self, topic: Topic) {
        let client = self.clone();
        let window = self.settings().sliding_window;
        tokio::spawn(async move {
            tokio::time::sleep(window + WINDOW_DRAIN_SLACK).await;
            client.pump(&topic).await;
        });
    }

    async fn finish_source(&self, source: &NotificationSource) {
        if let NotificationSource::Pull(handle) = source {
            let Ok(storage) = self.storage() else { return };
            if let Err(err) = storage.ack_notification(handle).await {
                debug!(queue = %self.key(), error = %err, "notification ack failed");
            }
        }
    }

    fn spawn_lease_renewal(
        &self,
        lease: Arc<tokio::sync::Mutex<LeaseCell>>,
        source: &NotificationSource,
    ) -> AbortOnDrop {
        let client = self.clone();
        let handle = match source {
            NotificationSource::Pull(handle) => Some(handle.clone()),
            _ => None,
        };
        let lease_duration = self.settings().default_timeout;
        AbortOnDrop(tokio::spawn(async move {
            let interval = lease_duration / 2;
            loop {
                tokio::time::sleep(interval).await;
                let Ok(storage) = client.storage() else {
                    return;
                };
                {
                    let mut cell = lease.lock().await;
                    let mut renewed = cell.record.clone();
                    match renewed.lease.as_mut() {
                        Some(l) => l.lease_expires_at = Utc::now() + to_chrono(lease_duration),
                        None => return,
                    }
                    match storage.replace_record(&renewed, &cell.etag).await {
                        Ok(etag) => {
                            debug!(
                                queue = %client.key(),
                                message_id = %renewed.message_id,
                                "lease renewed"
                            );
                            cell.record = renewed;
                            cell.etag = etag;
                        }
                        Err(err) => {
                            warn!(
                                queue = %client.key(),
                                message_id = %renewed.message_id,
                                error = %err,
                                "lease renewal failed"
                            );
                            return;
                        }
                    }
                }
                if let Some(handle) = &handle {
                    if let Err(err) = storage.extend_notification(handle, lease_duration).await {
                        debug!(queue = %client.key(), error = %err, "visibility extension failed");
                    }
                }
            }
        }))
    }

    async fn refresh_affinity(&self, topic: &Topic) {
        let Ok(storage) = self.storage() else { return };
        let now = Utc::now();
        let record = relq_domain::TopicAffinityRecord {
            last_owner_endpoint_id: self.endpoint().clone(),
            last_activity_at: now,
            expires_at: now + to_chrono(self.settings().topic_affinity_ttl),
        };
        if let Err(err) = storage.write_affinity(topic, &record).await {
            debug!(queue = %self.key(), topic = %topic, error = %err, "affinity refresh failed");
        }
    }
}
