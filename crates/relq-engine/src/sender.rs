use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use relq_domain::{machine, MessageId, MessageRecord, Notification, Topic, TransitionEvent};
use tracing::info;
use uuid::Uuid;

use crate::backoff::retry_transient;
use crate::error::EngineError;
use crate::queue::{to_chrono, QueueClient};

/// Options for [`QueueClient::send`]. The default sends on the default
/// topic as opaque bytes with the queue's default timeout.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub topic: Topic,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            topic: Topic::default(),
            content_type: "application/octet-stream".to_string(),
            metadata: HashMap::new(),
            timeout: None,
        }
    }
}

impl SendOptions {
    pub fn on_topic(topic: Topic) -> Self {
        SendOptions {
            topic,
            ..SendOptions::default()
        }
    }
}

impl QueueClient {
    /// Enqueue a message. Returns once the record insert and the
    /// notification enqueue have both succeeded.
    pub async fn send(&self, body: &[u8], options: SendOptions) -> Result<MessageId, EngineError> {
        self.ensure_enabled()?;
        let settings = self.settings();
        if !settings.mode.permits_send() {
            return Err(EngineError::ModeDoesNotPermitSend {
                queue: self.key().clone(),
                mode: settings.mode,
            });
        }
        let limit = settings.max_payload_bytes;
        if body.len() as u64 > limit {
            return Err(EngineError::PayloadTooLarge {
                queue: self.key().clone(),
                size: body.len() as u64,
                limit,
            });
        }
        let timeout = options.timeout.unwrap_or(settings.default_timeout);
        match tokio::time::timeout(timeout, self.send_inner(body, options)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(timeout)),
        }
    }

    async fn send_inner(
        &self,
        body: &[u8],
        options: SendOptions,
    ) -> Result<MessageId, EngineError> {
        let storage = self.storage()?;
        let message_id = Uuid::new_v4();
        let topic = options.topic;

        // Sequences come from a dedicated counter row. A crash between here
        // and the record insert leaves a gap; the ordering engine closes it
        // once the sliding window expires.
        let topic_ref = &topic;
        let sequence = retry_transient(move || storage.next_sequence(topic_ref)).await?;

        let content_type = options.content_type;
        let content_type_ref = content_type.as_str();
        retry_transient(move || storage.put_body(message_id, body, content_type_ref)).await?;

        let now = Utc::now();
        let record = MessageRecord::new(
            message_id,
            self.key().clone(),
            topic,
            sequence,
            storage.body_blob_path(message_id),
            body.len() as u64,
            content_type.clone(),
            options.metadata,
            now,
            to_chrono(self.settings().message_ttl),
        );
        let record = machine::transition(&record, &TransitionEvent::Send)?;
        let record_ref = &record;
        retry_transient(move || storage.insert_record(record_ref)).await?;

        // A failure past this point leaves the record queued without a
        // notification; the notify-orphan sweep re-enqueues it.
        let notification = Notification::for_record(&record);
        let notification_ref = &notification;
        retry_transient(move || storage.enqueue_notification(notification_ref, None)).await?;

        info!(
            queue = %self.key(),
            message_id = %message_id,
            topic = %record.topic,
            sequence,
            size_bytes = record.size_bytes,
            "message sent"
        );
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relq_config::{Mode, QueueSettings};
    use relq_domain::{EndpointId, MessageState, QueueKey};
    use relq_store::{connect, Storage};

    fn client(conn: &str) -> QueueClient {
        let mut settings = QueueSettings::new(Mode::Both);
        settings.storage = Some(conn.to_string());
        QueueClient::new(
            QueueKey::new("SEND+1").unwrap(),
            settings,
            EndpointId::new("sender-node"),
        )
        .unwrap()
    }

    fn storage(conn: &str) -> Storage {
        Storage::new(connect(conn).unwrap(), &QueueKey::new("SEND+1").unwrap())
    }

    #[tokio::test]
    async fn send_writes_record_blob_and_notification() {
        let conn = "memory://sender-basic";
        let client = client(conn);
        let storage = storage(conn);

        let mut options = SendOptions::on_topic(Topic::new("t"));
        options.content_type = "text/plain".to_string();
        options.metadata.insert("k".into(), "v".into());
        let id = client.send(b"hello", options).await.unwrap();

        let (record, _) = storage
            .read_record(&Topic::new("t"), id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, MessageState::Queued);
        assert_eq!(record.sequence, 1);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.size_bytes, 5);
        assert_eq!(record.content_type, "text/plain");
        assert_eq!(record.metadata["k"], "v");
        assert!(record.expires_at > record.created_at);

        let blob = storage
            .get_body(&record.body_blob_path)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blob.bytes, b"hello");

        let msg = storage
            .dequeue_notification(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let n = Notification::from_json(&msg.payload).unwrap();
        assert_eq!(n.message_id, id);
        assert_eq!(n.sequence, 1);
        assert_eq!(n.attempt_hint, 0);
    }

    #[tokio::test]
    async fn sequences_advance_per_topic() {
        let conn = "memory://sender-sequences";
        let client = client(conn);
        let storage = storage(conn);

        let a1 = client
            .send(b"1", SendOptions::on_topic(Topic::new("a")))
            .await
            .unwrap();
        let a2 = client
            .send(b"2", SendOptions::on_topic(Topic::new("a")))
            .await
            .unwrap();
        let b1 = client
            .send(b"3", SendOptions::on_topic(Topic::new("b")))
            .await
            .unwrap();

        let seq = |topic: &Topic, id| {
            let storage = storage.clone();
            let topic = topic.clone();
            async move {
                storage
                    .read_record(&topic, id)
                    .await
                    .unwrap()
                    .unwrap()
                    .0
                    .sequence
            }
        };
        assert_eq!(seq(&Topic::new("a"), a1).await, 1);
        assert_eq!(seq(&Topic::new("a"), a2).await, 2);
        assert_eq!(seq(&Topic::new("b"), b1).await, 1);
    }
}
