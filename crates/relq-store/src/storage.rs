use std::time::Duration;

use relq_domain::{MessageId, MessageRecord, Notification, QueueKey, Topic, TopicAffinityRecord};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::registry::Backend;
use crate::schema::{QueueResources, AFFINITY_ROW_KEY, SEQUENCE_ROW_KEY};
use crate::store::{Blob, BlobInfo, QueueMessage, ReceiptHandle};

/// Per-topic sequence counter row. Holds the next sequence to hand out.
#[derive(Debug, Serialize, Deserialize)]
struct SequenceCounter {
    next: i64,
}

/// Typed access to one queue's backend resources.
///
/// Concentrates all knowledge of the storage schema: which table a row
/// lives in, how rows serialize, and how blob paths are formed. The engine
/// above deals only in domain types.
#[derive(Clone)]
pub struct Storage {
    backend: Backend,
    resources: QueueResources,
}

impl Storage {
    pub fn new(backend: Backend, key: &QueueKey) -> Self {
        Storage {
            resources: QueueResources::for_queue(key),
            backend,
        }
    }

    pub fn resources(&self) -> &QueueResources {
        &self.resources
    }

    // ── Message bodies ────────────────────────────────────────────────────

    /// Blob path for a message body: `<container>/<message-id>`.
    pub fn body_blob_path(&self, message_id: MessageId) -> String {
        format!("{}/{}", self.resources.container, message_id)
    }

    pub fn message_id_from_body_path(&self, path: &str) -> Option<MessageId> {
        let name = path.strip_prefix(&format!("{}/", self.resources.container))?;
        Uuid::parse_str(name).ok()
    }

    pub async fn put_body(
        &self,
        message_id: MessageId,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StoreError> {
        self.backend
            .blobs
            .put(&self.body_blob_path(message_id), bytes, content_type)
            .await
    }

    pub async fn get_body(&self, path: &str) -> Result<Option<Blob>, StoreError> {
        self.backend.blobs.get(path).await
    }

    pub async fn delete_body(&self, path: &str) -> Result<(), StoreError> {
        self.backend.blobs.delete(path).await
    }

    pub async fn list_bodies(&self) -> Result<Vec<BlobInfo>, StoreError> {
        self.backend
            .blobs
            .list(&format!("{}/", self.resources.container))
            .await
    }

    // ── Message records ───────────────────────────────────────────────────

    pub async fn insert_record(&self, record: &MessageRecord) -> Result<String, StoreError> {
        let value = serde_json::to_value(record)?;
        self.backend
            .tables
            .insert(
                &self.resources.state_table,
                record.topic.identifier(),
                &record.row_key(),
                &value,
            )
            .await
    }

    pub async fn replace_record(
        &self,
        record: &MessageRecord,
        if_etag: &str,
    ) -> Result<String, StoreError> {
        let value = serde_json::to_value(record)?;
        self.backend
            .tables
            .replace(
                &self.resources.state_table,
                record.topic.identifier(),
                &record.row_key(),
                &value,
                if_etag,
            )
            .await
    }

    pub async fn read_record(
        &self,
        topic: &Topic,
        message_id: MessageId,
    ) -> Result<Option<(MessageRecord, String)>, StoreError> {
        let row = self
            .backend
            .tables
            .get(
                &self.resources.state_table,
                topic.identifier(),
                &message_id.to_string(),
            )
            .await?;
        match row {
            None => Ok(None),
            Some((value, etag)) => Ok(Some((serde_json::from_value(value)?, etag))),
        }
    }

    pub async fn delete_record(
        &self,
        topic: &Topic,
        message_id: MessageId,
        if_etag: Option<&str>,
    ) -> Result<(), StoreError> {
        self.backend
            .tables
            .delete(
                &self.resources.state_table,
                topic.identifier(),
                &message_id.to_string(),
                if_etag,
            )
            .await
    }

    pub async fn query_topic_records(
        &self,
        topic: &Topic,
    ) -> Result<Vec<(MessageRecord, String)>, StoreError> {
        let rows = self
            .backend
            .tables
            .query_partition(&self.resources.state_table, topic.identifier())
            .await?;
        Ok(Self::parse_record_rows(rows))
    }

    pub async fn scan_records(&self) -> Result<Vec<(MessageRecord, String)>, StoreError> {
        let rows = self
            .backend
            .tables
            .scan(&self.resources.state_table)
            .await?;
        Ok(Self::parse_record_rows(rows))
    }

    fn parse_record_rows(rows: Vec<crate::store::TableRow>) -> Vec<(MessageRecord, String)> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<MessageRecord>(row.value) {
                Ok(record) => out.push((record, row.etag)),
                Err(err) => {
                    warn!(
                        partition = %row.partition,
                        row = %row.row,
                        error = %err,
                        "skipping unparsable message record row"
                    );
                }
            }
        }
        out
    }

    // ── Sequence counter ──────────────────────────────────────────────────

    /// Atomically obtain the next sequence for (queue, topic) via a
    /// conditional-replace loop on the dedicated counter row. Sequences
    /// start at 1; a crash between this call and the record insert leaves a
    /// gap, which the ordering engine tolerates.
    pub async fn next_sequence(&self, topic: &Topic) -> Result<i64, StoreError> {
        loop {
            let existing = self
                .backend
                .tables
                .get(
                    &self.resources.topic_table,
                    topic.identifier(),
                    SEQUENCE_ROW_KEY,
                )
                .await?;
            match existing {
                None => {
                    let value = serde_json::to_value(SequenceCounter { next: 2 })?;
                    match self
                        .backend
                        .tables
                        .insert(
                            &self.resources.topic_table,
                            topic.identifier(),
                            SEQUENCE_ROW_KEY,
                            &value,
                        )
                        .await
                    {
                        Ok(_) => return Ok(1),
                        Err(StoreError::AlreadyExists { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Some((value, etag)) => {
                    let counter: SequenceCounter = serde_json::from_value(value)?;
                    let updated = serde_json::to_value(SequenceCounter {
                        next: counter.next + 1,
                    })?;
                    match self
                        .backend
                        .tables
                        .replace(
                            &self.resources.topic_table,
                            topic.identifier(),
                            SEQUENCE_ROW_KEY,
                            &updated,
                            &etag,
                        )
                        .await
                    {
                        Ok(_) => return Ok(counter.next),
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    // ── Topic affinity ────────────────────────────────────────────────────

    pub async fn read_affinity(
        &self,
        topic: &Topic,
    ) -> Result<Option<(TopicAffinityRecord, String)>, StoreError> {
        let row = self
            .backend
            .tables
            .get(
                &self.resources.topic_table,
                topic.identifier(),
                AFFINITY_ROW_KEY,
            )
            .await?;
        match row {
            None => Ok(None),
            Some((value, etag)) => Ok(Some((serde_json::from_value(value)?, etag))),
        }
    }

    /// Upsert the affinity row. Affinity is advisory, so a lost race is
    /// resolved by taking the other writer's etag and trying once more.
    pub async fn write_affinity(
        &self,
        topic: &Topic,
        record: &TopicAffinityRecord,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)?;
        loop {
            let existing = self
                .backend
                .tables
                .get(
                    &self.resources.topic_table,
                    topic.identifier(),
                    AFFINITY_ROW_KEY,
                )
                .await?;
            match existing {
                None => match self
                    .backend
                    .tables
                    .insert(
                        &self.resources.topic_table,
                        topic.identifier(),
                        AFFINITY_ROW_KEY,
                        &value,
                    )
                    .await
                {
                    Ok(_) => return Ok(()),
                    Err(StoreError::AlreadyExists { .. }) => continue,
                    Err(e) => return Err(e),
                },
                Some((_, etag)) => match self
                    .backend
                    .tables
                    .replace(
                        &self.resources.topic_table,
                        topic.identifier(),
                        AFFINITY_ROW_KEY,
                        &value,
                        &etag,
                    )
                    .await
                {
                    Ok(_) => return Ok(()),
                    Err(StoreError::Conflict { .. }) => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }

    /// All affinity rows with their partition identifier and etag, for the
    /// janitor's expiry sweep.
    pub async fn scan_affinities(
        &self,
    ) -> Result<Vec<(String, TopicAffinityRecord, String)>, StoreError> {
        let rows = self
            .backend
            .tables
            .scan(&self.resources.topic_table)
            .await?;
        let mut out = Vec::new();
        for row in rows {
            if row.row != AFFINITY_ROW_KEY {
                continue;
            }
            match serde_json::from_value::<TopicAffinityRecord>(row.value) {
                Ok(record) => out.push((row.partition, record, row.etag)),
                Err(err) => {
                    warn!(partition = %row.partition, error = %err, "skipping unparsable affinity row");
                }
            }
        }
        Ok(out)
    }

    pub async fn delete_affinity_row(
        &self,
        partition: &str,
        if_etag: &str,
    ) -> Result<(), StoreError> {
        self.backend
            .tables
            .delete(
                &self.resources.topic_table,
                partition,
                AFFINITY_ROW_KEY,
                Some(if_etag),
            )
            .await
    }

    // ── Notifications ─────────────────────────────────────────────────────

    pub async fn enqueue_notification(
        &self,
        notification: &Notification,
        visibility_delay: Option<Duration>,
    ) -> Result<(), StoreError> {
        let payload = notification.to_json()?;
        self.backend
            .fifo
            .enqueue(&self.resources.fifo_queue, &payload, visibility_delay)
            .await
    }

    pub async fn dequeue_notification(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, StoreError> {
        self.backend
            .fifo
            .dequeue(&self.resources.fifo_queue, visibility_timeout)
            .await
    }

    pub async fn ack_notification(&self, handle: &ReceiptHandle) -> Result<(), StoreError> {
        self.backend
            .fifo
            .ack(&self.resources.fifo_queue, handle)
            .await
    }

    pub async fn extend_notification(
        &self,
        handle: &ReceiptHandle,
        new_visibility_timeout: Duration,
    ) -> Result<(), StoreError> {
        self.backend
            .fifo
            .extend(&self.resources.fifo_queue, handle, new_visibility_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use chrono::Utc;
    use std::collections::HashMap;

    fn storage(name: &str) -> Storage {
        let _ = name;
        let backend = Backend::from_memory(InMemoryBackend::new());
        Storage::new(backend, &QueueKey::new("TEST+1").unwrap())
    }

    fn sample_record(storage: &Storage, sequence: i64) -> MessageRecord {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut record = MessageRecord::new(
            id,
            QueueKey::new("TEST+1").unwrap(),
            Topic::new("t"),
            sequence,
            storage.body_blob_path(id),
            5,
            "text/plain".to_string(),
            HashMap::new(),
            now,
            chrono::Duration::seconds(300),
        );
        record.state = relq_domain::MessageState::Queued;
        record
    }

    #[tokio::test]
    async fn record_round_trip() {
        let storage = storage("records");
        let record = sample_record(&storage, 1);
        let etag = storage.insert_record(&record).await.unwrap();

        let (read, read_etag) = storage
            .read_record(&record.topic, record.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, record);
        assert_eq!(read_etag, etag);

        let mut updated = read;
        updated.attempts = 1;
        let etag2 = storage.replace_record(&updated, &etag).await.unwrap();
        assert_ne!(etag, etag2);

        let err = storage.replace_record(&updated, &etag).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn sequences_are_dense_from_one() {
        let storage = storage("seq");
        let topic = Topic::new("t");
        for expected in 1..=5 {
            assert_eq!(storage.next_sequence(&topic).await.unwrap(), expected);
        }
        // Independent per topic.
        assert_eq!(storage.next_sequence(&Topic::new("u")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_sequences_never_collide() {
        let storage = storage("seq-concurrent");
        let topic = Topic::new("t");
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let storage = storage.clone();
            let topic = topic.clone();
            tasks.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..5 {
                    got.push(storage.next_sequence(&topic).await.unwrap());
                }
                got
            }));
        }
        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort_unstable();
        let expected: Vec<i64> = (1..=20).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn affinity_upsert_and_scan() {
        let storage = storage("affinity");
        let topic = Topic::new("t");
        assert!(storage.read_affinity(&topic).await.unwrap().is_none());

        let now = Utc::now();
        let record = TopicAffinityRecord {
            last_owner_endpoint_id: relq_domain::EndpointId::new("node-a"),
            last_activity_at: now,
            expires_at: now + chrono::Duration::seconds(30),
        };
        storage.write_affinity(&topic, &record).await.unwrap();
        let (read, _) = storage.read_affinity(&topic).await.unwrap().unwrap();
        assert_eq!(read, record);

        // Overwrite through the upsert path.
        let refreshed = TopicAffinityRecord {
            last_owner_endpoint_id: relq_domain::EndpointId::new("node-b"),
            ..record
        };
        storage.write_affinity(&topic, &refreshed).await.unwrap();

        let scanned = storage.scan_affinities().await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].0, topic.identifier());
        assert_eq!(scanned[0].1.last_owner_endpoint_id.as_str(), "node-b");
    }

    #[tokio::test]
    async fn body_paths_parse_back() {
        let storage = storage("paths");
        let id = Uuid::new_v4();
        let path = storage.body_blob_path(id);
        assert!(path.starts_with("reliable-queue-body-test-1/"));
        assert_eq!(storage.message_id_from_body_path(&path), Some(id));
        assert_eq!(storage.message_id_from_body_path("elsewhere/foo"), None);
    }

    #[tokio::test]
    async fn notification_queue_round_trip() {
        let storage = storage("notify");
        let record = sample_record(&storage, 3);
        let n = Notification::for_record(&record);
        storage.enqueue_notification(&n, None).await.unwrap();

        let msg = storage
            .dequeue_notification(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let parsed = Notification::from_json(&msg.payload).unwrap();
        assert_eq!(parsed, n);
        storage.ack_notification(&msg.handle).await.unwrap();
    }
}
