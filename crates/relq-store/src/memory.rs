use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{
    Blob, BlobInfo, BlobStore, FifoQueue, QueueMessage, ReceiptHandle, TableRow, TableStore,
};

fn new_etag() -> String {
    Uuid::new_v4().simple().to_string()
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    content_type: String,
    created_at: DateTime<Utc>,
    etag: String,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    id: String,
    payload: String,
    visible_at: DateTime<Utc>,
    dequeue_count: u32,
}

#[derive(Debug, Clone)]
struct StoredRow {
    value: Value,
    etag: String,
}

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<String, StoredBlob>,
    queues: HashMap<String, Vec<QueueEntry>>,
    tables: HashMap<String, BTreeMap<(String, String), StoredRow>>,
}

/// In-memory implementation of all three backend primitives.
///
/// Data is lost on process exit. Suitable for tests and local runs; cloning
/// shares the underlying state, mirroring how independent clients of a cloud
/// account observe the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBackend {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StoreError> {
        let mut guard = self.inner.write().await;
        let etag = new_etag();
        guard.blobs.insert(
            path.to_string(),
            StoredBlob {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
                created_at: Utc::now(),
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn get(&self, path: &str) -> Result<Option<Blob>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.blobs.get(path).map(|b| Blob {
            bytes: b.bytes.clone(),
            content_type: b.content_type.clone(),
            created_at: b.created_at,
            etag: b.etag.clone(),
        }))
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.blobs.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobInfo>, StoreError> {
        let guard = self.inner.read().await;
        let mut out: Vec<BlobInfo> = guard
            .blobs
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, b)| BlobInfo {
                path: path.clone(),
                size_bytes: b.bytes.len() as u64,
                created_at: b.created_at,
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

#[async_trait]
impl FifoQueue for InMemoryBackend {
    async fn enqueue(
        &self,
        queue: &str,
        payload: &str,
        visibility_delay: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let visible_at = Utc::now() + to_chrono(visibility_delay.unwrap_or_default());
        guard
            .queues
            .entry(queue.to_string())
            .or_default()
            .push(QueueEntry {
                id: new_etag(),
                payload: payload.to_string(),
                visible_at,
                dequeue_count: 0,
            });
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, StoreError> {
        let mut guard = self.inner.write().await;
        let now = Utc::now();
        let Some(entries) = guard.queues.get_mut(queue) else {
            return Ok(None);
        };
        // Insertion order; hidden entries are skipped until their deadline.
        for entry in entries.iter_mut() {
            if entry.visible_at <= now {
                entry.visible_at = now + to_chrono(visibility_timeout);
                entry.dequeue_count += 1;
                return Ok(Some(QueueMessage {
                    handle: ReceiptHandle(entry.id.clone()),
                    payload: entry.payload.clone(),
                    dequeue_count: entry.dequeue_count,
                }));
            }
        }
        Ok(None)
    }

    async fn ack(&self, queue: &str, handle: &ReceiptHandle) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let Some(entries) = guard.queues.get_mut(queue) else {
            return Err(StoreError::NotFound {
                entity: format!("{}/{}", queue, handle.0),
            });
        };
        let before = entries.len();
        entries.retain(|e| e.id != handle.0);
        if entries.len() == before {
            return Err(StoreError::NotFound {
                entity: format!("{}/{}", queue, handle.0),
            });
        }
        Ok(())
    }

    async fn extend(
        &self,
        queue: &str,
        handle: &ReceiptHandle,
        new_visibility_timeout: Duration,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let entry = guard
            .queues
            .get_mut(queue)
            .and_then(|entries| entries.iter_mut().find(|e| e.id == handle.0))
            .ok_or_else(|| StoreError::NotFound {
                entity: format!("{}/{}", queue, handle.0),
            })?;
        entry.visible_at = Utc::now() + to_chrono(new_visibility_timeout);
        Ok(())
    }
}

#[async_trait]
impl TableStore for InMemoryBackend {
    async fn insert(
        &self,
        table: &str,
        partition: &str,
        row: &str,
        value: &Value,
    ) -> Result<String, StoreError> {
        let mut guard = self.inner.write().await;
        let rows = guard.tables.entry(table.to_string()).or_default();
        let key = (partition.to_string(), row.to_string());
        if rows.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                entity: format!("{}/{}/{}", table, partition, row),
            });
        }
        let etag = new_etag();
        rows.insert(
            key,
            StoredRow {
                value: value.clone(),
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn replace(
        &self,
        table: &str,
        partition: &str,
        row: &str,
        value: &Value,
        if_etag: &str,
    ) -> Result<String, StoreError> {
        let mut guard = self.inner.write().await;
        let entity = format!("{}/{}/{}", table, partition, row);
        let stored = guard
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&(partition.to_string(), row.to_string())))
            .ok_or_else(|| StoreError::NotFound {
                entity: entity.clone(),
            })?;
        if stored.etag != if_etag {
            return Err(StoreError::Conflict { entity });
        }
        let etag = new_etag();
        stored.value = value.clone();
        stored.etag = etag.clone();
        Ok(etag)
    }

    async fn get(
        &self,
        table: &str,
        partition: &str,
        row: &str,
    ) -> Result<Option<(Value, String)>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .tables
            .get(table)
            .and_then(|rows| rows.get(&(partition.to_string(), row.to_string())))
            .map(|r| (r.value.clone(), r.etag.clone())))
    }

    async fn query_partition(
        &self,
        table: &str,
        partition: &str,
    ) -> Result<Vec<TableRow>, StoreError> {
        let guard = self.inner.read().await;
        let Some(rows) = guard.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|((p, _), _)| p == partition)
            .map(|((p, r), stored)| TableRow {
                partition: p.clone(),
                row: r.clone(),
                value: stored.value.clone(),
                etag: stored.etag.clone(),
            })
            .collect())
    }

    async fn scan(&self, table: &str) -> Result<Vec<TableRow>, StoreError> {
        let guard = self.inner.read().await;
        let Some(rows) = guard.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .map(|((p, r), stored)| TableRow {
                partition: p.clone(),
                row: r.clone(),
                value: stored.value.clone(),
                etag: stored.etag.clone(),
            })
            .collect())
    }

    async fn delete(
        &self,
        table: &str,
        partition: &str,
        row: &str,
        if_etag: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let entity = format!("{}/{}/{}", table, partition, row);
        let Some(rows) = guard.tables.get_mut(table) else {
            return Err(StoreError::NotFound { entity });
        };
        let key = (partition.to_string(), row.to_string());
        match rows.get(&key) {
            None => return Err(StoreError::NotFound { entity }),
            Some(stored) => {
                if let Some(expected) = if_etag {
                    if stored.etag != expected {
                        return Err(StoreError::Conflict { entity });
                    }
                }
            }
        }
        rows.remove(&key);
        Ok(())
    }
}
