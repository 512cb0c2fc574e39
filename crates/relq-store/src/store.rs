use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StoreError;

// ── Value types ───────────────────────────────────────────────────────────────

/// A stored payload: opaque bytes plus content type.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub etag: String,
}

/// Listing entry for a stored blob.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobInfo {
    pub path: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Opaque handle identifying one in-flight dequeued message; required for
/// `ack` and `extend`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

/// One message dequeued from a FIFO queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub handle: ReceiptHandle,
    pub payload: String,
    /// How many times this message has been handed out, this dequeue
    /// included.
    pub dequeue_count: u32,
}

/// One row read from a table.
#[derive(Debug, Clone)]
pub struct TableRow {
    pub partition: String,
    pub row: String,
    pub value: Value,
    pub etag: String,
}

// ── Backend primitive traits ──────────────────────────────────────────────────

/// Create-or-replace blob container. Engine callers never replace; a blob is
/// immutable for the lifetime of its record.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StoreError>;

    async fn get(&self, path: &str) -> Result<Option<Blob>, StoreError>;

    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<BlobInfo>, StoreError>;
}

/// At-least-once queue with visibility timeouts. Ordering is best-effort;
/// the engine never relies on it.
#[async_trait]
pub trait FifoQueue: Send + Sync + 'static {
    async fn enqueue(
        &self,
        queue: &str,
        payload: &str,
        visibility_delay: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Hand out the next visible message, hiding it for `visibility_timeout`.
    /// A message that is not acked before the timeout becomes visible again.
    async fn dequeue(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, StoreError>;

    async fn ack(&self, queue: &str, handle: &ReceiptHandle) -> Result<(), StoreError>;

    /// Reset the message's visibility deadline to `new_visibility_timeout`
    /// from now. A short timeout releases the message back early.
    async fn extend(
        &self,
        queue: &str,
        handle: &ReceiptHandle,
        new_visibility_timeout: Duration,
    ) -> Result<(), StoreError>;
}

/// Key/value table with per-row optimistic concurrency. This is the only
/// coordination primitive the engine has; every cross-node decision reduces
/// to an etag-conditional write here.
#[async_trait]
pub trait TableStore: Send + Sync + 'static {
    /// Fails with [`StoreError::AlreadyExists`] if the row is present.
    async fn insert(
        &self,
        table: &str,
        partition: &str,
        row: &str,
        value: &Value,
    ) -> Result<String, StoreError>;

    /// Fails with [`StoreError::Conflict`] unless the stored etag matches
    /// `if_etag`.
    async fn replace(
        &self,
        table: &str,
        partition: &str,
        row: &str,
        value: &Value,
        if_etag: &str,
    ) -> Result<String, StoreError>;

    async fn get(
        &self,
        table: &str,
        partition: &str,
        row: &str,
    ) -> Result<Option<(Value, String)>, StoreError>;

    async fn query_partition(
        &self,
        table: &str,
        partition: &str,
    ) -> Result<Vec<TableRow>, StoreError>;

    async fn scan(&self, table: &str) -> Result<Vec<TableRow>, StoreError>;

    /// `if_etag = None` deletes unconditionally.
    async fn delete(
        &self,
        table: &str,
        partition: &str,
        row: &str,
        if_etag: Option<&str>,
    ) -> Result<(), StoreError>;
}
