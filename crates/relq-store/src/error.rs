use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend timeout or throttle; retry with backoff.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Unrecoverable backend failure; surfaced to the caller.
    #[error("permanent backend failure: {0}")]
    Permanent(String),

    /// Etag mismatch on a conditional replace or delete. The caller
    /// re-reads and re-evaluates.
    #[error("concurrency conflict on {entity}")]
    Conflict { entity: String },

    #[error("already exists: {entity}")]
    AlreadyExists { entity: String },

    #[error("not found: {entity}")]
    NotFound { entity: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported storage connection string: {0}")]
    UnsupportedConnectionString(String),
}
