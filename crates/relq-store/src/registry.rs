use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::StoreError;
use crate::memory::InMemoryBackend;
use crate::store::{BlobStore, FifoQueue, TableStore};

/// The three backend primitives behind one connection string.
#[derive(Clone)]
pub struct Backend {
    pub blobs: Arc<dyn BlobStore>,
    pub fifo: Arc<dyn FifoQueue>,
    pub tables: Arc<dyn TableStore>,
}

impl Backend {
    pub fn from_memory(backend: InMemoryBackend) -> Self {
        Backend {
            blobs: Arc::new(backend.clone()),
            fifo: Arc::new(backend.clone()),
            tables: Arc::new(backend),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

static MEMORY_BACKENDS: OnceLock<Mutex<HashMap<String, InMemoryBackend>>> = OnceLock::new();

/// Resolve a connection string to a backend.
///
/// `memory://<name>` returns a process-wide shared in-memory backend keyed
/// by name, so independent service instances configured with the same
/// connection string observe the same durable state, the way separate
/// clients of one storage account would.
pub fn connect(connection_string: &str) -> Result<Backend, StoreError> {
    if let Some(name) = connection_string.strip_prefix("memory://") {
        let registry = MEMORY_BACKENDS.get_or_init(Mutex::default);
        let mut guard = registry.lock().unwrap_or_else(|e| e.into_inner());
        let backend = guard
            .entry(name.to_string())
            .or_insert_with(InMemoryBackend::new)
            .clone();
        return Ok(Backend::from_memory(backend));
    }
    Err(StoreError::UnsupportedConnectionString(
        connection_string.to_string(),
    ))
}
