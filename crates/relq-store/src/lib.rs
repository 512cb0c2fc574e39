pub mod error;
pub mod memory;
pub mod registry;
pub mod schema;
pub mod storage;
pub mod store;

pub use error::StoreError;
pub use memory::InMemoryBackend;
pub use registry::{connect, Backend};
pub use schema::{QueueResources, AFFINITY_ROW_KEY, SEQUENCE_ROW_KEY};
pub use storage::Storage;
pub use store::{
    Blob, BlobInfo, BlobStore, FifoQueue, QueueMessage, ReceiptHandle, TableRow, TableStore,
};
