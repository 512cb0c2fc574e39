pub mod backoff;
pub mod error;
pub mod handler;
pub mod janitor;
pub mod ordering;
pub mod poison;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod service;

pub use error::EngineError;
pub use handler::{Delivery, MessageHandler, Subscription};
pub use ordering::{Admission, OrderingEngine};
pub use queue::QueueClient;
pub use sender::SendOptions;
pub use service::ReliableQueueService;
