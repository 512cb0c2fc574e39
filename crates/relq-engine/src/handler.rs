use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use relq_domain::{MessageId, QueueKey, Topic};

// ── Delivery ──────────────────────────────────────────────────────────────────

/// One message handed to a handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: QueueKey,
    pub topic: Topic,
    pub message_id: MessageId,
    /// Delivery attempts so far, this one included.
    pub attempts: u32,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
    body: Vec<u8>,
}

impl Delivery {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: QueueKey,
        topic: Topic,
        message_id: MessageId,
        attempts: u32,
        content_type: String,
        metadata: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Delivery {
            queue,
            topic,
            message_id,
            attempts,
            content_type,
            metadata,
            body,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_utf8(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }
}

// ── MessageHandler ────────────────────────────────────────────────────────────

/// Consumer callback. `Ok(true)` marks the message handled; `Ok(false)` and
/// `Err(_)` count as a failed attempt and route through retry/poison.
///
/// Handlers may run more than once for the same message across failures;
/// the engine promises at most one successful transition to `Delivered`.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<bool>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<bool> {
        (self)(delivery).await
    }
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct SubscriberInner {
    next_id: u64,
    handlers: BTreeMap<u64, Arc<dyn MessageHandler>>,
}

/// The handlers attached to one queue. Lock held only to copy the handler
/// list; never across handler invocation.
#[derive(Clone, Default)]
pub(crate) struct SubscriberSet {
    inner: Arc<RwLock<SubscriberInner>>,
}

impl SubscriberSet {
    pub fn add(&self, handler: Arc<dyn MessageHandler>) -> Subscription {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let id = guard.next_id;
        guard.next_id += 1;
        guard.handlers.insert(id, handler);
        Subscription {
            id,
            set: Arc::downgrade(&self.inner),
        }
    }

    /// Handlers in subscription order.
    pub fn snapshot(&self) -> Vec<Arc<dyn MessageHandler>> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.handlers.values().cloned().collect()
    }
}

/// Guard for one attached handler; dropping it (or calling
/// [`Subscription::unsubscribe`]) detaches the handler.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    set: Weak<RwLock<SubscriberInner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.set.upgrade() {
            let mut guard = inner.write().unwrap_or_else(|e| e.into_inner());
            guard.handlers.remove(&self.id);
        }
    }
}
