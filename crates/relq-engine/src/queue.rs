use std::sync::Arc;

use relq_config::QueueSettings;
use relq_domain::{EndpointId, QueueKey};
use relq_store::{connect, Storage};

use crate::error::EngineError;
use crate::handler::{MessageHandler, SubscriberSet, Subscription};
use crate::ordering::OrderingEngine;

pub(crate) fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

struct ClientShared {
    key: QueueKey,
    settings: QueueSettings,
    endpoint: EndpointId,
    storage: Option<Storage>,
    ordering: OrderingEngine,
    subscribers: SubscriberSet,
}

/// Per-queue façade: send, subscribe and the push-receive path, plus the
/// worker loops the service spawns. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueueClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("key", &self.shared.key)
            .finish_non_exhaustive()
    }
}

impl QueueClient {
    pub(crate) fn new(
        key: QueueKey,
        settings: QueueSettings,
        endpoint: EndpointId,
    ) -> Result<Self, EngineError> {
        let storage = match &settings.storage {
            Some(connection_string) => Some(Storage::new(connect(connection_string)?, &key)),
            None => None,
        };
        let ordering = OrderingEngine::new(settings.sliding_window);
        Ok(QueueClient {
            shared: Arc::new(ClientShared {
                key,
                settings,
                endpoint,
                storage,
                ordering,
                subscribers: SubscriberSet::default(),
            }),
        })
    }

    pub fn key(&self) -> &QueueKey {
        &self.shared.key
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.shared.settings
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.shared.endpoint
    }

    pub(crate) fn ordering(&self) -> &OrderingEngine {
        &self.shared.ordering
    }

    pub(crate) fn storage(&self) -> Result<&Storage, EngineError> {
        self.shared
            .storage
            .as_ref()
            .ok_or_else(|| EngineError::MissingConnectionString(self.shared.key.clone()))
    }

    pub(crate) fn has_storage(&self) -> bool {
        self.shared.storage.is_some()
    }

    pub(crate) fn ensure_enabled(&self) -> Result<(), EngineError> {
        if self.shared.settings.enabled {
            Ok(())
        } else {
            Err(EngineError::QueueDisabled(self.shared.key.clone()))
        }
    }

    /// Attach a handler. The returned guard detaches it when dropped.
    pub fn subscribe<H: MessageHandler>(&self, handler: H) -> Result<Subscription, EngineError> {
        self.ensure_enabled()?;
        if !self.shared.settings.mode.permits_receive() {
            return Err(EngineError::ModeDoesNotPermitReceive {
                queue: self.shared.key.clone(),
                mode: self.shared.settings.mode,
            });
        }
        Ok(self.shared.subscribers.add(Arc::new(handler)))
    }

    pub(crate) fn subscribers_snapshot(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.shared.subscribers.snapshot()
    }
}
