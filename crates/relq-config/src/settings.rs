use std::collections::HashMap;
use std::time::Duration;

use relq_domain::{EndpointId, QueueKey};

// ── Mode ──────────────────────────────────────────────────────────────────────

/// Which halves of the queue API a service instance exposes for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Send,
    Receive,
    Both,
}

impl Mode {
    pub fn permits_send(&self) -> bool {
        matches!(self, Mode::Send | Mode::Both)
    }

    pub fn permits_receive(&self) -> bool {
        matches!(self, Mode::Receive | Mode::Both)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Send => write!(f, "send"),
            Mode::Receive => write!(f, "receive"),
            Mode::Both => write!(f, "both"),
        }
    }
}

// ── Per-queue settings ────────────────────────────────────────────────────────

/// Settings for one queue. Defaults match [`QueueSettings::new`].
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// If false the queue is inert: every operation is refused.
    pub enabled: bool,
    /// If true the service runs the pull-loop receiver for this queue;
    /// otherwise messages arrive only through the external push path.
    pub create_listener: bool,
    pub mode: Mode,
    /// Backend connection string. Absent means the queue cannot touch
    /// storage on this instance.
    pub storage: Option<String>,
    /// Default per-call timeout; also the lease/visibility duration.
    pub default_timeout: Duration,
    /// Delivery attempts before a message is quarantined as poison.
    pub max_attempts: u32,
    /// Record lifetime in non-terminal states.
    pub message_ttl: Duration,
    /// Maximum wait for a missing earlier sequence before the ordering
    /// engine declares a gap.
    pub sliding_window: Duration,
    /// How long the endpoint that last delivered on a topic is preferred.
    pub topic_affinity_ttl: Duration,
    pub max_payload_bytes: u64,
    pub janitor_interval: Duration,
    /// Age at which a still-queued record gets its notification re-enqueued.
    pub notify_orphan_after: Duration,
    /// Grace period before a blob without a live record is deleted.
    pub blob_orphan_grace: Duration,
    /// Pull workers per queue.
    pub receive_concurrency: usize,
}

impl QueueSettings {
    pub fn new(mode: Mode) -> Self {
        QueueSettings {
            enabled: true,
            create_listener: false,
            mode,
            storage: None,
            default_timeout: Duration::from_secs(30),
            max_attempts: 3,
            message_ttl: Duration::from_secs(172_800),
            sliding_window: Duration::from_secs(1),
            topic_affinity_ttl: Duration::from_secs(30),
            max_payload_bytes: 64 * 1024 * 1024,
            janitor_interval: Duration::from_secs(30),
            notify_orphan_after: Duration::from_secs(120),
            blob_orphan_grace: Duration::from_secs(300),
            receive_concurrency: 1,
        }
    }
}

// ── Root configuration ────────────────────────────────────────────────────────

/// Root configuration: a mapping from queue display-name to per-queue
/// settings, plus the optional stable endpoint identity of this instance.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub endpoint_id: Option<EndpointId>,
    pub queues: HashMap<QueueKey, QueueSettings>,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn with_queue(mut self, key: QueueKey, settings: QueueSettings) -> Self {
        self.queues.insert(key, settings);
        self
    }
}
