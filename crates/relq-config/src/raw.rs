use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Raw YAML representation of the root config file.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawConfig {
    /// Stable endpoint name for leases and topic affinity; generated when
    /// absent.
    pub endpoint_id: Option<String>,
    #[serde(default)]
    pub queues: HashMap<String, RawQueueSettings>,
}

/// Raw YAML representation of one queue's settings.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawQueueSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub create_listener: bool,
    /// "send", "receive", or "both".
    pub mode: String,
    pub storage: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    #[serde(default = "default_sliding_window_secs")]
    pub sliding_window_secs: u64,
    #[serde(default = "default_topic_affinity_ttl_secs")]
    pub topic_affinity_ttl_secs: u64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,
    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,
    #[serde(default = "default_notify_orphan_after_secs")]
    pub notify_orphan_after_secs: u64,
    #[serde(default = "default_blob_orphan_grace_secs")]
    pub blob_orphan_grace_secs: u64,
    #[serde(default = "default_receive_concurrency")]
    pub receive_concurrency: usize,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_message_ttl_secs() -> u64 {
    172_800
}

fn default_sliding_window_secs() -> u64 {
    1
}

fn default_topic_affinity_ttl_secs() -> u64 {
    30
}

fn default_max_payload_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_janitor_interval_secs() -> u64 {
    30
}

fn default_notify_orphan_after_secs() -> u64 {
    120
}

fn default_blob_orphan_grace_secs() -> u64 {
    300
}

fn default_receive_concurrency() -> usize {
    1
}
