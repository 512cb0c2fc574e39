use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use relq_domain::{EndpointId, QueueKey};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawConfig, RawQueueSettings};
use crate::settings::{Config, Mode, QueueSettings};

/// Load the root configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    from_yaml_str(&content)
}

/// Parse the root configuration from a YAML string.
pub fn from_yaml_str(content: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(content)?;
    convert_config(raw)
}

fn convert_config(raw: RawConfig) -> Result<Config, ConfigError> {
    let mut queues = HashMap::new();
    for (name, raw_settings) in raw.queues {
        let key = QueueKey::new(name.as_str())?;
        debug!(queue = %key, "loading queue settings");
        queues.insert(key, convert_settings(raw_settings)?);
    }
    Ok(Config {
        endpoint_id: raw.endpoint_id.map(EndpointId::new),
        queues,
    })
}

fn convert_settings(raw: RawQueueSettings) -> Result<QueueSettings, ConfigError> {
    Ok(QueueSettings {
        enabled: raw.enabled,
        create_listener: raw.create_listener,
        mode: parse_mode(&raw.mode)?,
        storage: raw.storage,
        default_timeout: Duration::from_secs(raw.default_timeout_secs),
        max_attempts: raw.max_attempts,
        message_ttl: Duration::from_secs(raw.message_ttl_secs),
        sliding_window: Duration::from_secs(raw.sliding_window_secs),
        topic_affinity_ttl: Duration::from_secs(raw.topic_affinity_ttl_secs),
        max_payload_bytes: raw.max_payload_bytes,
        janitor_interval: Duration::from_secs(raw.janitor_interval_secs),
        notify_orphan_after: Duration::from_secs(raw.notify_orphan_after_secs),
        blob_orphan_grace: Duration::from_secs(raw.blob_orphan_grace_secs),
        receive_concurrency: raw.receive_concurrency.max(1),
    })
}

fn parse_mode(s: &str) -> Result<Mode, ConfigError> {
    match s {
        "send" => Ok(Mode::Send),
        "receive" => Ok(Mode::Receive),
        "both" => Ok(Mode::Both),
        other => Err(ConfigError::UnknownMode(other.to_string())),
    }
}
