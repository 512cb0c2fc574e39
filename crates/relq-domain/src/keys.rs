use std::fmt;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ── Canonicalization ──────────────────────────────────────────────────────────

/// DNS-safe canonical form: lower-cased, every run of characters outside
/// `[a-z0-9]` collapsed to a single `-`. Used for blob-container and queue
/// names. Deterministic, idempotent, lossy.
pub fn canonical_identifier(display: &str) -> String {
    let mut out = String::with_capacity(display.len());
    let mut in_separator = false;
    for c in display.chars() {
        if c.is_ascii_alphanumeric() {
            if in_separator {
                out.push('-');
                in_separator = false;
            }
            out.push(c.to_ascii_lowercase());
        } else {
            in_separator = true;
        }
    }
    if in_separator {
        out.push('-');
    }
    out
}

/// Table-safe canonical form: every separator run becomes a single `x` and
/// each alphanumeric segment is title-cased, so `"TEST+NAME+1"` becomes
/// `"TestxNamex1"`. Table names disallow hyphens, hence the different
/// separator. Existing stored data is addressed by this form; the mangling
/// must not change.
pub fn canonical_table_identifier(display: &str) -> String {
    let mut out = String::with_capacity(display.len());
    let mut in_separator = false;
    let mut segment_start = true;
    for c in display.chars() {
        if c.is_ascii_alphanumeric() {
            if in_separator {
                out.push('x');
                in_separator = false;
                segment_start = true;
            }
            if segment_start {
                out.push(c.to_ascii_uppercase());
                segment_start = false;
            } else {
                out.push(c.to_ascii_lowercase());
            }
        } else {
            in_separator = true;
            segment_start = true;
        }
    }
    if in_separator {
        out.push('x');
    }
    out
}

// ── QueueKey ──────────────────────────────────────────────────────────────────

/// Stable identifier for a logical queue.
///
/// Carries the verbatim `display` string plus the two derived canonical
/// forms. Equality, ordering and hashing are by `display` (ordinal); the
/// derived fields are pure functions of it, so the derived impls agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    display: String,
    identifier: String,
    table_identifier: String,
}

impl QueueKey {
    /// Construct from a display string. Rejects empty or all-whitespace
    /// input.
    pub fn new(display: impl Into<String>) -> Result<Self, DomainError> {
        let display = display.into();
        if display.trim().is_empty() {
            return Err(DomainError::InvalidQueueKey(display));
        }
        let identifier = canonical_identifier(&display);
        let table_identifier = canonical_table_identifier(&display);
        Ok(QueueKey {
            display,
            identifier,
            table_identifier,
        })
    }

    /// The verbatim display form, preserved for diagnostics and equality.
    pub fn display(&self) -> &str {
        &self.display
    }

    /// DNS-safe form used for blob-container and queue names.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Table-safe form used for table names.
    pub fn table_identifier(&self) -> &str {
        &self.table_identifier
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display)
    }
}

impl Serialize for QueueKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.display)
    }
}

impl<'de> Deserialize<'de> for QueueKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let display = String::deserialize(deserializer)?;
        QueueKey::new(display).map_err(serde::de::Error::custom)
    }
}

// ── Topic ─────────────────────────────────────────────────────────────────────

/// Display form of the sentinel default topic.
pub const DEFAULT_TOPIC_DISPLAY: &str = "Default";

/// Fixed table-partition identifier of the sentinel default topic.
pub const DEFAULT_TOPIC_IDENTIFIER: &str = "_default";

/// Ordering partition within a queue.
///
/// Unlike [`QueueKey`], empty or whitespace input is legal and resolves to
/// the sentinel default topic. The default topic serializes as JSON `null`
/// and reads back as itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    display: String,
    identifier: String,
}

impl Topic {
    pub fn new(display: impl AsRef<str>) -> Self {
        let display = display.as_ref();
        if display.trim().is_empty() || display == DEFAULT_TOPIC_DISPLAY {
            return Topic::default();
        }
        Topic {
            display: display.to_string(),
            identifier: canonical_identifier(display),
        }
    }

    pub fn from_option(display: Option<&str>) -> Self {
        match display {
            Some(s) => Topic::new(s),
            None => Topic::default(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.identifier == DEFAULT_TOPIC_IDENTIFIER
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    /// Table-partition identifier; `_default` for the sentinel topic.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl Default for Topic {
    fn default() -> Self {
        Topic {
            display: DEFAULT_TOPIC_DISPLAY.to_string(),
            identifier: DEFAULT_TOPIC_IDENTIFIER.to_string(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display)
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_default() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&self.display)
        }
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let display = Option::<String>::deserialize(deserializer)?;
        Ok(Topic::from_option(display.as_deref()))
    }
}
