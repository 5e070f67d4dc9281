//! Type-safe identifier newtypes for certherd.
//!
//! These types keep the different identifiers apart at compile time, so a
//! task id can never be passed where a domain key is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a managed domain set.
///
/// The key is the raw discovery label value (for example
/// `"a.example.com,b.example.com"`). Two services carrying the same label
/// value share one key and therefore one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainKey(String);

impl DomainKey {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DomainKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DomainKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique id of one queued acquisition task.
///
/// Generated when a task is first enqueued and kept across its retries, so
/// every log line of one task's attempts can be correlated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new random task ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
