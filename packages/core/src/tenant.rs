//! Tenant (account) identity and per-tenant statistics.

use serde::{Deserialize, Serialize};

/// Delimiter reserved for composite `(tenant, job)` keys.
pub const KEY_DELIMITER: char = '\u{1f}';

/// Identifier of an isolated queue owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TenantIdError {
    #[error("tenant id must not be empty")]
    Empty,

    #[error("tenant id must not contain control characters: {0:?}")]
    InvalidCharacter(String),
}

impl TenantId {
    /// Validate and wrap a tenant identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, TenantIdError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(TenantIdError::Empty);
        }
        if trimmed.chars().any(|c| c == KEY_DELIMITER || c.is_control()) {
            return Err(TenantIdError::InvalidCharacter(id));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = TenantIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl std::str::FromStr for TenantId {
    type Err = TenantIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live statistics for one tenant worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantStats {
    pub concurrency_limit: usize,
    /// Jobs currently executing. Never exceeds `concurrency_limit`.
    pub active: usize,
    /// Highest `active` value observed.
    pub peak_active: usize,
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub terminated: u64,
    /// True once the worker stopped claiming new work.
    pub draining: bool,
}

impl TenantStats {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit,
            ..Default::default()
        }
    }

    /// Total executions that reached a terminal status.
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.terminated
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.finished();
        if total == 0 {
            None
        } else {
            Some((self.succeeded as f64 / total as f64) * 100.0)
        }
    }
}

/// Job counts by status as reported by the broker for one tenant queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    /// Jobs not yet acknowledged.
    pub fn outstanding(&self) -> u64 {
        self.waiting + self.active
    }
}
