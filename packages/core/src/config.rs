//! Runtime configuration for the dispatch system.

use std::path::PathBuf;
use std::time::Duration;

use crate::TenantId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}={value} ({expected})")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Configuration shared by workers, supervisors and the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Program and leading arguments placed before the script reference.
    pub interpreter: Vec<String>,
    /// Jobs a single tenant may run at once.
    pub concurrency_limit: usize,
    /// How long a cancelled process may take to exit before it is killed.
    pub cancel_grace: Duration,
    /// Bytes of stderr kept as the failure reason.
    pub failure_reason_limit: usize,
    /// Bytes of stderr buffered per job for diagnostics.
    pub stderr_capture_limit: usize,
    /// Deliveries per job before the broker gives up on runtime failures.
    pub max_attempts: u32,
    /// Capacity of the broadcast channel carrying job events.
    pub event_capacity: usize,
    /// Directory for the persisted tenant roster.
    pub state_dir: Option<PathBuf>,
    /// Tenants started at boot in addition to the persisted roster.
    pub tenants: Vec<TenantId>,
    /// SurrealDB endpoint for the execution store (`mem://`, `rocksdb://path`).
    pub db_endpoint: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string(), "-u".to_string()],
            concurrency_limit: 10,
            cancel_grace: Duration::from_secs(5),
            failure_reason_limit: 8 * 1024,
            stderr_capture_limit: 1024 * 1024,
            max_attempts: 1,
            event_capacity: 1024,
            state_dir: None,
            tenants: Vec::new(),
            db_endpoint: "mem://".to_string(),
        }
    }
}

impl DispatchConfig {
    /// Build a config from environment variables.
    ///
    /// - `DISPATCH_INTERPRETER` (default: `python3 -u`)
    /// - `DISPATCH_CONCURRENCY` (default: 10)
    /// - `DISPATCH_CANCEL_GRACE_MS` (default: 5000)
    /// - `DISPATCH_FAILURE_REASON_BYTES` (default: 8192)
    /// - `DISPATCH_MAX_ATTEMPTS` (default: 1)
    /// - `DISPATCH_STATE_DIR` (optional)
    /// - `DISPATCH_TENANTS` (optional, comma separated)
    /// - `DISPATCH_DB_ENDPOINT` (default: `mem://`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).and_then(non_empty);

        let interpreter = match get("DISPATCH_INTERPRETER") {
            Some(v) => v.split_whitespace().map(str::to_string).collect(),
            None => defaults.interpreter.clone(),
        };

        let concurrency_limit = parse_number(
            "DISPATCH_CONCURRENCY",
            get("DISPATCH_CONCURRENCY"),
            defaults.concurrency_limit,
        )?;
        if concurrency_limit == 0 {
            return Err(ConfigError::Invalid {
                var: "DISPATCH_CONCURRENCY",
                value: "0".to_string(),
                expected: "a positive integer",
            });
        }

        let cancel_grace = Duration::from_millis(parse_number(
            "DISPATCH_CANCEL_GRACE_MS",
            get("DISPATCH_CANCEL_GRACE_MS"),
            defaults.cancel_grace.as_millis() as u64,
        )?);

        let failure_reason_limit = parse_number(
            "DISPATCH_FAILURE_REASON_BYTES",
            get("DISPATCH_FAILURE_REASON_BYTES"),
            defaults.failure_reason_limit,
        )?;

        let max_attempts = parse_number(
            "DISPATCH_MAX_ATTEMPTS",
            get("DISPATCH_MAX_ATTEMPTS"),
            defaults.max_attempts,
        )?
        .max(1);

        let tenants = match get("DISPATCH_TENANTS") {
            Some(list) => list
                .split(',')
                .filter_map(|s| non_empty(s.to_string()))
                .map(|s| {
                    TenantId::new(s.clone()).map_err(|_| ConfigError::Invalid {
                        var: "DISPATCH_TENANTS",
                        value: s,
                        expected: "comma separated tenant ids",
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let db_endpoint = get("DISPATCH_DB_ENDPOINT").unwrap_or_else(|| defaults.db_endpoint.clone());
        let state_dir = get("DISPATCH_STATE_DIR").map(PathBuf::from);

        Ok(Self {
            interpreter,
            concurrency_limit,
            cancel_grace,
            failure_reason_limit,
            max_attempts,
            state_dir,
            tenants,
            db_endpoint,
            ..defaults
        })
    }

    /// Set the interpreter prefix.
    pub fn with_interpreter<I, S>(mut self, interpreter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interpreter = interpreter.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-tenant concurrency limit.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Set the cancel grace period.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Set the broker's delivery attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the roster state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_number<T: std::str::FromStr>(
    var: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
            var,
            value: v,
            expected: "a non-negative integer",
        }),
    }
}
