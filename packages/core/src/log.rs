//! Log lines captured from job processes.

use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Output channel a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    /// Severity inferred from the channel.
    pub fn severity(self) -> Severity {
        match self {
            LogStream::Stdout => Severity::Info,
            LogStream::Stderr => Severity::Warn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warn => write!(f, "WARN"),
        }
    }
}

/// A single line of job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Position across both streams of the job, starting at 0.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub stream: LogStream,
    pub text: String,
}

/// Assigns sequence numbers and non-decreasing timestamps to the lines of
/// one job. Shared by the stdout and stderr readers.
#[derive(Debug, Default)]
pub struct LineStamper {
    state: Mutex<StamperState>,
}

#[derive(Debug, Default)]
struct StamperState {
    next_seq: u64,
    last: Option<DateTime<Utc>>,
}

impl LineStamper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a line read from `stream`.
    pub fn stamp(&self, stream: LogStream, text: impl Into<String>) -> LogLine {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let now = Utc::now();
        // Wall clocks can step backwards; keep timestamps strictly increasing.
        let timestamp = match state.last {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.last = Some(timestamp);

        LogLine {
            seq,
            timestamp,
            severity: stream.severity(),
            stream,
            text: text.into(),
        }
    }

    /// Number of lines stamped so far.
    pub fn count(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .next_seq
    }
}
