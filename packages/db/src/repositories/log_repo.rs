//! Append-only job log persistence.

use chrono::{DateTime, Utc};
use dispatch_core::{JobId, LogLine, LogStream, Severity, TenantId};
use serde::{Deserialize, Serialize};

use crate::{DbError, get_db};

/// Repository for job output lines.
pub struct LogRepository;

/// Stored form of a log line, carrying its owning job.
#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    tenant_id: String,
    job_id: String,
    seq: u64,
    timestamp: DateTime<Utc>,
    severity: Severity,
    stream: LogStream,
    text: String,
}

impl LogRecord {
    fn new(tenant_id: &TenantId, job_id: JobId, line: &LogLine) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            job_id: job_id.to_string(),
            seq: line.seq,
            timestamp: line.timestamp,
            severity: line.severity,
            stream: line.stream,
            text: line.text.clone(),
        }
    }

    fn into_line(self) -> LogLine {
        LogLine {
            seq: self.seq,
            timestamp: self.timestamp,
            severity: self.severity,
            stream: self.stream,
            text: self.text,
        }
    }
}

impl LogRepository {
    /// Append one line to a job's log.
    pub async fn append(tenant_id: &TenantId, job_id: JobId, line: &LogLine) -> Result<(), DbError> {
        let db = get_db()?;
        let record = LogRecord::new(tenant_id, job_id, line);
        let _: Option<LogRecord> = db.create("job_log").content(record).await?;
        Ok(())
    }

    /// Every line of a job ordered by sequence number.
    pub async fn list(tenant_id: &TenantId, job_id: JobId) -> Result<Vec<LogLine>, DbError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                SELECT * FROM job_log
                WHERE tenant_id = $tenant_id AND job_id = $job_id
                ORDER BY seq ASC
                "#,
            )
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("job_id", job_id.to_string()))
            .await?;

        let records: Vec<LogRecord> = result.take(0)?;
        Ok(records.into_iter().map(LogRecord::into_line).collect())
    }

    /// Number of stored lines for a job.
    pub async fn count(tenant_id: &TenantId, job_id: JobId) -> Result<u64, DbError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                SELECT count() AS count FROM job_log
                WHERE tenant_id = $tenant_id AND job_id = $job_id
                GROUP ALL
                "#,
            )
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("job_id", job_id.to_string()))
            .await?;

        let count: Option<i64> = result.take("count")?;
        Ok(count.unwrap_or(0) as u64)
    }

    /// Drop a job's log.
    pub async fn delete_for_job(tenant_id: &TenantId, job_id: JobId) -> Result<(), DbError> {
        let db = get_db()?;
        db.query("DELETE job_log WHERE tenant_id = $tenant_id AND job_id = $job_id")
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("job_id", job_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }
}
