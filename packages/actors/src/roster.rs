//! File-based persistence of the tenant roster.
//!
//! The set of tenants with a running worker is written as JSON on every
//! change so a restarted node brings the same workers back.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dispatch_core::TenantId;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const ROSTER_FILE: &str = "tenants.json";

#[derive(Debug, Serialize, Deserialize)]
struct RosterFile {
    tenants: Vec<TenantId>,
    updated_at: DateTime<Utc>,
}

/// Tenant roster stored under a state directory.
#[derive(Debug, Clone)]
pub struct TenantRoster {
    base_dir: PathBuf,
}

impl TenantRoster {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Ensure the state directory exists.
    pub async fn init(&self) -> Result<(), RosterError> {
        fs::create_dir_all(&self.base_dir).await?;
        Ok(())
    }

    pub fn path(&self) -> PathBuf {
        self.base_dir.join(ROSTER_FILE)
    }

    /// Replace the stored roster.
    pub async fn save(&self, tenants: &[TenantId]) -> Result<(), RosterError> {
        let mut tenants = tenants.to_vec();
        tenants.sort();
        let json = serde_json::to_string_pretty(&RosterFile {
            tenants,
            updated_at: Utc::now(),
        })?;

        // Readers never see a half-written roster.
        let path = self.path();
        let temp_path = self.base_dir.join(format!("{}.tmp", ROSTER_FILE));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &path).await?;

        tracing::debug!("Saved tenant roster to {:?}", path);
        Ok(())
    }

    /// Stored tenants; empty when nothing was saved yet.
    pub async fn load(&self) -> Result<Vec<TenantId>, RosterError> {
        let path = self.path();
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let roster: RosterFile = serde_json::from_str(&json)?;
        tracing::debug!("Loaded {} tenants from {:?}", roster.tenants.len(), path);
        Ok(roster.tenants)
    }
}

/// Roster persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
