//! Resumption checkpoint
//!
//! [`RealTimeState`] is opaque to callers: they persist whatever the last
//! `CheckpointCommit` carried and hand it back on the next run. The JSON
//! shape (`JobVersion`, `ShapeVersion`, `LastReadTime`) is shared with
//! stored job state, so field names are fixed.

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Progress marker of one replication job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RealTimeState {
    pub job_version: i64,
    pub shape_version: i64,
    pub last_read_time: DateTime<Utc>,
}

impl Default for RealTimeState {
    fn default() -> Self {
        Self {
            job_version: -1,
            shape_version: -1,
            last_read_time: DateTime::<Utc>::MIN_UTC,
        }
    }
}

impl RealTimeState {
    /// Fresh state for the given versions, never read.
    pub fn for_versions(versions: DataVersions) -> Self {
        Self {
            job_version: versions.job_version,
            shape_version: versions.shape_version,
            ..Self::default()
        }
    }

    /// Parse a stored checkpoint. Absent or blank input yields the default.
    pub fn from_json(json: Option<&str>) -> Result<Self> {
        match json.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(Self::default()),
            Some(s) => serde_json::from_str(s)
                .map_err(|e| ReplicationError::checkpoint(format!("invalid checkpoint: {}", e))),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether `incoming` versions are ahead of this checkpoint.
    pub fn needs_full_reset(&self, incoming: DataVersions) -> bool {
        incoming.job_version > self.job_version || incoming.shape_version > self.shape_version
    }

    /// True until the first successful tick or reconciliation.
    pub fn never_read(&self) -> bool {
        self.last_read_time == DateTime::<Utc>::MIN_UTC
    }
}

/// Versions declared by the caller for this run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataVersions {
    pub job_version: i64,
    pub shape_version: i64,
}

impl DataVersions {
    pub fn new(job_version: i64, shape_version: i64) -> Self {
        Self {
            job_version,
            shape_version,
        }
    }
}

/// Checkpoint persisted as a JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no checkpoint was written yet.
    pub async fn load(&self) -> Result<Option<RealTimeState>> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => RealTimeState::from_json(Some(&contents)).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ReplicationError::checkpoint(format!(
                "failed to read {:?}: {}",
                self.path, e
            ))),
        }
    }

    pub async fn save(&self, state: &RealTimeState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("tmp");
        let json = serde_json::to_string_pretty(state)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;

        debug!(path = ?self.path, last_read_time = %state.last_read_time, "Saved checkpoint");
        Ok(())
    }

    /// Remove the checkpoint; a missing file is not an error.
    pub async fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
