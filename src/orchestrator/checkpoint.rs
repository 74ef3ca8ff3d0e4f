/// Checkpoint persistence: the single source of truth for resuming work
/// across process restarts. Every write goes through write-temp-then-rename
/// so a partial file is never visible to a concurrent reader.
use crate::config::types::{BenchError, JobStatus, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Persisted attempt/terminal state for one job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub summary: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Checkpoint {
    pub fn running(job_id: &str, attempts: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Running,
            attempts,
            summary: None,
            error: None,
        }
    }

    pub fn succeeded(job_id: &str, attempts: u32, summary: serde_json::Value) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Succeeded,
            attempts,
            summary: Some(summary),
            error: None,
        }
    }

    pub fn failed(job_id: &str, attempts: u32, error: String) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Failed,
            attempts,
            summary: None,
            error: Some(error),
        }
    }

    /// Load a checkpoint from a job's artifact directory. A missing file is
    /// `None`; an unreadable or corrupt one is surfaced so the caller does
    /// not silently re-run a job whose history it cannot see.
    pub fn load(job_dir: &Path) -> Result<Option<Self>> {
        let path = job_dir.join(CHECKPOINT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&raw).map_err(|e| {
            BenchError::Schema(format!("corrupt checkpoint {}: {}", path.display(), e))
        })?;
        Ok(Some(checkpoint))
    }

    pub fn store(&self, job_dir: &Path) -> Result<()> {
        fs::create_dir_all(job_dir)?;
        write_json_atomic(
            &job_dir.join(CHECKPOINT_FILE),
            &serde_json::to_value(self).map_err(|e| BenchError::Schema(e.to_string()))?,
        )
    }
}

/// Serialize `value` to `path` via a uniquely named temp file in the same
/// directory followed by an atomic rename. The temp file is removed on any
/// failure so no `*.tmp` ever survives a completed call.
pub fn write_json_atomic(path: &Path, value: &serde_json::Value) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        BenchError::Config(format!("artifact path {} has no parent", path.display()))
    })?;
    fs::create_dir_all(parent)?;

    let tmp: PathBuf = parent.join(format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        Uuid::new_v4()
    ));

    let write_result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, value)
            .map_err(|e| BenchError::Schema(format!("serialize failed: {e}")))?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
