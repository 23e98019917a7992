use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RunContext;
use crate::error::EngineError;

/// Metadata file written at run start and finalized at shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub correlation_id: String,
    pub pid: u32,
    pub mode: String,
    pub capital: f64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_status: Option<String>,
    #[serde(default)]
    pub ticks: Option<u64>,
    #[serde(default)]
    pub final_total_value: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Creates and owns the run-scoped directory tree
/// `logs/<correlation_id>/<pid>/` with its `events/` subdirectory.
pub struct LogDirectoryManager;

/// Paths for one run's artefacts.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    pub run_dir: PathBuf,
    pub events_dir: PathBuf,
}

impl LogDirectoryManager {
    pub fn create(logs_root: &Path, ctx: &RunContext) -> Result<RunDirectory, EngineError> {
        let run_dir = logs_root
            .join(&ctx.correlation_id)
            .join(ctx.pid.to_string());
        let events_dir = run_dir.join("events");

        std::fs::create_dir_all(&events_dir).map_err(|source| EngineError::LogDirectory {
            path: events_dir.display().to_string(),
            source,
        })?;

        let dir = RunDirectory { run_dir, events_dir };
        dir.write_metadata(&RunMetadata {
            correlation_id: ctx.correlation_id.clone(),
            pid: ctx.pid,
            mode: ctx.mode.clone(),
            capital: ctx.capital,
            started_at: ctx.started_at,
            finished_at: None,
            exit_status: None,
            ticks: None,
            final_total_value: None,
            error: None,
        })?;
        Ok(dir)
    }
}

impl RunDirectory {
    pub fn metadata_path(&self) -> PathBuf {
        self.run_dir.join("run_metadata.json")
    }

    pub fn write_metadata(&self, metadata: &RunMetadata) -> Result<(), EngineError> {
        let path = self.metadata_path();
        let json = serde_json::to_string_pretty(metadata).expect("metadata serializes");
        std::fs::write(&path, json).map_err(|source| EngineError::LogWrite {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn read_metadata(&self) -> Result<RunMetadata, EngineError> {
        let path = self.metadata_path();
        let contents = std::fs::read_to_string(&path).map_err(|source| EngineError::LogWrite {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|e| EngineError::LogWrite {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    /// Rewrite the metadata with the run outcome.
    pub fn finalize(
        &self,
        exit_status: &str,
        ticks: u64,
        final_total_value: f64,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let mut metadata = self.read_metadata()?;
        metadata.finished_at = Some(Utc::now());
        metadata.exit_status = Some(exit_status.to_string());
        metadata.ticks = Some(ticks);
        metadata.final_total_value = Some(final_total_value);
        metadata.error = error;
        self.write_metadata(&metadata)
    }
}
