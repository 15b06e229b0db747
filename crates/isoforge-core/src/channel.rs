//! Status channel: the out-of-band store through which workers report
//! progress.
//!
//! Each build owns exactly one key. Workers overwrite it with their latest
//! [`StatusRecord`]; the orchestrator polls it. There is no connection
//! between the two sides.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::build::BuildStatus;
use crate::{BuildId, Error, Result};

/// Phase a worker claims to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Preparing,
    Building,
    Uploading,
    Completed,
    Failed,
}

impl WorkerPhase {
    /// Infer the phase from a bare progress value.
    pub fn from_progress(progress: u8) -> Self {
        match progress {
            0..=9 => WorkerPhase::Preparing,
            10..=89 => WorkerPhase::Building,
            90..=99 => WorkerPhase::Uploading,
            _ => WorkerPhase::Completed,
        }
    }

    /// The non-terminal build status this phase maps to, if any.
    pub fn active_status(&self) -> Option<BuildStatus> {
        match self {
            WorkerPhase::Preparing => Some(BuildStatus::Preparing),
            WorkerPhase::Building => Some(BuildStatus::Building),
            WorkerPhase::Uploading => Some(BuildStatus::Uploading),
            WorkerPhase::Completed | WorkerPhase::Failed => None,
        }
    }
}

/// A single progress report written by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub stage: String,
    pub progress: u8,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Explicit phase; inferred from `progress` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkerPhase>,
    /// Artifact file name under the artifact destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Terminal failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusRecord {
    /// Reject records a well-behaved worker would never write.
    pub fn validate(&self) -> Result<()> {
        if self.progress > 100 {
            return Err(Error::InvalidInput(format!(
                "progress {} outside 0..=100",
                self.progress
            )));
        }
        if let Some(artifact) = &self.artifact {
            let bad = artifact.is_empty()
                || artifact.contains('/')
                || artifact.contains('\\')
                || artifact.starts_with('.');
            if bad {
                return Err(Error::InvalidInput(format!(
                    "artifact must be a plain file name, got {artifact:?}"
                )));
            }
        }
        Ok(())
    }

    /// Explicit phase if given; a reported error always means failure.
    pub fn effective_phase(&self) -> WorkerPhase {
        if self.error.is_some() {
            return WorkerPhase::Failed;
        }
        self.phase
            .unwrap_or_else(|| WorkerPhase::from_progress(self.progress))
    }
}

/// Durable keyed store shared by workers and the orchestrator.
#[async_trait]
pub trait StatusChannel: Send + Sync {
    /// Overwrite the record for a build. Idempotent.
    async fn publish(&self, build_id: BuildId, record: &StatusRecord) -> Result<()>;

    /// Latest record for a build, if the worker has written one.
    async fn latest(&self, build_id: BuildId) -> Result<Option<StatusRecord>>;

    /// Remove the record for a purged build.
    async fn clear(&self, build_id: BuildId) -> Result<()>;
}
