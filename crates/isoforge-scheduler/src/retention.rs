//! Retention sweep: purges old builds and recovers missed cleanups.

use chrono::{DateTime, Duration, Utc};
use isoforge_core::Result;
use isoforge_core::artifact::ArtifactStore;
use isoforge_core::channel::StatusChannel;
use isoforge_db::BuildRepo;
use std::sync::Arc;
use tracing::{info, warn};

use crate::CleanupManager;

/// What one retention sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Terminal builds whose lingering worker was cleaned up.
    pub recovered: usize,
    /// Builds deleted together with their artifact and channel record.
    pub purged: usize,
}

pub struct Retention {
    repo: Arc<dyn BuildRepo>,
    channel: Arc<dyn StatusChannel>,
    artifacts: Arc<dyn ArtifactStore>,
    cleanup: Arc<CleanupManager>,
    retention: Duration,
}

impl Retention {
    pub fn new(
        repo: Arc<dyn BuildRepo>,
        channel: Arc<dyn StatusChannel>,
        artifacts: Arc<dyn ArtifactStore>,
        cleanup: Arc<CleanupManager>,
        retention: Duration,
    ) -> Self {
        Self {
            repo,
            channel,
            artifacts,
            cleanup,
            retention,
        }
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();

        // Terminal builds still holding a worker: a cleanup was interrupted.
        for build in self.repo.list_terminal_with_worker().await? {
            match self.cleanup.cleanup(&build).await {
                Ok(_) => report.recovered += 1,
                Err(e) => warn!(build_id = %build.id, error = %e, "Recovery cleanup failed"),
            }
        }

        let cutoff = now - self.retention;
        for build in self.repo.list_finished_before(cutoff).await? {
            if build.worker.is_some() {
                // Still holding a worker after the recovery pass; retry next sweep.
                continue;
            }
            if let Err(e) = self.artifacts.delete(build.id).await {
                warn!(build_id = %build.id, error = %e, "Could not delete artifact, keeping build");
                continue;
            }
            if let Err(e) = self.channel.clear(build.id).await {
                warn!(build_id = %build.id, error = %e, "Could not clear status record");
            }
            if let Err(e) = self.repo.delete(build.id).await {
                warn!(build_id = %build.id, error = %e, "Could not delete build record");
                continue;
            }
            info!(build_id = %build.id, status = %build.status, "Purged expired build");
            report.purged += 1;
        }

        Ok(report)
    }
}
