//! Stall and timeout enforcement.

use chrono::{DateTime, Duration, Utc};
use isoforge_core::{Build, FailureReason, Result};
use isoforge_db::{BuildRepo, Modified, modify_build};
use std::sync::Arc;
use tracing::{info, warn};

use crate::CleanupManager;

/// Fails builds that stopped making progress or ran too long.
pub struct Monitor {
    repo: Arc<dyn BuildRepo>,
    cleanup: Arc<CleanupManager>,
    stall_threshold: Duration,
    max_build_duration: Duration,
}

impl Monitor {
    pub fn new(
        repo: Arc<dyn BuildRepo>,
        cleanup: Arc<CleanupManager>,
        stall_threshold: Duration,
        max_build_duration: Duration,
    ) -> Self {
        Self {
            repo,
            cleanup,
            stall_threshold,
            max_build_duration,
        }
    }

    /// Why `build` should be failed at `now`, if at all. The age ceiling is
    /// checked before the stall threshold.
    pub fn verdict(&self, build: &Build, now: DateTime<Utc>) -> Option<(FailureReason, String)> {
        if build.is_terminal() {
            return None;
        }
        let age = now - build.created_at;
        if age > self.max_build_duration {
            return Some((
                FailureReason::TimedOut,
                format!(
                    "build exceeded {} minutes",
                    self.max_build_duration.num_minutes()
                ),
            ));
        }
        let idle = now - build.last_progress_at;
        if idle > self.stall_threshold {
            return Some((
                FailureReason::Stalled,
                format!(
                    "no progress for {} minutes at {}%",
                    idle.num_minutes(),
                    build.progress
                ),
            ));
        }
        None
    }

    /// One sweep over all active builds. Returns the builds it failed.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<Build>> {
        let mut failed = Vec::new();
        for build in self.repo.list_active().await? {
            if self.verdict(&build, now).is_none() {
                continue;
            }
            let result = modify_build(self.repo.as_ref(), build.id, |b| {
                let (reason, message) = self.verdict(b, now)?;
                b.fail(reason, message, now).ok()?;
                Some(reason)
            })
            .await;

            match result {
                Ok(Modified::Applied { build, value: reason }) => {
                    info!(build_id = %build.id, reason = %reason, progress = build.progress, "Build failed by monitor");
                    match self.cleanup.cleanup(&build).await {
                        Ok(cleaned) => failed.push(cleaned),
                        Err(e) => {
                            warn!(build_id = %build.id, error = %e, "Cleanup after monitor failure did not finish");
                            failed.push(build);
                        }
                    }
                }
                Ok(Modified::Unchanged(_)) => {}
                Err(e) => warn!(build_id = %build.id, error = %e, "Monitor could not update build"),
            }
        }
        Ok(failed)
    }
}
