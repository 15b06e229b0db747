//! Worker teardown after a build reaches a terminal state.

use isoforge_core::provisioner::{Provisioner, WorkerRef};
use isoforge_core::{Build, Result};
use isoforge_db::{BuildRepo, Modified, modify_build};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Tears down workers and clears the reference on the build.
pub struct CleanupManager {
    repo: Arc<dyn BuildRepo>,
    provisioner: Arc<dyn Provisioner>,
    terminate_timeout: Duration,
}

impl CleanupManager {
    pub fn new(
        repo: Arc<dyn BuildRepo>,
        provisioner: Arc<dyn Provisioner>,
        terminate_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            provisioner,
            terminate_timeout,
        }
    }

    /// Issue one bounded teardown call. Returns whether it succeeded.
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn teardown(&self, worker: &WorkerRef) -> bool {
        match timeout(self.terminate_timeout, self.provisioner.terminate(worker)).await {
            Ok(Ok(())) => {
                info!(build_id = %worker.build_id, instance = %worker.instance_id, "Worker terminated");
                true
            }
            Ok(Err(e)) => {
                warn!(build_id = %worker.build_id, instance = %worker.instance_id, error = %e, "Worker teardown failed");
                false
            }
            Err(_) => {
                warn!(
                    build_id = %worker.build_id,
                    instance = %worker.instance_id,
                    timeout_secs = self.terminate_timeout.as_secs(),
                    "Worker teardown timed out"
                );
                false
            }
        }
    }

    /// Clean up after a terminal build.
    ///
    /// Tears down the bound worker (even if an earlier attempt already did)
    /// and clears the worker reference whatever the teardown outcome.
    /// Non-terminal builds and builds without a worker are left alone.
    pub async fn cleanup(&self, build: &Build) -> Result<Build> {
        let Some(worker) = build.worker.clone().filter(|_| build.is_terminal()) else {
            return Ok(build.clone());
        };

        self.teardown(&worker).await;

        let result = modify_build(self.repo.as_ref(), build.id, |b| {
            if b.is_terminal() && b.worker.as_ref() == Some(&worker) {
                b.worker = None;
                Some(())
            } else {
                None
            }
        })
        .await?;

        Ok(match result {
            Modified::Applied { build, .. } => build,
            Modified::Unchanged(build) => build,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, MockProvisioner};
    use isoforge_core::FailureReason;

    #[tokio::test]
    async fn test_cleanup_terminates_once_and_clears_worker() {
        let h = Harness::new();
        let build = h.running_build().await;
        let build = h.fail(build.id, FailureReason::Stalled).await;

        let cleaned = h.cleanup.cleanup(&build).await.unwrap();
        assert!(cleaned.worker.is_none());
        assert_eq!(h.provisioner.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_clears_worker_even_if_teardown_fails() {
        let h = Harness::with_provisioner(MockProvisioner::failing_terminate());
        let build = h.running_build().await;
        let build = h.fail(build.id, FailureReason::Execution).await;

        let cleaned = h.cleanup.cleanup(&build).await.unwrap();
        assert!(cleaned.worker.is_none());
        assert_eq!(h.provisioner.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let h = Harness::new();
        let build = h.running_build().await;
        let terminal = h.fail(build.id, FailureReason::Cancelled).await;

        h.cleanup.cleanup(&terminal).await.unwrap();
        // A stale copy still carrying the worker issues a fresh teardown call.
        let again = h.cleanup.cleanup(&terminal).await.unwrap();
        assert!(again.worker.is_none());
        assert_eq!(h.provisioner.terminate_calls(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_skips_active_builds() {
        let h = Harness::new();
        let build = h.running_build().await;
        let same = h.cleanup.cleanup(&build).await.unwrap();
        assert!(same.worker.is_some());
        assert_eq!(h.provisioner.terminate_calls(), 0);
        assert!(!h.repo.get(build.id).await.unwrap().is_terminal());
    }
}
