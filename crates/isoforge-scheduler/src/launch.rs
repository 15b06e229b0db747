//! Worker launch: `queued → provisioning` and binding the worker.

use chrono::Utc;
use futures::future::join_all;
use isoforge_core::artifact::ArtifactStore;
use isoforge_core::provisioner::{ChannelCoordinates, Provisioner, WorkerRef, WorkerSpec};
use isoforge_core::signing::Signer;
use isoforge_core::{Build, BuildId, BuildStatus, FailureReason, Result};
use isoforge_db::{BuildRepo, Modified, modify_build};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::CleanupManager;

/// Where workers are told to report, and how long provisioning may take.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// Externally reachable base URL of the API.
    pub public_url: String,
    pub provision_timeout: Duration,
    /// Fetch parallelism hint handed to each worker.
    pub parallelism: u32,
}

/// Provisions the worker of an admitted build.
pub struct WorkerLauncher {
    repo: Arc<dyn BuildRepo>,
    provisioner: Arc<dyn Provisioner>,
    artifacts: Arc<dyn ArtifactStore>,
    signer: Arc<Signer>,
    cleanup: Arc<CleanupManager>,
    settings: LaunchSettings,
}

impl WorkerLauncher {
    pub fn new(
        repo: Arc<dyn BuildRepo>,
        provisioner: Arc<dyn Provisioner>,
        artifacts: Arc<dyn ArtifactStore>,
        signer: Arc<Signer>,
        cleanup: Arc<CleanupManager>,
        settings: LaunchSettings,
    ) -> Self {
        Self {
            repo,
            provisioner,
            artifacts,
            signer,
            cleanup,
            settings,
        }
    }

    /// Status write URL for a build.
    pub fn channel_url(&self, build_id: BuildId) -> String {
        format!(
            "{}/channel/v1/builds/{}/status",
            self.settings.public_url.trim_end_matches('/'),
            build_id
        )
    }

    /// Move a queued build to `provisioning` and start its worker.
    ///
    /// Any provisioning error is terminal for the build. A failed or timed
    /// out provision call is followed by a teardown of the worker it may have
    /// created, and a worker that comes up after the build was cancelled or
    /// failed is torn down again.
    pub async fn launch(&self, build_id: BuildId) -> Result<Build> {
        let claimed = modify_build(self.repo.as_ref(), build_id, |b| {
            if b.status != BuildStatus::Queued {
                return None;
            }
            b.transition(BuildStatus::Provisioning, Utc::now()).ok()
        })
        .await?;
        let build = match claimed {
            Modified::Applied { build, .. } => build,
            Modified::Unchanged(build) => {
                debug!(build_id = %build_id, status = %build.status, "Build no longer queued, not launching");
                return Ok(build);
            }
        };

        let artifact_dir = match self.artifacts.prepare(build_id).await {
            Ok(dir) => dir,
            Err(e) => {
                return self
                    .fail(build_id, format!("artifact destination unavailable: {e}"), None)
                    .await;
            }
        };

        let spec = WorkerSpec {
            build_id,
            config: build.config.clone(),
            channel: ChannelCoordinates {
                url: self.channel_url(build_id),
                token: self.signer.channel_token(build_id),
            },
            artifact_dir,
            parallelism: self.settings.parallelism,
        };

        info!(build_id = %build_id, provisioner = self.provisioner.name(), "Provisioning worker");
        let worker = match timeout(
            self.settings.provision_timeout,
            self.provisioner.provision(spec),
        )
        .await
        {
            Ok(Ok(worker)) => worker,
            Ok(Err(e)) => {
                return self
                    .fail(build_id, e.to_string(), Some(self.orphan(build_id)))
                    .await;
            }
            Err(_) => {
                let message = format!(
                    "provisioning timed out after {}s",
                    self.settings.provision_timeout.as_secs()
                );
                return self
                    .fail(build_id, message, Some(self.orphan(build_id)))
                    .await;
            }
        };

        let bound = modify_build(self.repo.as_ref(), build_id, |b| {
            b.bind_worker(worker.clone(), Utc::now()).ok()
        })
        .await;

        match bound {
            Ok(Modified::Applied { build, .. }) => {
                info!(build_id = %build_id, instance = %worker.instance_id, "Worker started");
                Ok(build)
            }
            Ok(Modified::Unchanged(build)) => {
                info!(build_id = %build_id, status = %build.status, "Build ended while provisioning, removing worker");
                self.cleanup.teardown(&worker).await;
                Ok(build)
            }
            Err(e) => {
                self.cleanup.teardown(&worker).await;
                Err(e.into())
            }
        }
    }

    /// Launch every build still sitting in `queued`.
    ///
    /// Picks up builds whose launch task was lost, e.g. to a restart between
    /// admission and provisioning. A build claimed by a concurrent launch is
    /// left to it. Returns how many queued builds were found.
    pub async fn launch_queued(&self) -> Result<usize> {
        let queued: Vec<BuildId> = self
            .repo
            .list_active()
            .await?
            .into_iter()
            .filter(|b| b.status == BuildStatus::Queued)
            .map(|b| b.id)
            .collect();

        let results = join_all(queued.iter().map(|&id| self.launch(id))).await;
        for (build_id, result) in queued.iter().zip(results) {
            if let Err(e) = result {
                warn!(build_id = %build_id, error = %e, "Launch of queued build failed");
            }
        }
        Ok(queued.len())
    }

    /// The worker a failed or abandoned provision call may have left behind.
    fn orphan(&self, build_id: BuildId) -> WorkerRef {
        WorkerRef::named(build_id, self.provisioner.name())
    }

    /// Fail the build with reason `provisioning`.
    ///
    /// A possibly created `orphan` is recorded on the build before it is torn
    /// down, so the retention recovery pass finds it if teardown never runs.
    async fn fail(
        &self,
        build_id: BuildId,
        message: String,
        orphan: Option<WorkerRef>,
    ) -> Result<Build> {
        warn!(build_id = %build_id, error = %message, "Provisioning failed");
        let result = modify_build(self.repo.as_ref(), build_id, |b| {
            b.fail(FailureReason::Provisioning, message.clone(), Utc::now())
                .ok()?;
            if b.worker.is_none() {
                b.worker = orphan.clone();
            }
            Some(())
        })
        .await;
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                if let Some(orphan) = &orphan {
                    self.cleanup.teardown(orphan).await;
                }
                return Err(e.into());
            }
        };

        match (result, orphan) {
            (Modified::Applied { build, .. }, Some(_)) => {
                match self.cleanup.cleanup(&build).await {
                    Ok(cleaned) => Ok(cleaned),
                    Err(e) => {
                        warn!(build_id = %build_id, error = %e, "Cleanup after failed provisioning failed");
                        Ok(build)
                    }
                }
            }
            (Modified::Unchanged(build), Some(orphan)) => {
                // Ended concurrently; whoever ended it never saw this worker.
                self.cleanup.teardown(&orphan).await;
                Ok(build)
            }
            (result, None) => Ok(result.into_build()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, MockProvisioner, request};

    #[tokio::test]
    async fn test_launch_binds_worker() {
        let h = Harness::new();
        let build = h
            .admission
            .admit(&request("alice", &["ollama"]), Utc::now())
            .await
            .unwrap();

        let launched = h.launcher.launch(build.id).await.unwrap();
        assert_eq!(launched.status, BuildStatus::Provisioning);
        let worker = launched.worker.unwrap();
        assert_eq!(worker.provisioner, "mock");

        let specs = h.provisioner.specs();
        assert_eq!(specs.len(), 1);
        let env = specs[0].env();
        assert_eq!(env["ISOFORGE_SERVICES"], "ollama");
        assert!(env["ISOFORGE_STATUS_URL"].ends_with(&format!("/channel/v1/builds/{}/status", build.id)));
        assert!(h.signer.verify_channel_token(build.id, &env["ISOFORGE_STATUS_TOKEN"]));
    }

    #[tokio::test]
    async fn test_provisioning_error_is_terminal() {
        let h = Harness::with_provisioner(MockProvisioner::failing_provision());
        let build = h
            .admission
            .admit(&request("alice", &["ollama"]), Utc::now())
            .await
            .unwrap();

        let failed = h.launcher.launch(build.id).await.unwrap();
        assert_eq!(failed.status, BuildStatus::Failed);
        assert_eq!(
            failed.error.map(|e| e.reason),
            Some(FailureReason::Provisioning)
        );
        assert_eq!(h.provisioner.provision_calls(), 1);
        // A failed create may still have left a container behind.
        assert_eq!(h.provisioner.terminated(), vec![WorkerRef::named(build.id, "mock")]);
        assert!(failed.worker.is_none());
    }

    #[tokio::test]
    async fn test_provisioning_timeout_is_terminal() {
        let h = Harness::with_provisioner(MockProvisioner::hanging_provision());
        let build = h
            .admission
            .admit(&request("alice", &["ollama"]), Utc::now())
            .await
            .unwrap();

        let failed = h.launcher.launch(build.id).await.unwrap();
        assert_eq!(failed.status, BuildStatus::Failed);
        assert!(failed.error.unwrap().message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_timed_out_worker_is_torn_down_by_name() {
        let h = Harness::with_provisioner(MockProvisioner::hanging_provision());
        let build = h
            .admission
            .admit(&request("alice", &["ollama"]), Utc::now())
            .await
            .unwrap();

        let failed = h.launcher.launch(build.id).await.unwrap();
        assert_eq!(
            failed.error.map(|e| e.reason),
            Some(FailureReason::Provisioning)
        );
        let terminated = h.provisioner.terminated();
        assert_eq!(terminated.len(), 1);
        assert_eq!(
            terminated[0].instance_id,
            isoforge_core::provisioner::worker_name(&build.id)
        );

        let stored = h.repo.get(build.id).await.unwrap();
        assert!(stored.worker.is_none());
        assert!(h.repo.list_terminal_with_worker().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_torn_down_when_cancelled_during_timeout() {
        let h = Harness::with_provisioner(MockProvisioner::hanging_provision());
        let build = h
            .admission
            .admit(&request("alice", &["ollama"]), Utc::now())
            .await
            .unwrap();

        let launcher = h.launcher.clone();
        let launch = tokio::spawn(async move { launcher.launch(build.id).await });
        h.provisioner.provision_started().await;
        h.service.cancel(build.id).await.unwrap();

        let after = launch.await.unwrap().unwrap();
        assert_eq!(after.status, BuildStatus::Cancelled);
        assert!(after.worker.is_none());
        assert_eq!(h.provisioner.terminated(), vec![WorkerRef::named(build.id, "mock")]);
    }

    #[tokio::test]
    async fn test_queued_builds_are_launched_by_sweep() {
        let h = Harness::new();
        // Admitted without a launch task, as after a restart.
        let build = h
            .admission
            .admit(&request("alice", &["ollama"]), Utc::now())
            .await
            .unwrap();
        let running = h.running_build().await;

        assert_eq!(h.launcher.launch_queued().await.unwrap(), 1);
        let stored = h.repo.get(build.id).await.unwrap();
        assert_eq!(stored.status, BuildStatus::Provisioning);
        assert!(stored.worker.is_some());
        assert_eq!(h.provisioner.provision_calls(), 2);

        // Nothing left in `queued`; the running build is not provisioned again.
        assert_eq!(h.launcher.launch_queued().await.unwrap(), 0);
        assert_eq!(h.provisioner.provision_calls(), 2);
        assert_eq!(
            h.repo.get(running.id).await.unwrap().worker,
            running.worker
        );
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_provision_once() {
        let h = Harness::new();
        let build = h
            .admission
            .admit(&request("alice", &["ollama"]), Utc::now())
            .await
            .unwrap();

        let (a, b) = tokio::join!(h.launcher.launch_queued(), h.launcher.launch(build.id));
        a.unwrap();
        b.unwrap();
        assert_eq!(h.provisioner.provision_calls(), 1);
        assert!(h.repo.get(build.id).await.unwrap().worker.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_build_is_not_launched() {
        let h = Harness::new();
        let build = h
            .admission
            .admit(&request("alice", &["ollama"]), Utc::now())
            .await
            .unwrap();
        h.service.cancel(build.id).await.unwrap();

        let result = h.launcher.launch(build.id).await.unwrap();
        assert_eq!(result.status, BuildStatus::Cancelled);
        assert_eq!(h.provisioner.provision_calls(), 0);
    }
}
