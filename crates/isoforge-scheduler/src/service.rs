//! The build service facade and its assembly from configuration.

use chrono::Utc;
use isoforge_config::{BuildRequest, Catalog, SystemConfig, Validator};
use isoforge_core::artifact::ArtifactStore;
use isoforge_core::channel::StatusChannel;
use isoforge_core::provisioner::{Provisioner, fetch_parallelism};
use isoforge_core::signing::Signer;
use isoforge_core::{Build, BuildId, FailureReason, Result};
use isoforge_db::{BuildRepo, Modified, modify_build};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::launch::LaunchSettings;
use crate::{
    AdmissionController, AdmissionError, CleanupManager, Delivery, DeliveryError, DownloadGrant,
    Ingestor, Monitor, Retention, WorkerLauncher, to_chrono,
};

/// Most builds returned by a requester listing.
pub const LIST_LIMIT: i64 = 50;

/// Storage and compute backends the scheduler runs against.
#[derive(Clone)]
pub struct Backends {
    pub repo: Arc<dyn BuildRepo>,
    pub channel: Arc<dyn StatusChannel>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub provisioner: Arc<dyn Provisioner>,
}

/// Request-facing operations on builds.
pub struct BuildService {
    repo: Arc<dyn BuildRepo>,
    admission: Arc<AdmissionController>,
    launcher: Arc<WorkerLauncher>,
    delivery: Arc<Delivery>,
    cleanup: Arc<CleanupManager>,
}

impl BuildService {
    pub fn new(
        repo: Arc<dyn BuildRepo>,
        admission: Arc<AdmissionController>,
        launcher: Arc<WorkerLauncher>,
        delivery: Arc<Delivery>,
        cleanup: Arc<CleanupManager>,
    ) -> Self {
        Self {
            repo,
            admission,
            launcher,
            delivery,
            cleanup,
        }
    }

    /// Admit a request and start provisioning in the background.
    ///
    /// A launch lost before it claims the build is retried by
    /// [`WorkerLauncher::launch_queued`].
    pub async fn submit(&self, request: &BuildRequest) -> std::result::Result<Build, AdmissionError> {
        let build = self.admission.admit(request, Utc::now()).await?;

        let launcher = self.launcher.clone();
        let build_id = build.id;
        tokio::spawn(async move {
            if let Err(e) = launcher.launch(build_id).await {
                error!(build_id = %build_id, error = %e, "Worker launch failed");
            }
        });

        Ok(build)
    }

    pub async fn poll(&self, build_id: BuildId) -> Result<Build> {
        Ok(self.repo.get(build_id).await?)
    }

    /// Force a build into `cancelled` and clean up its worker.
    ///
    /// Cancelling a terminal build changes nothing and returns it as is.
    pub async fn cancel(&self, build_id: BuildId) -> Result<Build> {
        let result = modify_build(self.repo.as_ref(), build_id, |b| {
            if b.is_terminal() {
                return None;
            }
            b.fail(FailureReason::Cancelled, "Cancelled on request", Utc::now())
                .ok()
        })
        .await?;

        match result {
            Modified::Applied { build, .. } => {
                info!(build_id = %build_id, "Build cancelled");
                match self.cleanup.cleanup(&build).await {
                    Ok(cleaned) => Ok(cleaned),
                    Err(e) => {
                        // Retention recovers the lingering worker reference.
                        warn!(build_id = %build_id, error = %e, "Cleanup after cancel failed");
                        Ok(build)
                    }
                }
            }
            Modified::Unchanged(build) => Ok(build),
        }
    }

    pub async fn download(
        &self,
        build_id: BuildId,
    ) -> std::result::Result<DownloadGrant, DeliveryError> {
        self.delivery.grant(build_id, Utc::now()).await
    }

    /// Recent builds of one requester, or every active build.
    pub async fn list(&self, requester: Option<&str>) -> Result<Vec<Build>> {
        let builds = match requester {
            Some(requester) => self.repo.list_by_requester(requester, LIST_LIMIT).await?,
            None => self.repo.list_active().await?,
        };
        Ok(builds)
    }

    pub fn catalog(&self) -> &Catalog {
        self.admission.validator().catalog()
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Whether the build store answers.
    pub async fn ready(&self) -> Result<()> {
        Ok(self.repo.ping().await?)
    }
}

/// Every scheduler component, wired together.
pub struct Scheduler {
    pub service: Arc<BuildService>,
    pub admission: Arc<AdmissionController>,
    pub launcher: Arc<WorkerLauncher>,
    pub ingestor: Arc<Ingestor>,
    pub monitor: Arc<Monitor>,
    pub retention: Arc<Retention>,
    pub delivery: Arc<Delivery>,
    pub cleanup: Arc<CleanupManager>,
}

impl Scheduler {
    pub fn assemble(
        backends: Backends,
        signer: Arc<Signer>,
        catalog: Arc<Catalog>,
        config: &SystemConfig,
    ) -> Self {
        let Backends {
            repo,
            channel,
            artifacts,
            provisioner,
        } = backends;

        let cleanup = Arc::new(CleanupManager::new(
            repo.clone(),
            provisioner.clone(),
            config.worker.terminate_timeout,
        ));
        let admission = Arc::new(AdmissionController::new(
            repo.clone(),
            Validator::new(catalog),
            config.admission.clone(),
        ));
        let launcher = Arc::new(WorkerLauncher::new(
            repo.clone(),
            provisioner,
            artifacts.clone(),
            signer.clone(),
            cleanup.clone(),
            LaunchSettings {
                public_url: config.delivery.public_url.clone(),
                provision_timeout: config.worker.provision_timeout,
                parallelism: fetch_parallelism(config.worker.cpus),
            },
        ));
        let delivery = Arc::new(Delivery::new(
            repo.clone(),
            artifacts.clone(),
            signer,
            config.delivery.public_url.clone(),
            to_chrono(config.delivery.url_ttl),
        ));
        let ingestor = Arc::new(Ingestor::new(
            repo.clone(),
            channel.clone(),
            artifacts.clone(),
            cleanup.clone(),
        ));
        let monitor = Arc::new(Monitor::new(
            repo.clone(),
            cleanup.clone(),
            to_chrono(config.monitor.stall_threshold),
            to_chrono(config.monitor.max_build_duration),
        ));
        let retention = Arc::new(Retention::new(
            repo.clone(),
            channel,
            artifacts,
            cleanup.clone(),
            to_chrono(config.delivery.retention),
        ));
        let service = Arc::new(BuildService::new(
            repo,
            admission.clone(),
            launcher.clone(),
            delivery.clone(),
            cleanup.clone(),
        ));

        Self {
            service,
            admission,
            launcher,
            ingestor,
            monitor,
            retention,
            delivery,
            cleanup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, MockProvisioner, request};
    use isoforge_core::BuildStatus;
    use std::time::Duration;

    #[tokio::test]
    async fn test_submit_then_immediate_poll() {
        let h = Harness::new();
        let build = h
            .service
            .submit(&request("alice", &["ollama", "openwebui"]))
            .await
            .unwrap();
        assert_eq!(build.status, BuildStatus::Queued);
        assert_eq!(build.config.services, vec!["ollama", "openwebui"]);
        assert!(build.config.models.is_empty());

        let polled = h.service.poll(build.id).await.unwrap();
        assert!(matches!(
            polled.status,
            BuildStatus::Queued | BuildStatus::Provisioning
        ));
        assert_eq!(polled.progress, 0);
    }

    #[tokio::test]
    async fn test_submit_launches_worker() {
        let h = Harness::new();
        let build = h
            .service
            .submit(&request("alice", &["redis"]))
            .await
            .unwrap();

        let mut bound = false;
        for _ in 0..100 {
            if h.service.poll(build.id).await.unwrap().worker.is_some() {
                bound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(bound);
        assert_eq!(h.provisioner.provision_calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_submit_never_provisions() {
        let h = Harness::new();
        let err = h
            .service
            .submit(&request("alice", &["not-in-catalog"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Invalid(_)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.provisioner.provision_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_cleans_up_worker() {
        let h = Harness::new();
        let build = h.running_build().await;
        let cancelled = h.service.cancel(build.id).await.unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);
        assert_eq!(
            cancelled.error.unwrap().reason,
            FailureReason::Cancelled
        );
        assert!(cancelled.worker.is_none());
        assert_eq!(h.provisioner.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_succeeds_when_worker_cannot_be_cleared() {
        let h = Harness::new();
        let build = h.running_build().await;
        // The cancel itself lands; clearing the worker afterwards does not.
        h.repo.fail_writes_after(1);

        let cancelled = h.service.cancel(build.id).await.unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);
        assert_eq!(h.provisioner.terminate_calls(), 1);
        let stored = h.repo.get(build.id).await.unwrap();
        assert_eq!(stored.status, BuildStatus::Cancelled);
        assert!(stored.worker.is_some());

        h.repo.heal();
        let report = h.retention.sweep_at(Utc::now()).await.unwrap();
        assert_eq!(report.recovered, 1);
        assert!(h.repo.get(build.id).await.unwrap().worker.is_none());
    }

    #[tokio::test]
    async fn test_cancel_terminal_build_is_noop() {
        let h = Harness::new();
        let build = h.completed_build(b"iso").await;
        let before = h.repo.get(build.id).await.unwrap();
        let after = h.service.cancel(build.id).await.unwrap();
        assert_eq!(after.status, BuildStatus::Completed);
        assert_eq!(after.version, before.version);

        let again = h.service.cancel(build.id).await.unwrap();
        assert_eq!(again.status, BuildStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_while_provisioning_tears_down_late_worker() {
        let h = Harness::with_provisioner(MockProvisioner::slow_provision(Duration::from_millis(50)));
        let build = h
            .admission
            .admit(&request("alice", &["redis"]), Utc::now())
            .await
            .unwrap();

        let launcher = h.launcher.clone();
        let launch = tokio::spawn(async move { launcher.launch(build.id).await });
        h.provisioner.provision_started().await;
        let cancelled = h.service.cancel(build.id).await.unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);

        let after = launch.await.unwrap().unwrap();
        assert_eq!(after.status, BuildStatus::Cancelled);
        assert!(after.worker.is_none());
        assert_eq!(h.provisioner.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn test_active_builds_never_exceed_ceiling() {
        let h = Harness::with_limits(3, 100);
        let mut admitted = 0;
        for i in 0..10 {
            if h
                .service
                .submit(&request(&format!("user{i}"), &["redis"]))
                .await
                .is_ok()
            {
                admitted += 1;
            }
            assert!(h.repo.count_active().await.unwrap() <= 3);
        }
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn test_list_by_requester() {
        let h = Harness::new();
        h.service.submit(&request("alice", &["redis"])).await.unwrap();
        h.service.submit(&request("bob", &["redis"])).await.unwrap();
        let alice = h.service.list(Some("alice")).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(h.service.list(None).await.unwrap().len(), 2);
    }
}
