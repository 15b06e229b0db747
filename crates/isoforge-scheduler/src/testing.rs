//! Shared fixtures for scheduler tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use isoforge_config::{BuildRequest, Catalog, SystemConfig};
use isoforge_core::channel::{StatusChannel, StatusRecord};
use isoforge_core::provisioner::{Provisioner, WorkerRef, WorkerSpec};
use isoforge_core::signing::Signer;
use isoforge_core::{Build, BuildId, Error, FailureReason, Result};
use isoforge_db::{
    Admission, AdmissionLimits, BuildRepo, DbError, DbResult, MemoryArtifactStore,
    MemoryBuildRepo, MemoryStatusChannel, modify_build,
};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::service::{Backends, Scheduler};
use crate::{
    AdmissionController, BuildService, CleanupManager, Delivery, Ingestor, Monitor, Retention,
    WorkerLauncher,
};

pub(crate) fn request(requester: &str, services: &[&str]) -> BuildRequest {
    BuildRequest {
        services: services.iter().map(|s| s.to_string()).collect(),
        models: vec![],
        gpu: false,
        requester: requester.to_string(),
        image_name: "homelab".to_string(),
    }
}

enum ProvisionMode {
    Succeed,
    Fail,
    Hang,
    Slow(Duration),
}

/// Provisioner that records calls instead of starting anything.
pub(crate) struct MockProvisioner {
    mode: ProvisionMode,
    fail_terminate: bool,
    specs: Mutex<Vec<WorkerSpec>>,
    terminated: Mutex<Vec<WorkerRef>>,
    started: Notify,
}

impl MockProvisioner {
    fn with_mode(mode: ProvisionMode, fail_terminate: bool) -> Self {
        Self {
            mode,
            fail_terminate,
            specs: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            started: Notify::new(),
        }
    }

    pub fn new() -> Self {
        Self::with_mode(ProvisionMode::Succeed, false)
    }

    pub fn failing_provision() -> Self {
        Self::with_mode(ProvisionMode::Fail, false)
    }

    pub fn hanging_provision() -> Self {
        Self::with_mode(ProvisionMode::Hang, false)
    }

    pub fn slow_provision(delay: Duration) -> Self {
        Self::with_mode(ProvisionMode::Slow(delay), false)
    }

    pub fn failing_terminate() -> Self {
        Self::with_mode(ProvisionMode::Succeed, true)
    }

    pub fn specs(&self) -> Vec<WorkerSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn provision_calls(&self) -> usize {
        self.specs.lock().unwrap().len()
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminated.lock().unwrap().len()
    }

    /// Every worker a teardown was requested for, in call order.
    pub fn terminated(&self) -> Vec<WorkerRef> {
        self.terminated.lock().unwrap().clone()
    }

    /// Resolves once a provision call has begun.
    pub async fn provision_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn provision(&self, spec: WorkerSpec) -> Result<WorkerRef> {
        let build_id = spec.build_id;
        self.specs.lock().unwrap().push(spec);
        self.started.notify_one();
        match self.mode {
            ProvisionMode::Succeed => {}
            ProvisionMode::Fail => {
                return Err(Error::ProvisioningFailed("no capacity".to_string()));
            }
            ProvisionMode::Hang => tokio::time::sleep(Duration::from_secs(3600)).await,
            ProvisionMode::Slow(delay) => tokio::time::sleep(delay).await,
        }
        Ok(WorkerRef {
            build_id,
            instance_id: format!("mock-{}", build_id.simple()),
            provisioner: "mock".to_string(),
        })
    }

    async fn terminate(&self, worker: &WorkerRef) -> Result<()> {
        self.terminated.lock().unwrap().push(worker.clone());
        if self.fail_terminate {
            return Err(Error::ProvisioningFailed("api unreachable".to_string()));
        }
        Ok(())
    }
}

fn unavailable() -> DbError {
    DbError::Database(sqlx::Error::PoolTimedOut)
}

/// In-memory build repository whose writes can be made to fail.
#[derive(Default)]
pub(crate) struct FaultyRepo {
    inner: MemoryBuildRepo,
    undeletable: Mutex<HashSet<BuildId>>,
    /// Compare-and-swaps still allowed to succeed; `None` is unlimited.
    cas_budget: Mutex<Option<usize>>,
}

impl FaultyRepo {
    /// Make every delete of `id` fail.
    pub fn refuse_delete(&self, id: BuildId) {
        self.undeletable.lock().unwrap().insert(id);
    }

    /// Let `n` more compare-and-swaps through, then fail the rest.
    pub fn fail_writes_after(&self, n: usize) {
        *self.cas_budget.lock().unwrap() = Some(n);
    }

    /// Clear all injected failures.
    pub fn heal(&self) {
        self.undeletable.lock().unwrap().clear();
        *self.cas_budget.lock().unwrap() = None;
    }
}

#[async_trait]
impl BuildRepo for FaultyRepo {
    async fn admit(&self, build: &Build, limits: &AdmissionLimits) -> DbResult<Admission> {
        self.inner.admit(build, limits).await
    }

    async fn get(&self, id: BuildId) -> DbResult<Build> {
        self.inner.get(id).await
    }

    async fn compare_and_swap(&self, build: &Build) -> DbResult<Build> {
        if let Some(budget) = self.cas_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return Err(unavailable());
            }
            *budget -= 1;
        }
        self.inner.compare_and_swap(build).await
    }

    async fn list_active(&self) -> DbResult<Vec<Build>> {
        self.inner.list_active().await
    }

    async fn list_by_requester(&self, requester: &str, limit: i64) -> DbResult<Vec<Build>> {
        self.inner.list_by_requester(requester, limit).await
    }

    async fn count_active(&self) -> DbResult<u32> {
        self.inner.count_active().await
    }

    async fn list_finished_before(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<Build>> {
        self.inner.list_finished_before(cutoff).await
    }

    async fn list_terminal_with_worker(&self) -> DbResult<Vec<Build>> {
        self.inner.list_terminal_with_worker().await
    }

    async fn delete(&self, id: BuildId) -> DbResult<()> {
        if self.undeletable.lock().unwrap().contains(&id) {
            return Err(unavailable());
        }
        self.inner.delete(id).await
    }

    async fn ping(&self) -> DbResult<()> {
        self.inner.ping().await
    }
}

/// All scheduler components over in-memory backends.
pub(crate) struct Harness {
    pub repo: Arc<FaultyRepo>,
    pub channel: Arc<MemoryStatusChannel>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub provisioner: Arc<MockProvisioner>,
    pub signer: Arc<Signer>,
    pub service: Arc<BuildService>,
    pub admission: Arc<AdmissionController>,
    pub launcher: Arc<WorkerLauncher>,
    pub ingestor: Arc<Ingestor>,
    pub monitor: Arc<Monitor>,
    pub retention: Arc<Retention>,
    pub delivery: Arc<Delivery>,
    pub cleanup: Arc<CleanupManager>,
    requesters: AtomicUsize,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(MockProvisioner::new(), test_config())
    }

    pub fn with_provisioner(provisioner: MockProvisioner) -> Self {
        Self::build(provisioner, test_config())
    }

    pub fn with_limits(max_active: u32, quota: u32) -> Self {
        let mut config = test_config();
        config.admission.max_active_builds = max_active;
        config.admission.requester_quota = quota;
        Self::build(MockProvisioner::new(), config)
    }

    fn build(provisioner: MockProvisioner, config: SystemConfig) -> Self {
        let repo = Arc::new(FaultyRepo::default());
        let channel = Arc::new(MemoryStatusChannel::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let provisioner = Arc::new(provisioner);
        let signer = Arc::new(Signer::new("test-secret").unwrap());
        let catalog = Arc::new(Catalog::builtin().unwrap());

        let backends = Backends {
            repo: repo.clone(),
            channel: channel.clone(),
            artifacts: artifacts.clone(),
            provisioner: provisioner.clone(),
        };
        let scheduler = Scheduler::assemble(backends, signer.clone(), catalog, &config);

        Self {
            repo,
            channel,
            artifacts,
            provisioner,
            signer,
            service: scheduler.service,
            admission: scheduler.admission,
            launcher: scheduler.launcher,
            ingestor: scheduler.ingestor,
            monitor: scheduler.monitor,
            retention: scheduler.retention,
            delivery: scheduler.delivery,
            cleanup: scheduler.cleanup,
            requesters: AtomicUsize::new(0),
        }
    }

    /// An admitted build with a bound worker, in `provisioning`.
    pub async fn running_build(&self) -> Build {
        let n = self.requesters.fetch_add(1, Ordering::SeqCst);
        let build = self
            .admission
            .admit(&request(&format!("tester{n}"), &["ollama"]), Utc::now())
            .await
            .unwrap();
        let build = self.launcher.launch(build.id).await.unwrap();
        assert!(build.worker.is_some());
        build
    }

    /// A completed build whose artifact holds `data`, worker cleaned up.
    pub async fn completed_build(&self, data: &[u8]) -> Build {
        let build = self.running_build().await;
        self.artifacts
            .insert(build.id, "image.iso", Bytes::copy_from_slice(data))
            .await;
        self.report(build.id, 100, Utc::now()).await;
        let done = self
            .ingestor
            .ingest(&build, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(done.is_terminal());
        done
    }

    /// Force a terminal failure without cleanup.
    pub async fn fail(&self, id: BuildId, reason: FailureReason) -> Build {
        modify_build(self.repo.as_ref(), id, |b| {
            b.fail(reason, "test failure", Utc::now()).ok()
        })
        .await
        .unwrap()
        .into_build()
    }

    /// Write a worker status record.
    pub async fn report(&self, id: BuildId, progress: u8, at: DateTime<Utc>) {
        let record = StatusRecord {
            stage: format!("Step at {progress}%"),
            progress,
            message: format!("progress {progress}"),
            timestamp: at,
            phase: None,
            artifact: None,
            error: None,
        };
        self.channel.publish(id, &record).await.unwrap();
    }
}

fn test_config() -> SystemConfig {
    let mut config = SystemConfig::default();
    config.admission.max_active_builds = 100;
    config.admission.requester_quota = 100;
    config.worker.provision_timeout = Duration::from_millis(200);
    config.worker.terminate_timeout = Duration::from_millis(200);
    config
}

