//! Worker provisioner trait and the worker startup payload.
//!
//! Provisioners create exactly one ephemeral compute instance per build and
//! destroy it again. The worker learns everything it needs from the
//! environment rendered by [`WorkerSpec::env`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{BuildConfig, BuildId, Result};

/// Lower bound of the worker's internal fetch parallelism.
pub const MIN_PARALLELISM: u32 = 2;
/// Upper bound of the worker's internal fetch parallelism.
pub const MAX_PARALLELISM: u32 = 16;

/// Mount point of the artifact directory inside every worker.
pub const WORKER_ARTIFACT_MOUNT: &str = "/artifacts";

/// Name shared by the container or pod of a build's worker.
///
/// Backends accept it wherever they accept their own instance IDs, so a
/// worker can be addressed before its creation call has returned.
pub fn worker_name(build_id: &BuildId) -> String {
    format!("isoforge-worker-{}", build_id.simple())
}

/// Fetch parallelism hint for a worker with `cpus` cores.
pub fn fetch_parallelism(cpus: u32) -> u32 {
    cpus.saturating_mul(2).clamp(MIN_PARALLELISM, MAX_PARALLELISM)
}

/// Where and how a worker writes its status records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelCoordinates {
    pub url: String,
    /// Bearer token scoped to this build.
    pub token: String,
}

/// Everything needed to start the worker for one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub build_id: BuildId,
    pub config: BuildConfig,
    pub channel: ChannelCoordinates,
    /// Backend location of the build's artifact directory, mounted at
    /// [`WORKER_ARTIFACT_MOUNT`].
    pub artifact_dir: String,
    pub parallelism: u32,
}

impl WorkerSpec {
    /// Render the startup payload as environment variables.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("ISOFORGE_BUILD_ID".to_string(), self.build_id.to_string());
        env.insert("ISOFORGE_SERVICES".to_string(), self.config.services.join(","));
        env.insert("ISOFORGE_MODELS".to_string(), self.config.models.join(","));
        env.insert("ISOFORGE_GPU".to_string(), self.config.gpu.to_string());
        env.insert(
            "ISOFORGE_IMAGE_NAME".to_string(),
            self.config.image_name.clone(),
        );
        env.insert("ISOFORGE_STATUS_URL".to_string(), self.channel.url.clone());
        env.insert("ISOFORGE_STATUS_TOKEN".to_string(), self.channel.token.clone());
        env.insert(
            "ISOFORGE_ARTIFACT_PATH".to_string(),
            WORKER_ARTIFACT_MOUNT.to_string(),
        );
        env.insert(
            "ISOFORGE_PARALLELISM".to_string(),
            self.parallelism.to_string(),
        );
        env
    }
}

/// Handle to a provisioned worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRef {
    pub build_id: BuildId,
    /// Backend-specific identifier (container ID, pod name).
    pub instance_id: String,
    /// Name of the provisioner that created the worker.
    pub provisioner: String,
}

impl WorkerRef {
    /// Reference a build's worker by its deterministic name.
    pub fn named(build_id: BuildId, provisioner: &str) -> Self {
        Self {
            build_id,
            instance_id: worker_name(&build_id),
            provisioner: provisioner.to_string(),
        }
    }
}

/// Trait for worker provisioning backends.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Name of this provisioner.
    fn name(&self) -> &'static str;

    /// Create and start the worker for a build.
    async fn provision(&self, spec: WorkerSpec) -> Result<WorkerRef>;

    /// Destroy a worker. Deleting a worker that no longer exists succeeds.
    async fn terminate(&self, worker: &WorkerRef) -> Result<()>;
}
