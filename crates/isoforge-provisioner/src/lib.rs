//! Worker provisioning backends for isoforge.
//!
//! Provides provisioner implementations that start one build worker each:
//! - Kubernetes (production)
//! - Local Docker (development and single-host deployments)

pub mod docker;
pub mod kubernetes;

pub use docker::DockerProvisioner;
pub use isoforge_core::provisioner::{
    ChannelCoordinates, Provisioner, WORKER_ARTIFACT_MOUNT, WorkerRef, WorkerSpec, worker_name,
};
pub use kubernetes::KubernetesProvisioner;

use serde::{Deserialize, Serialize};

/// Image and resources every worker gets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResources {
    pub image: String,
    pub cpus: u32,
    pub memory_mb: u32,
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            image: "ghcr.io/isoforge/worker:latest".to_string(),
            cpus: 4,
            memory_mb: 8192,
        }
    }
}

/// Labels attached to every worker.
pub fn worker_labels(spec: &WorkerSpec) -> Vec<(String, String)> {
    vec![
        ("app.kubernetes.io/managed-by".to_string(), "isoforge".to_string()),
        ("isoforge.dev/build-id".to_string(), spec.build_id.to_string()),
    ]
}
