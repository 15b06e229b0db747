//! Local Docker provisioner implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use futures::StreamExt;
use isoforge_core::provisioner::*;
use isoforge_core::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::{WorkerResources, worker_labels, worker_name};

/// Runs each build worker as a container on the local Docker daemon.
pub struct DockerProvisioner {
    docker: Docker,
    resources: WorkerResources,
}

impl DockerProvisioner {
    /// Connect to the local Docker daemon.
    pub fn new(resources: WorkerResources) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker, resources })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, resources: WorkerResources) -> Self {
        Self { docker, resources }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::ProvisioningFailed(format!("docker unavailable: {e}")))
    }

    fn container_config(&self, spec: &WorkerSpec) -> Config<String> {
        let env: Vec<String> = spec
            .env()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let device_requests = spec.config.gpu.then(|| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.artifact_dir, WORKER_ARTIFACT_MOUNT
            )]),
            nano_cpus: Some(i64::from(self.resources.cpus) * 1_000_000_000),
            memory: Some(i64::from(self.resources.memory_mb) * 1024 * 1024),
            device_requests,
            ..Default::default()
        };

        Config {
            image: Some(self.resources.image.clone()),
            env: Some(env),
            labels: Some(worker_labels(spec).into_iter().collect::<HashMap<_, _>>()),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn pull_image(&self) {
        info!(image = %self.resources.image, "Pulling worker image");
        let options = CreateImageOptions {
            from_image: self.resources.image.clone(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }

    /// Remove a container that was created but never started.
    async fn discard(&self, container: &str) {
        if let Err(e) = self.docker.remove_container(container, Some(force_remove())).await {
            warn!(container = %container, error = %e, "Failed to remove unstarted container");
        }
    }
}

fn force_remove() -> RemoveContainerOptions {
    RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, spec: WorkerSpec) -> Result<WorkerRef> {
        let container_name = worker_name(&spec.build_id);
        self.pull_image().await;

        let config = self.container_config(&spec);
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(build_id = %spec.build_id, container = %container_name, "Creating worker container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| {
                Error::ProvisioningFailed(format!("Failed to create container: {}", e))
            })?;

        info!(build_id = %spec.build_id, container = %container_name, "Starting worker container");
        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.discard(&container.id).await;
            return Err(Error::ProvisioningFailed(format!(
                "Failed to start container: {}",
                e
            )));
        }

        Ok(WorkerRef {
            build_id: spec.build_id,
            instance_id: container.id,
            provisioner: self.name().to_string(),
        })
    }

    async fn terminate(&self, worker: &WorkerRef) -> Result<()> {
        match self
            .docker
            .remove_container(&worker.instance_id, Some(force_remove()))
            .await
        {
            Ok(()) => {
                info!(build_id = %worker.build_id, container = %worker.instance_id, "Removed worker container");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(container = %worker.instance_id, "Worker container already gone");
                Ok(())
            }
            Err(e) => Err(Error::ProvisioningFailed(format!(
                "Failed to remove container: {}",
                e
            ))),
        }
    }
}
