//! Kubernetes provisioner implementation.
//!
//! Each worker is a bare pod with `restartPolicy: Never`. The artifact
//! directory comes either from a shared PersistentVolumeClaim (mounted with
//! the build id as sub-path) or, on single-node clusters, from a host path.

use async_trait::async_trait;
use isoforge_core::provisioner::*;
use isoforge_core::{Error, Result};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::{WorkerResources, worker_labels, worker_name};

const ARTIFACT_VOLUME: &str = "artifacts";

/// Kubernetes-based worker provisioner.
pub struct KubernetesProvisioner {
    client: Client,
    namespace: String,
    resources: WorkerResources,
    artifact_claim: Option<String>,
}

impl KubernetesProvisioner {
    pub async fn new(
        namespace: impl Into<String>,
        resources: WorkerResources,
        artifact_claim: Option<String>,
    ) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(client, namespace, resources, artifact_claim))
    }

    pub fn with_client(
        client: Client,
        namespace: impl Into<String>,
        resources: WorkerResources,
        artifact_claim: Option<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            resources,
            artifact_claim,
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Render the pod for a worker.
pub fn worker_pod(
    spec: &WorkerSpec,
    resources: &WorkerResources,
    artifact_claim: Option<&str>,
) -> Pod {
    let env = spec
        .env()
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect();

    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(resources.cpus.to_string()));
    limits.insert(
        "memory".to_string(),
        Quantity(format!("{}Mi", resources.memory_mb)),
    );
    if spec.config.gpu {
        limits.insert("nvidia.com/gpu".to_string(), Quantity("1".to_string()));
    }

    let (volume, sub_path) = match artifact_claim {
        Some(claim) => (
            Volume {
                name: ARTIFACT_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: Some(false),
                }),
                ..Default::default()
            },
            Some(spec.build_id.to_string()),
        ),
        None => (
            Volume {
                name: ARTIFACT_VOLUME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: spec.artifact_dir.clone(),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            },
            None,
        ),
    };

    let container = Container {
        name: "worker".to_string(),
        image: Some(resources.image.clone()),
        env: Some(env),
        resources: Some(ResourceRequirements {
            requests: Some(limits.clone()),
            limits: Some(limits),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: ARTIFACT_VOLUME.to_string(),
            mount_path: WORKER_ARTIFACT_MOUNT.to_string(),
            sub_path,
            ..Default::default()
        }]),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(worker_name(&spec.build_id)),
            labels: Some(worker_labels(spec).into_iter().collect()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![container],
            volumes: Some(vec![volume]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl Provisioner for KubernetesProvisioner {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn provision(&self, spec: WorkerSpec) -> Result<WorkerRef> {
        let pod = worker_pod(&spec, &self.resources, self.artifact_claim.as_deref());
        let name = worker_name(&spec.build_id);

        info!(build_id = %spec.build_id, pod = %name, namespace = %self.namespace, "Creating worker pod");
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| Error::ProvisioningFailed(format!("Failed to create pod: {}", e)))?;

        Ok(WorkerRef {
            build_id: spec.build_id,
            instance_id: name,
            provisioner: self.name().to_string(),
        })
    }

    async fn terminate(&self, worker: &WorkerRef) -> Result<()> {
        match self
            .pods()
            .delete(&worker.instance_id, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                info!(build_id = %worker.build_id, pod = %worker.instance_id, "Deleted worker pod");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(pod = %worker.instance_id, "Worker pod already gone");
                Ok(())
            }
            Err(e) => Err(Error::ProvisioningFailed(format!(
                "Failed to delete pod: {}",
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isoforge_core::{BuildConfig, BuildId};

    fn make_test_spec(gpu: bool) -> WorkerSpec {
        WorkerSpec {
            build_id: BuildId::new(),
            config: BuildConfig {
                services: vec!["ollama".to_string()],
                models: vec![],
                gpu,
                requester: "alice".to_string(),
                image_name: "homelab".to_string(),
            },
            channel: ChannelCoordinates {
                url: "http://isoforge.svc/channel/v1/builds/x/status".to_string(),
                token: "token".to_string(),
            },
            artifact_dir: "/data/artifacts/x".to_string(),
            parallelism: 8,
        }
    }

    fn container(pod: &Pod) -> &Container {
        &pod.spec.as_ref().unwrap().containers[0]
    }

    #[test]
    fn test_pod_never_restarts() {
        let spec = make_test_spec(false);
        let pod = worker_pod(&spec, &WorkerResources::default(), None);
        assert_eq!(
            pod.spec.as_ref().unwrap().restart_policy.as_deref(),
            Some("Never")
        );
        assert_eq!(
            pod.metadata.name.as_deref(),
            Some(worker_name(&spec.build_id).as_str())
        );
    }

    #[test]
    fn test_pod_env_matches_payload() {
        let spec = make_test_spec(false);
        let pod = worker_pod(&spec, &WorkerResources::default(), None);
        let env = container(&pod).env.as_ref().unwrap();
        let payload = spec.env();
        assert_eq!(env.len(), payload.len());
        for var in env {
            assert_eq!(var.value.as_deref(), payload.get(&var.name).map(String::as_str));
        }
    }

    #[test]
    fn test_claim_mount_uses_build_sub_path() {
        let spec = make_test_spec(false);
        let pod = worker_pod(&spec, &WorkerResources::default(), Some("isoforge-artifacts"));
        let mount = &container(&pod).volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, WORKER_ARTIFACT_MOUNT);
        assert_eq!(mount.sub_path, Some(spec.build_id.to_string()));

        let volume = &pod.spec.as_ref().unwrap().volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "isoforge-artifacts"
        );
    }

    #[test]
    fn test_host_path_mount_without_claim() {
        let spec = make_test_spec(false);
        let pod = worker_pod(&spec, &WorkerResources::default(), None);
        let volume = &pod.spec.as_ref().unwrap().volumes.as_ref().unwrap()[0];
        assert_eq!(volume.host_path.as_ref().unwrap().path, "/data/artifacts/x");
        assert!(container(&pod).volume_mounts.as_ref().unwrap()[0].sub_path.is_none());
    }

    #[test]
    fn test_gpu_limit_only_for_gpu_builds() {
        let resources = WorkerResources::default();
        let cpu_pod = worker_pod(&make_test_spec(false), &resources, None);
        let limits = container(&cpu_pod).resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert!(!limits.contains_key("nvidia.com/gpu"));
        assert_eq!(limits["memory"], Quantity("8192Mi".to_string()));

        let gpu_pod = worker_pod(&make_test_spec(true), &resources, None);
        let limits = container(&gpu_pod).resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["nvidia.com/gpu"], Quantity("1".to_string()));
    }
}
