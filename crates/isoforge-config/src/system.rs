//! System configuration parsing.
//!
//! Every section is optional; missing values fall back to defaults.
//!
//! ```kdl
//! admission {
//!     max-active-builds 8
//!     requester-quota 3
//!     quota-window "1h"
//! }
//! monitor {
//!     interval "30s"
//!     ingest-interval "5s"
//!     stall-threshold "20m"
//!     max-build-duration "3h"
//! }
//! worker {
//!     provisioner "docker"
//!     image "ghcr.io/isoforge/worker:latest"
//!     cpus 4
//!     launch-interval "15s"
//! }
//! ```

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::kdl_util::{first_string_arg, u32_arg};
use crate::{ConfigError, ConfigResult};

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub admission: AdmissionConfig,
    pub monitor: MonitorConfig,
    pub worker: WorkerConfig,
    pub delivery: DeliveryConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Ceiling on builds in non-terminal states.
    pub max_active_builds: u32,
    /// Builds a single requester may create per `quota_window`.
    pub requester_quota: u32,
    pub quota_window: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_active_builds: 8,
            requester_quota: 3,
            quota_window: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Period of the stall/timeout sweep.
    pub interval: Duration,
    /// Period of status channel polling.
    pub ingest_interval: Duration,
    pub stall_threshold: Duration,
    pub max_build_duration: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            ingest_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(20 * 60),
            max_build_duration: Duration::from_secs(3 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerKind {
    Docker,
    Kubernetes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub provisioner: ProvisionerKind,
    /// Container image running the external build pipeline.
    pub image: String,
    pub cpus: u32,
    pub memory_mb: u32,
    /// Kubernetes namespace for worker pods.
    pub namespace: String,
    /// PersistentVolumeClaim holding artifacts (Kubernetes only).
    pub artifact_claim: Option<String>,
    pub provision_timeout: Duration,
    pub terminate_timeout: Duration,
    /// Period of the sweep that launches builds left in `queued`.
    pub launch_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            provisioner: ProvisionerKind::Docker,
            image: "ghcr.io/isoforge/worker:latest".to_string(),
            cpus: 4,
            memory_mb: 8192,
            namespace: "isoforge".to_string(),
            artifact_claim: None,
            provision_timeout: Duration::from_secs(120),
            terminate_timeout: Duration::from_secs(30),
            launch_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Externally reachable base URL of the API server.
    pub public_url: String,
    /// Lifetime of a download grant.
    pub url_ttl: Duration,
    /// How long finished builds and their artifacts are kept.
    pub retention: Duration,
    pub retention_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            public_url: "http://localhost:3000".to_string(),
            url_ttl: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            retention_interval: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the filesystem artifact store.
    pub artifact_root: PathBuf,
    /// Catalog file; the built-in catalog is used when unset.
    pub catalog: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("/var/lib/isoforge/artifacts"),
            catalog: None,
        }
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "admission" => parse_admission(node, &mut config.admission)?,
            "monitor" => parse_monitor(node, &mut config.monitor)?,
            "worker" => parse_worker(node, &mut config.worker)?,
            "delivery" => parse_delivery(node, &mut config.delivery)?,
            "storage" => parse_storage(node, &mut config.storage)?,
            _ => {} // Ignore unknown nodes
        }
    }

    if config.admission.max_active_builds == 0 {
        return Err(ConfigError::InvalidValue {
            field: "admission.max-active-builds".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    if config.monitor.stall_threshold > config.monitor.max_build_duration {
        return Err(ConfigError::InvalidValue {
            field: "monitor.stall-threshold".to_string(),
            message: "must not exceed max-build-duration".to_string(),
        });
    }

    Ok(config)
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: &std::path::Path) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

/// Parse a duration such as `"90s"`, `"15m"`, `"2h"` or `"1d"`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    let multiplier = match unit {
        "ms" => return Some(Duration::from_millis(amount)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return None,
    };
    amount.checked_mul(multiplier).map(Duration::from_secs)
}

fn children(node: &KdlNode) -> &[KdlNode] {
    node.children().map(|c| c.nodes()).unwrap_or(&[])
}

fn string_arg(node: &KdlNode, field: &str) -> ConfigResult<String> {
    first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn duration_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let raw = string_arg(node, field)?;
    parse_duration(&raw).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("cannot parse duration {raw:?}"),
    })
}

fn parse_admission(node: &KdlNode, admission: &mut AdmissionConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "max-active-builds" => {
                admission.max_active_builds = u32_arg(child, "admission.max-active-builds")?
            }
            "requester-quota" => {
                admission.requester_quota = u32_arg(child, "admission.requester-quota")?
            }
            "quota-window" => admission.quota_window = duration_arg(child, "admission.quota-window")?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_monitor(node: &KdlNode, monitor: &mut MonitorConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "interval" => monitor.interval = duration_arg(child, "monitor.interval")?,
            "ingest-interval" => {
                monitor.ingest_interval = duration_arg(child, "monitor.ingest-interval")?
            }
            "stall-threshold" => {
                monitor.stall_threshold = duration_arg(child, "monitor.stall-threshold")?
            }
            "max-build-duration" => {
                monitor.max_build_duration = duration_arg(child, "monitor.max-build-duration")?
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_worker(node: &KdlNode, worker: &mut WorkerConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "provisioner" => {
                let kind = string_arg(child, "worker.provisioner")?;
                worker.provisioner = match kind.as_str() {
                    "docker" => ProvisionerKind::Docker,
                    "kubernetes" | "k8s" => ProvisionerKind::Kubernetes,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            field: "worker.provisioner".to_string(),
                            message: format!("unknown provisioner: {other}"),
                        });
                    }
                };
            }
            "image" => worker.image = string_arg(child, "worker.image")?,
            "cpus" => worker.cpus = u32_arg(child, "worker.cpus")?,
            "memory-mb" => worker.memory_mb = u32_arg(child, "worker.memory-mb")?,
            "namespace" => worker.namespace = string_arg(child, "worker.namespace")?,
            "artifact-claim" => {
                worker.artifact_claim = Some(string_arg(child, "worker.artifact-claim")?)
            }
            "provision-timeout" => {
                worker.provision_timeout = duration_arg(child, "worker.provision-timeout")?
            }
            "terminate-timeout" => {
                worker.terminate_timeout = duration_arg(child, "worker.terminate-timeout")?
            }
            "launch-interval" => {
                worker.launch_interval = duration_arg(child, "worker.launch-interval")?
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_delivery(node: &KdlNode, delivery: &mut DeliveryConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "public-url" => {
                delivery.public_url = string_arg(child, "delivery.public-url")?
                    .trim_end_matches('/')
                    .to_string()
            }
            "url-ttl" => delivery.url_ttl = duration_arg(child, "delivery.url-ttl")?,
            "retention" => delivery.retention = duration_arg(child, "delivery.retention")?,
            "retention-interval" => {
                delivery.retention_interval = duration_arg(child, "delivery.retention-interval")?
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_storage(node: &KdlNode, storage: &mut StorageConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "artifact-root" => {
                storage.artifact_root = PathBuf::from(string_arg(child, "storage.artifact-root")?)
            }
            "catalog" => storage.catalog = Some(PathBuf::from(string_arg(child, "storage.catalog")?)),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config.admission.max_active_builds, 8);
        assert_eq!(config.worker.provisioner, ProvisionerKind::Docker);
        assert_eq!(config.monitor.stall_threshold, Duration::from_secs(1200));
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            admission {
                max-active-builds 2
                requester-quota 1
                quota-window "30m"
            }
            monitor {
                interval "10s"
                stall-threshold "5m"
                max-build-duration "1h"
            }
            worker {
                provisioner "kubernetes"
                image "registry.local/worker:1.2"
                cpus 8
                namespace "builds"
                artifact-claim "isoforge-artifacts"
                provision-timeout "45s"
                launch-interval "1m"
            }
            delivery {
                public-url "https://forge.example.com/"
                url-ttl "15m"
                retention "2d"
            }
            storage {
                artifact-root "/srv/artifacts"
            }
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.admission.max_active_builds, 2);
        assert_eq!(config.admission.requester_quota, 1);
        assert_eq!(config.admission.quota_window, Duration::from_secs(1800));
        assert_eq!(config.monitor.interval, Duration::from_secs(10));
        assert_eq!(config.worker.provisioner, ProvisionerKind::Kubernetes);
        assert_eq!(config.worker.cpus, 8);
        assert_eq!(
            config.worker.artifact_claim.as_deref(),
            Some("isoforge-artifacts")
        );
        assert_eq!(config.worker.provision_timeout, Duration::from_secs(45));
        assert_eq!(config.worker.launch_interval, Duration::from_secs(60));
        assert_eq!(config.delivery.public_url, "https://forge.example.com");
        assert_eq!(config.delivery.retention, Duration::from_secs(2 * 86400));
        assert_eq!(config.storage.artifact_root, PathBuf::from("/srv/artifacts"));
    }

    #[test]
    fn test_unknown_provisioner_rejected() {
        let result = parse_system_config(r#"worker { provisioner "lambda"; }"#);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let result = parse_system_config("admission { max-active-builds 0; }");
        assert!(result.is_err());
    }

    #[test]
    fn test_stall_threshold_bounded_by_ceiling() {
        let result = parse_system_config(
            r#"monitor { stall-threshold "2h"; max-build-duration "1h"; }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration("5 weeks"), None);
    }
}
