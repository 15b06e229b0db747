//! KDL configuration and request validation for isoforge.
//!
//! This crate handles:
//! - The service/model catalog (allow-list plus dependency graph)
//! - System configuration (`isoforge.kdl`)
//! - Validation and normalization of build requests

pub mod catalog;
pub mod error;
mod kdl_util;
pub mod system;
pub mod validate;

pub use catalog::{Catalog, ModelEntry, ServiceEntry};
pub use error::{ConfigError, ConfigResult};
pub use system::{
    AdmissionConfig, DeliveryConfig, MonitorConfig, ProvisionerKind, StorageConfig, SystemConfig,
    WorkerConfig,
};
pub use validate::{BuildRequest, ValidationError, Validator};
