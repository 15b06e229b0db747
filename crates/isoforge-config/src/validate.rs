//! Build request validation and normalization.
//!
//! Validation is pure: it either produces a closed [`BuildConfig`] or an
//! error, and never touches storage or compute.

use isoforge_core::BuildConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

use crate::Catalog;

// Service and model ids: lowercase alphanumerics plus `._:-`, at most 64 chars.
static IDENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._:-]{0,63}$").unwrap());

static REQUESTER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._@-]{0,127}$").unwrap());

static IMAGE_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9 ._-]{1,64}$").unwrap());

/// A build request as submitted by a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRequest {
    pub services: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub gpu: bool,
    pub requester: String,
    pub image_name: String,
}

/// Why a request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed {field} identifier: {value:?}")]
    Malformed { field: &'static str, value: String },

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("at least one service must be selected")]
    NoServices,

    #[error("model {0} requires a GPU build")]
    GpuRequired(String),

    #[error("invalid requester identity: {0:?}")]
    InvalidRequester(String),

    #[error("invalid image name: {0:?}")]
    InvalidImageName(String),
}

/// Checks requests against the catalog and closes them under dependencies.
#[derive(Debug, Clone)]
pub struct Validator {
    catalog: Arc<Catalog>,
}

impl Validator {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Validate a request and return its normalized configuration.
    pub fn validate(&self, request: &BuildRequest) -> Result<BuildConfig, ValidationError> {
        if !REQUESTER_REGEX.is_match(&request.requester) {
            return Err(ValidationError::InvalidRequester(request.requester.clone()));
        }
        if !IMAGE_NAME_REGEX.is_match(&request.image_name) || request.image_name.trim().is_empty()
        {
            return Err(ValidationError::InvalidImageName(request.image_name.clone()));
        }
        if request.services.is_empty() {
            return Err(ValidationError::NoServices);
        }

        for service in &request.services {
            check_ident("service", service)?;
            if self.catalog.service(service).is_none() {
                return Err(ValidationError::UnknownService(service.clone()));
            }
        }

        let mut models = BTreeSet::new();
        let mut roots: Vec<&str> = request.services.iter().map(String::as_str).collect();
        for model in &request.models {
            check_ident("model", model)?;
            let entry = self
                .catalog
                .model(model)
                .ok_or_else(|| ValidationError::UnknownModel(model.clone()))?;
            if entry.requires_gpu && !request.gpu {
                return Err(ValidationError::GpuRequired(model.clone()));
            }
            if let Some(service) = &entry.requires_service {
                roots.push(service.as_str());
            }
            models.insert(model.clone());
        }

        let services = self.catalog.closure(roots);

        Ok(BuildConfig {
            services: services.into_iter().collect(),
            models: models.into_iter().collect(),
            gpu: request.gpu,
            requester: request.requester.clone(),
            image_name: request.image_name.trim().to_string(),
        })
    }

    /// Estimated duration of a normalized configuration, in seconds.
    pub fn estimate_secs(&self, config: &BuildConfig) -> u64 {
        self.catalog
            .estimate_secs(&config.services, &config.models, config.gpu)
    }
}

fn check_ident(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if IDENT_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::Malformed {
            field,
            value: value.to_string(),
        })
    }
}
