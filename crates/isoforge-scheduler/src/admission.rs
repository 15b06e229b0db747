//! Admission: validation plus the active-build ceiling and requester quota.

use chrono::{DateTime, Utc};
use isoforge_config::{AdmissionConfig, BuildRequest, ValidationError, Validator};
use isoforge_core::Build;
use isoforge_db::{Admission, AdmissionLimits, BuildRepo, DbError};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::to_chrono;

/// Why a request did not produce a build.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("active build ceiling reached ({active}/{ceiling})")]
    CeilingReached { active: u32, ceiling: u32 },

    #[error("requester quota exceeded ({recent} of {quota} builds in the current window)")]
    QuotaExceeded { recent: u32, quota: u32 },

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl AdmissionError {
    /// Machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::Invalid(_) => "validation",
            AdmissionError::CeilingReached { .. } => "ceiling_reached",
            AdmissionError::QuotaExceeded { .. } => "quota_exceeded",
            AdmissionError::Storage(_) => "storage",
        }
    }
}

/// Turns requests into queued builds.
pub struct AdmissionController {
    repo: Arc<dyn BuildRepo>,
    validator: Validator,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(repo: Arc<dyn BuildRepo>, validator: Validator, config: AdmissionConfig) -> Self {
        Self {
            repo,
            validator,
            config,
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Validate a request and store it as a `queued` build if limits allow.
    ///
    /// Nothing is stored when validation or admission fails.
    pub async fn admit(
        &self,
        request: &BuildRequest,
        now: DateTime<Utc>,
    ) -> Result<Build, AdmissionError> {
        let config = self.validator.validate(request)?;
        let estimate = self.validator.estimate_secs(&config);
        let build = Build::new(config, estimate, now);

        let limits = AdmissionLimits {
            max_active: self.config.max_active_builds,
            requester_quota: self.config.requester_quota,
            quota_since: now - to_chrono(self.config.quota_window),
        };

        match self.repo.admit(&build, &limits).await? {
            Admission::Admitted => {
                info!(
                    build_id = %build.id,
                    requester = %build.config.requester,
                    services = ?build.config.services,
                    models = ?build.config.models,
                    "Build admitted"
                );
                Ok(build)
            }
            Admission::CeilingReached { active, ceiling } => {
                Err(AdmissionError::CeilingReached { active, ceiling })
            }
            Admission::QuotaExceeded { recent, quota } => {
                Err(AdmissionError::QuotaExceeded { recent, quota })
            }
        }
    }
}
