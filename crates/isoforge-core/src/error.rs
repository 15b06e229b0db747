//! Error types for isoforge.

use thiserror::Error;

use crate::build::BuildStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: BuildStatus, to: BuildStatus },

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
