//! Repository traits and implementations.

pub mod build;
pub mod status;

pub use build::{
    Admission, AdmissionLimits, BuildRepo, MAX_CAS_ATTEMPTS, Modified, PgBuildRepo, modify_build,
};
pub use status::PgStatusChannel;
