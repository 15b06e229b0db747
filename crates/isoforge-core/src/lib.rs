//! Core domain types and traits for isoforge.
//!
//! This crate contains:
//! - Build identifiers and the build record with its state machine
//! - Status channel records and the channel trait
//! - Worker provisioner trait and startup payload
//! - Artifact storage abstraction
//! - HMAC signing for channel tokens and download URLs

pub mod artifact;
pub mod build;
pub mod channel;
pub mod error;
pub mod id;
pub mod provisioner;
pub mod signing;

pub use build::{Build, BuildConfig, BuildError, BuildStatus, FailureReason};
pub use error::{Error, Result};
pub use id::BuildId;
