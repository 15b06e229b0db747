//! Build scheduling for isoforge.
//!
//! Admits build requests, provisions one worker per build, ingests worker
//! status from the channel, and enforces stall, timeout, cleanup and
//! retention rules. Every build mutation goes through a compare-and-swap
//! retry loop, so the background loops and request handlers may race freely.

pub mod admission;
pub mod cleanup;
pub mod delivery;
pub mod ingest;
pub mod launch;
pub mod monitor;
pub mod retention;
pub mod service;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::{AdmissionController, AdmissionError};
pub use cleanup::CleanupManager;
pub use delivery::{Delivery, DeliveryError, DownloadGrant};
pub use ingest::Ingestor;
pub use launch::{LaunchSettings, WorkerLauncher};
pub use monitor::Monitor;
pub use retention::{Retention, RetentionReport};
pub use service::{Backends, BuildService, Scheduler};
pub use worker::{BackgroundLoops, LoopIntervals};

/// Convert a configured duration, saturating on overflow.
pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
