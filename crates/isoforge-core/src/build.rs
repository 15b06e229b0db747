//! The build record and its lifecycle state machine.
//!
//! A build moves `queued → provisioning → preparing → building → uploading →
//! completed`. `failed` and `cancelled` can be reached from every non-terminal
//! state. Terminal states are final: no mutation method touches a terminal
//! build.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::artifact::ArtifactRef;
use crate::channel::{StatusRecord, WorkerPhase};
use crate::provisioner::WorkerRef;
use crate::{BuildId, Error, Result};

/// Maximum number of worker log lines retained per build.
pub const MAX_LOG_LINES: usize = 500;

/// Sub-second digits kept of a report timestamp, matching Postgres `TIMESTAMPTZ`.
pub const REPORT_TIMESTAMP_DIGITS: u16 = 6;

/// Lifecycle state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Provisioning,
    Preparing,
    Building,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl BuildStatus {
    /// All non-terminal states.
    pub const ACTIVE: [BuildStatus; 5] = [
        BuildStatus::Queued,
        BuildStatus::Provisioning,
        BuildStatus::Preparing,
        BuildStatus::Building,
        BuildStatus::Uploading,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Provisioning => "provisioning",
            BuildStatus::Preparing => "preparing",
            BuildStatus::Building => "building",
            BuildStatus::Uploading => "uploading",
            BuildStatus::Completed => "completed",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        }
    }

    /// Position on the happy path. The escapes have no position.
    fn rank(&self) -> Option<u8> {
        match self {
            BuildStatus::Queued => Some(0),
            BuildStatus::Provisioning => Some(1),
            BuildStatus::Preparing => Some(2),
            BuildStatus::Building => Some(3),
            BuildStatus::Uploading => Some(4),
            BuildStatus::Completed => Some(5),
            BuildStatus::Failed | BuildStatus::Cancelled => None,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Happy-path moves may skip intermediate states (a worker can report
    /// `building` without ever reporting `preparing`) but never go backward.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(current), Some(target)) => target > current,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(BuildStatus::Queued),
            "provisioning" => Ok(BuildStatus::Provisioning),
            "preparing" => Ok(BuildStatus::Preparing),
            "building" => Ok(BuildStatus::Building),
            "uploading" => Ok(BuildStatus::Uploading),
            "completed" => Ok(BuildStatus::Completed),
            "failed" => Ok(BuildStatus::Failed),
            "cancelled" => Ok(BuildStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown build status: {other}"))),
        }
    }
}

/// Machine-readable cause of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The worker could not be created.
    Provisioning,
    /// The worker reported a failure through the status channel.
    Execution,
    /// Progress did not advance within the stall threshold.
    Stalled,
    /// The build exceeded its absolute age ceiling.
    TimedOut,
    /// The worker reported completion but the artifact could not be read.
    Delivery,
    /// Cancelled on request.
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Provisioning => "provisioning",
            FailureReason::Execution => "execution",
            FailureReason::Stalled => "stalled",
            FailureReason::TimedOut => "timed_out",
            FailureReason::Delivery => "delivery",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure attached to `failed` and `cancelled` builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    pub reason: FailureReason,
    pub message: String,
}

/// A validated, dependency-closed build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Sorted, deduplicated service identifiers (dependency closure included).
    pub services: Vec<String>,
    /// Sorted, deduplicated model identifiers.
    pub models: Vec<String>,
    pub gpu: bool,
    pub requester: String,
    pub image_name: String,
}

/// What happened when a status record was offered to a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The build is terminal; nothing was applied.
    Terminal,
    /// The record was already ingested.
    Duplicate,
    /// The record carried lower progress than recorded and was discarded.
    Stale { recorded: u8, reported: u8 },
    /// Progress, stage and logs were applied.
    Applied {
        phase: WorkerPhase,
        status_changed: bool,
    },
}

/// A single image build tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub status: BuildStatus,
    pub config: BuildConfig,
    pub progress: u8,
    pub stage: String,
    pub logs: Vec<String>,
    pub worker: Option<WorkerRef>,
    pub artifact: Option<ArtifactRef>,
    pub error: Option<BuildError>,
    pub estimated_duration_secs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
    /// Timestamp of the last channel record that was ingested.
    pub last_report_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter, bumped by every stored update.
    pub version: i64,
}

impl Build {
    /// Create a freshly admitted build in `queued`.
    pub fn new(config: BuildConfig, estimated_duration_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: BuildId::new(),
            status: BuildStatus::Queued,
            config,
            progress: 0,
            stage: "Waiting for a worker".to_string(),
            logs: Vec::new(),
            worker: None,
            artifact: None,
            error: None,
            estimated_duration_secs,
            created_at: now,
            updated_at: now,
            last_progress_at: now,
            last_report_at: None,
            finished_at: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: BuildStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
        } else {
            self.last_progress_at = now;
        }
        Ok(())
    }

    /// Bind the provisioned worker. Only legal while `provisioning`.
    pub fn bind_worker(&mut self, worker: WorkerRef, now: DateTime<Utc>) -> Result<()> {
        if self.status != BuildStatus::Provisioning {
            return Err(Error::Conflict(format!(
                "build {} is {}, not provisioning",
                self.id, self.status
            )));
        }
        if let Some(existing) = &self.worker {
            return Err(Error::Conflict(format!(
                "build {} already bound to worker {}",
                self.id, existing.instance_id
            )));
        }
        self.stage = "Worker started".to_string();
        self.worker = Some(worker);
        self.updated_at = now;
        Ok(())
    }

    /// Force a terminal failure. `FailureReason::Cancelled` lands in
    /// `cancelled`, every other reason in `failed`.
    pub fn fail(
        &mut self,
        reason: FailureReason,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let next = match reason {
            FailureReason::Cancelled => BuildStatus::Cancelled,
            _ => BuildStatus::Failed,
        };
        self.transition(next, now)?;
        let message = message.into();
        self.stage = match reason {
            FailureReason::Cancelled => "Cancelled".to_string(),
            _ => format!("Failed: {reason}"),
        };
        self.error = Some(BuildError { reason, message });
        Ok(())
    }

    /// Record the produced artifact and finish the build.
    pub fn complete(&mut self, artifact: ArtifactRef, now: DateTime<Utc>) -> Result<()> {
        self.transition(BuildStatus::Completed, now)?;
        self.progress = 100;
        self.stage = "Completed".to_string();
        self.artifact = Some(artifact);
        Ok(())
    }

    /// Apply a worker status record.
    ///
    /// Progress, stage and log are updated; the status advances to the
    /// reported phase when that is a forward move. Terminal phases
    /// (`completed`, `failed`) are left to the caller, which has to check the
    /// artifact or record the failure.
    pub fn apply_report(&mut self, record: &StatusRecord, now: DateTime<Utc>) -> ReportOutcome {
        if self.is_terminal() {
            return ReportOutcome::Terminal;
        }
        // Stores keep microseconds; compare at that precision or a record
        // read back from one never matches what was recorded.
        let reported_at = record.timestamp.trunc_subsecs(REPORT_TIMESTAMP_DIGITS);
        if self.last_report_at.is_some_and(|seen| reported_at <= seen) {
            return ReportOutcome::Duplicate;
        }
        let phase = record.effective_phase();
        let mut reported = record.progress.min(100);
        if reported < self.progress {
            // A failure is applied whatever progress it carries.
            if phase != WorkerPhase::Failed {
                return ReportOutcome::Stale {
                    recorded: self.progress,
                    reported,
                };
            }
            reported = self.progress;
        }

        let mut advanced = reported > self.progress;
        let mut status_changed = false;

        if let Some(next) = phase.active_status() {
            if self.status.can_transition_to(next) {
                self.status = next;
                status_changed = true;
                advanced = true;
            }
        }

        self.progress = reported;
        if !record.stage.is_empty() {
            self.stage = record.stage.clone();
        }
        if !record.message.is_empty() {
            self.push_log(record.message.clone());
        }
        self.last_report_at = Some(reported_at);
        self.updated_at = now;
        if advanced {
            self.last_progress_at = now;
        }

        ReportOutcome::Applied {
            phase,
            status_changed,
        }
    }

    /// Append a log line, evicting the oldest past [`MAX_LOG_LINES`].
    pub fn push_log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
        if self.logs.len() > MAX_LOG_LINES {
            let excess = self.logs.len() - MAX_LOG_LINES;
            self.logs.drain(..excess);
        }
    }

    /// The last `n` log lines.
    pub fn recent_logs(&self, n: usize) -> &[String] {
        let start = self.logs.len().saturating_sub(n);
        &self.logs[start..]
    }
}
