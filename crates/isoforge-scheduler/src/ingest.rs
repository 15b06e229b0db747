//! Status channel ingestion.
//!
//! Polls the channel record of every active build with a bound worker and
//! folds it into the build record. This is the only path by which a build
//! moves past `provisioning`.

use chrono::{DateTime, Utc};
use isoforge_core::artifact::{ArtifactStore, DEFAULT_ARTIFACT_FILE};
use isoforge_core::build::ReportOutcome;
use isoforge_core::channel::{StatusChannel, StatusRecord, WorkerPhase};
use isoforge_core::{Build, FailureReason, Result};
use isoforge_db::{BuildRepo, Modified, modify_build};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::CleanupManager;

pub struct Ingestor {
    repo: Arc<dyn BuildRepo>,
    channel: Arc<dyn StatusChannel>,
    artifacts: Arc<dyn ArtifactStore>,
    cleanup: Arc<CleanupManager>,
}

impl Ingestor {
    pub fn new(
        repo: Arc<dyn BuildRepo>,
        channel: Arc<dyn StatusChannel>,
        artifacts: Arc<dyn ArtifactStore>,
        cleanup: Arc<CleanupManager>,
    ) -> Self {
        Self {
            repo,
            channel,
            artifacts,
            cleanup,
        }
    }

    /// Ingest every active build. Returns how many builds changed.
    pub async fn ingest_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut changed = 0;
        for build in self.repo.list_active().await? {
            if build.worker.is_none() {
                continue;
            }
            match self.ingest(&build, now).await {
                Ok(Some(_)) => changed += 1,
                Ok(None) => {}
                Err(e) => warn!(build_id = %build.id, error = %e, "Ingestion failed"),
            }
        }
        Ok(changed)
    }

    /// Apply the latest channel record of one build.
    ///
    /// Returns the updated build when the record changed it.
    pub async fn ingest(&self, build: &Build, now: DateTime<Utc>) -> Result<Option<Build>> {
        let Some(record) = self.channel.latest(build.id).await? else {
            return Ok(None);
        };
        if let Err(e) = record.validate() {
            warn!(build_id = %build.id, error = %e, "Ignoring malformed status record");
            return Ok(None);
        }

        let file = record
            .artifact
            .clone()
            .unwrap_or_else(|| DEFAULT_ARTIFACT_FILE.to_string());
        let artifact = if record.effective_phase() == WorkerPhase::Completed {
            match self.artifacts.stat(build.id, &file).await {
                Ok(found) => found,
                Err(e) => {
                    // Retried on the next poll.
                    warn!(build_id = %build.id, error = %e, "Could not check artifact");
                    return Ok(None);
                }
            }
        } else {
            None
        };

        let result = modify_build(self.repo.as_ref(), build.id, |b| {
            apply(b, &record, artifact.clone(), &file, now)
        })
        .await?;

        let Modified::Applied { build, value: phase } = result else {
            return Ok(None);
        };

        if build.is_terminal() {
            info!(
                build_id = %build.id,
                status = %build.status,
                reported_phase = ?phase,
                "Build finished"
            );
            return Ok(Some(self.cleanup.cleanup(&build).await?));
        }
        debug!(build_id = %build.id, status = %build.status, progress = build.progress, "Applied status record");
        Ok(Some(build))
    }
}

fn apply(
    build: &mut Build,
    record: &StatusRecord,
    artifact: Option<isoforge_core::artifact::ArtifactRef>,
    file: &str,
    now: DateTime<Utc>,
) -> Option<WorkerPhase> {
    let phase = match build.apply_report(record, now) {
        ReportOutcome::Applied { phase, .. } => phase,
        ReportOutcome::Stale { recorded, reported } => {
            debug!(build_id = %build.id, recorded, reported, "Discarding stale status record");
            return None;
        }
        ReportOutcome::Terminal | ReportOutcome::Duplicate => return None,
    };

    match phase {
        WorkerPhase::Completed => match artifact {
            Some(artifact) => build.complete(artifact, now).ok()?,
            None => build
                .fail(
                    FailureReason::Delivery,
                    format!("worker reported completion but artifact {file} is missing"),
                    now,
                )
                .ok()?,
        },
        WorkerPhase::Failed => {
            let message = record
                .error
                .clone()
                .unwrap_or_else(|| record.stage.clone());
            build.fail(FailureReason::Execution, message, now).ok()?
        }
        WorkerPhase::Preparing | WorkerPhase::Building | WorkerPhase::Uploading => {}
    }
    Some(phase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use chrono::Duration;
    use isoforge_core::BuildStatus;

    #[tokio::test]
    async fn test_progress_moves_status_forward() {
        let h = Harness::new();
        let build = h.running_build().await;
        let t = Utc::now();

        h.report(build.id, 5, t).await;
        h.ingestor.ingest_all(t).await.unwrap();
        assert_eq!(h.repo.get(build.id).await.unwrap().status, BuildStatus::Preparing);

        h.report(build.id, 40, t + Duration::seconds(1)).await;
        h.ingestor.ingest_all(t).await.unwrap();
        let stored = h.repo.get(build.id).await.unwrap();
        assert_eq!(stored.status, BuildStatus::Building);
        assert_eq!(stored.progress, 40);
    }

    #[tokio::test]
    async fn test_stale_report_keeps_progress() {
        let h = Harness::new();
        let build = h.running_build().await;
        let t = Utc::now();

        h.report(build.id, 40, t).await;
        h.ingestor.ingest_all(t).await.unwrap();
        h.report(build.id, 20, t + Duration::seconds(1)).await;
        h.ingestor.ingest_all(t).await.unwrap();

        let stored = h.repo.get(build.id).await.unwrap();
        assert_eq!(stored.progress, 40);
        assert_eq!(stored.status, BuildStatus::Building);
    }

    #[tokio::test]
    async fn test_polling_twice_is_harmless() {
        let h = Harness::new();
        let build = h.running_build().await;
        let t = Utc::now();
        h.report(build.id, 30, t).await;
        assert_eq!(h.ingestor.ingest_all(t).await.unwrap(), 1);
        assert_eq!(h.ingestor.ingest_all(t).await.unwrap(), 0);
        assert_eq!(h.repo.get(build.id).await.unwrap().logs.len(), 1);
    }

    #[tokio::test]
    async fn test_observed_progress_never_decreases() {
        let h = Harness::new();
        let build = h.running_build().await;
        let t = Utc::now();
        let mut seen = 0;
        for (i, progress) in [3u8, 15, 12, 50, 49, 91, 60, 95].into_iter().enumerate() {
            h.report(build.id, progress, t + Duration::seconds(i as i64)).await;
            h.ingestor.ingest_all(t).await.unwrap();
            let stored = h.repo.get(build.id).await.unwrap();
            assert!(stored.progress >= seen);
            seen = stored.progress;
        }
        assert_eq!(seen, 95);
    }

    #[tokio::test]
    async fn test_completion_with_artifact() {
        let h = Harness::new();
        let build = h.running_build().await;
        h.artifacts.insert(build.id, "image.iso", &b"iso"[..]).await;
        h.report(build.id, 100, Utc::now()).await;
        h.ingestor.ingest_all(Utc::now()).await.unwrap();

        let stored = h.repo.get(build.id).await.unwrap();
        assert_eq!(stored.status, BuildStatus::Completed);
        assert_eq!(stored.artifact.unwrap().size, 3);
        assert!(stored.worker.is_none());
        assert_eq!(h.provisioner.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn test_completion_without_artifact_fails_delivery() {
        let h = Harness::new();
        let build = h.running_build().await;
        h.report(build.id, 100, Utc::now()).await;
        h.ingestor.ingest_all(Utc::now()).await.unwrap();

        let stored = h.repo.get(build.id).await.unwrap();
        assert_eq!(stored.status, BuildStatus::Failed);
        assert_eq!(stored.error.unwrap().reason, FailureReason::Delivery);
        assert!(stored.worker.is_none());
    }

    #[tokio::test]
    async fn test_reported_error_fails_execution() {
        let h = Harness::new();
        let build = h.running_build().await;
        let record = StatusRecord {
            stage: "Installing ollama".to_string(),
            progress: 35,
            message: "apt failed".to_string(),
            timestamp: Utc::now(),
            phase: None,
            artifact: None,
            error: Some("package mirror unreachable".to_string()),
        };
        h.channel.publish(build.id, &record).await.unwrap();
        h.ingestor.ingest_all(Utc::now()).await.unwrap();

        let stored = h.repo.get(build.id).await.unwrap();
        assert_eq!(stored.status, BuildStatus::Failed);
        let error = stored.error.unwrap();
        assert_eq!(error.reason, FailureReason::Execution);
        assert_eq!(error.message, "package mirror unreachable");
        assert_eq!(h.provisioner.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_build_ignores_reports() {
        let h = Harness::new();
        let build = h.running_build().await;
        h.service.cancel(build.id).await.unwrap();

        h.report(build.id, 80, Utc::now()).await;
        let changed = h.ingestor.ingest_all(Utc::now()).await.unwrap();
        assert_eq!(changed, 0);
        let stored = h.repo.get(build.id).await.unwrap();
        assert_eq!(stored.status, BuildStatus::Cancelled);
        assert_eq!(stored.progress, 0);
    }

    #[tokio::test]
    async fn test_no_record_means_no_change() {
        let h = Harness::new();
        let build = h.running_build().await;
        assert_eq!(h.ingestor.ingest_all(Utc::now()).await.unwrap(), 0);
        assert_eq!(
            h.repo.get(build.id).await.unwrap().status,
            BuildStatus::Provisioning
        );
    }
}
