//! Build repository.
//!
//! Build records are only ever changed through [`BuildRepo::compare_and_swap`],
//! which stores a new version only if nobody else wrote since it was read.
//! [`modify_build`] wraps that in a read-modify-write retry loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use isoforge_core::build::{Build, BuildStatus};
use isoforge_core::BuildId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::debug;

use crate::{DbError, DbResult};

/// Attempts made by [`modify_build`] before giving up on contention.
pub const MAX_CAS_ATTEMPTS: usize = 8;

// Key of the advisory lock serializing admission across processes.
const ADMISSION_LOCK_KEY: i64 = 0x1503_f0e6_e000_0001;

/// Bounds checked atomically with the insert of a new build.
#[derive(Debug, Clone)]
pub struct AdmissionLimits {
    /// Ceiling on builds in non-terminal states.
    pub max_active: u32,
    /// Builds one requester may have created since `quota_since`.
    pub requester_quota: u32,
    pub quota_since: DateTime<Utc>,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Admission {
    Admitted,
    CeilingReached { active: u32, ceiling: u32 },
    QuotaExceeded { recent: u32, quota: u32 },
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Insert `build` if the limits allow it; the check and insert are atomic.
    async fn admit(&self, build: &Build, limits: &AdmissionLimits) -> DbResult<Admission>;

    async fn get(&self, id: BuildId) -> DbResult<Build>;

    /// Store `build` if the stored version still equals `build.version`.
    /// Returns the stored build with its bumped version.
    async fn compare_and_swap(&self, build: &Build) -> DbResult<Build>;

    /// All builds in non-terminal states, oldest first.
    async fn list_active(&self) -> DbResult<Vec<Build>>;

    /// Builds created by a requester, newest first.
    async fn list_by_requester(&self, requester: &str, limit: i64) -> DbResult<Vec<Build>>;

    async fn count_active(&self) -> DbResult<u32>;

    /// Terminal builds that finished before `cutoff`.
    async fn list_finished_before(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<Build>>;

    /// Terminal builds that still reference a worker.
    async fn list_terminal_with_worker(&self) -> DbResult<Vec<Build>>;

    async fn delete(&self, id: BuildId) -> DbResult<()>;

    /// Cheap liveness check of the backing store.
    async fn ping(&self) -> DbResult<()>;
}

/// Result of [`modify_build`].
#[derive(Debug)]
pub enum Modified<T> {
    /// The closure changed the build and the change was stored.
    Applied { build: Build, value: T },
    /// The closure declined to change the build.
    Unchanged(Build),
}

impl<T> Modified<T> {
    pub fn build(&self) -> &Build {
        match self {
            Modified::Applied { build, .. } | Modified::Unchanged(build) => build,
        }
    }

    pub fn into_build(self) -> Build {
        match self {
            Modified::Applied { build, .. } | Modified::Unchanged(build) => build,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Modified::Applied { .. })
    }
}

/// Transactional read-modify-write of one build.
///
/// `change` sees the freshest stored copy. Returning `None` leaves the record
/// untouched; returning `Some` stores the mutated copy via compare-and-swap.
/// On a version conflict the record is re-read and `change` runs again.
pub async fn modify_build<R, F, T>(repo: &R, id: BuildId, mut change: F) -> DbResult<Modified<T>>
where
    R: BuildRepo + ?Sized,
    F: FnMut(&mut Build) -> Option<T> + Send,
    T: Send,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let current = repo.get(id).await?;
        let mut next = current.clone();
        let Some(value) = change(&mut next) else {
            return Ok(Modified::Unchanged(current));
        };
        match repo.compare_and_swap(&next).await {
            Ok(build) => return Ok(Modified::Applied { build, value }),
            Err(DbError::Conflict(_)) => {
                debug!(build_id = %id, attempt, "Build changed concurrently, retrying");
            }
            Err(e) => return Err(e),
        }
    }
    Err(DbError::Conflict(format!(
        "build {id} still contended after {MAX_CAS_ATTEMPTS} attempts"
    )))
}

/// A build row as stored in Postgres.
#[derive(Debug, Clone, sqlx::FromRow)]
struct BuildRow {
    id: uuid::Uuid,
    status: String,
    #[allow(dead_code)]
    requester: String,
    config: serde_json::Value,
    progress: i16,
    stage: String,
    logs: serde_json::Value,
    worker: Option<serde_json::Value>,
    artifact: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    estimated_duration_secs: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_progress_at: DateTime<Utc>,
    last_report_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    version: i64,
}

fn decode<T: serde::de::DeserializeOwned>(
    id: uuid::Uuid,
    column: &str,
    value: serde_json::Value,
) -> DbResult<T> {
    serde_json::from_value(value)
        .map_err(|e| DbError::Corrupt(format!("build {id} column {column}: {e}")))
}

fn decode_opt<T: serde::de::DeserializeOwned>(
    id: uuid::Uuid,
    column: &str,
    value: Option<serde_json::Value>,
) -> DbResult<Option<T>> {
    value.map(|v| decode(id, column, v)).transpose()
}

fn encode<T: Serialize>(value: &T) -> DbResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| DbError::Corrupt(e.to_string()))
}

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> DbResult<Self> {
        let id = row.id;
        let status = row
            .status
            .parse::<BuildStatus>()
            .map_err(|e| DbError::Corrupt(format!("build {id}: {e}")))?;
        let progress = u8::try_from(row.progress)
            .map_err(|_| DbError::Corrupt(format!("build {id}: progress {}", row.progress)))?;
        let estimated_duration_secs = u64::try_from(row.estimated_duration_secs).unwrap_or(0);

        Ok(Build {
            id: BuildId::from_uuid(id),
            status,
            config: decode(id, "config", row.config)?,
            progress,
            stage: row.stage,
            logs: decode(id, "logs", row.logs)?,
            worker: decode_opt(id, "worker", row.worker)?,
            artifact: decode_opt(id, "artifact", row.artifact)?,
            error: decode_opt(id, "error", row.error)?,
            estimated_duration_secs,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_progress_at: row.last_progress_at,
            last_report_at: row.last_report_at,
            finished_at: row.finished_at,
            version: row.version,
        })
    }
}

fn active_statuses() -> Vec<String> {
    BuildStatus::ACTIVE
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn into_builds(rows: Vec<BuildRow>) -> DbResult<Vec<Build>> {
    rows.into_iter().map(Build::try_from).collect()
}

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn admit(&self, build: &Build, limits: &AdmissionLimits) -> DbResult<Admission> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ADMISSION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let active: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM builds WHERE status = ANY($1)")
            .bind(active_statuses())
            .fetch_one(&mut *tx)
            .await?;
        let active = u32::try_from(active).unwrap_or(u32::MAX);
        if active >= limits.max_active {
            return Ok(Admission::CeilingReached {
                active,
                ceiling: limits.max_active,
            });
        }

        let recent: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM builds WHERE requester = $1 AND created_at >= $2",
        )
        .bind(&build.config.requester)
        .bind(limits.quota_since)
        .fetch_one(&mut *tx)
        .await?;
        let recent = u32::try_from(recent).unwrap_or(u32::MAX);
        if recent >= limits.requester_quota {
            return Ok(Admission::QuotaExceeded {
                recent,
                quota: limits.requester_quota,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO builds (
                id, status, requester, config, progress, stage, logs, worker, artifact, error,
                estimated_duration_secs, created_at, updated_at, last_progress_at,
                last_report_at, finished_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(build.status.as_str())
        .bind(&build.config.requester)
        .bind(encode(&build.config)?)
        .bind(i16::from(build.progress))
        .bind(&build.stage)
        .bind(encode(&build.logs)?)
        .bind(build.worker.as_ref().map(encode).transpose()?)
        .bind(build.artifact.as_ref().map(encode).transpose()?)
        .bind(build.error.as_ref().map(encode).transpose()?)
        .bind(i64::try_from(build.estimated_duration_secs).unwrap_or(i64::MAX))
        .bind(build.created_at)
        .bind(build.updated_at)
        .bind(build.last_progress_at)
        .bind(build.last_report_at)
        .bind(build.finished_at)
        .bind(build.version)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("build {}", build.id))
            }
            other => DbError::Database(other),
        })?;

        tx.commit().await?;
        Ok(Admission::Admitted)
    }

    async fn get(&self, id: BuildId) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        row.try_into()
    }

    async fn compare_and_swap(&self, build: &Build) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            UPDATE builds SET
                status = $3, progress = $4, stage = $5, logs = $6, worker = $7,
                artifact = $8, error = $9, updated_at = $10, last_progress_at = $11,
                last_report_at = $12, finished_at = $13, version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(build.version)
        .bind(build.status.as_str())
        .bind(i16::from(build.progress))
        .bind(&build.stage)
        .bind(encode(&build.logs)?)
        .bind(build.worker.as_ref().map(encode).transpose()?)
        .bind(build.artifact.as_ref().map(encode).transpose()?)
        .bind(build.error.as_ref().map(encode).transpose()?)
        .bind(build.updated_at)
        .bind(build.last_progress_at)
        .bind(build.last_report_at)
        .bind(build.finished_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM builds WHERE id = $1)")
                        .bind(build.id.as_uuid())
                        .fetch_one(&self.pool)
                        .await?;
                if exists {
                    Err(DbError::Conflict(format!(
                        "build {} is no longer at version {}",
                        build.id, build.version
                    )))
                } else {
                    Err(DbError::NotFound(format!("build {}", build.id)))
                }
            }
        }
    }

    async fn list_active(&self) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE status = ANY($1) ORDER BY created_at ASC",
        )
        .bind(active_statuses())
        .fetch_all(&self.pool)
        .await?;
        into_builds(rows)
    }

    async fn list_by_requester(&self, requester: &str, limit: i64) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE requester = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(requester)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        into_builds(rows)
    }

    async fn count_active(&self) -> DbResult<u32> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM builds WHERE status = ANY($1)")
            .bind(active_statuses())
            .fetch_one(&self.pool)
            .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn list_finished_before(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE finished_at IS NOT NULL AND finished_at < $1 ORDER BY finished_at ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        into_builds(rows)
    }

    async fn list_terminal_with_worker(&self) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE NOT (status = ANY($1)) AND worker IS NOT NULL",
        )
        .bind(active_statuses())
        .fetch_all(&self.pool)
        .await?;
        into_builds(rows)
    }

    async fn delete(&self, id: BuildId) -> DbResult<()> {
        sqlx::query("DELETE FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
