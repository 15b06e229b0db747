//! In-memory backends.
//!
//! Same semantics as the Postgres and filesystem implementations, without
//! durability. Used by tests and by single-process setups.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use isoforge_core::BuildId;
use isoforge_core::artifact::{ArtifactRef, ArtifactStore};
use isoforge_core::build::Build;
use isoforge_core::channel::{StatusChannel, StatusRecord};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::repo::{Admission, AdmissionLimits, BuildRepo};
use crate::{DbError, DbResult};

/// Build repository held in a mutex-guarded map.
#[derive(Default)]
pub struct MemoryBuildRepo {
    builds: Mutex<HashMap<BuildId, Build>>,
}

impl MemoryBuildRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildRepo for MemoryBuildRepo {
    async fn admit(&self, build: &Build, limits: &AdmissionLimits) -> DbResult<Admission> {
        let mut builds = self.builds.lock().await;

        let active = builds.values().filter(|b| !b.is_terminal()).count() as u32;
        if active >= limits.max_active {
            return Ok(Admission::CeilingReached {
                active,
                ceiling: limits.max_active,
            });
        }

        let recent = builds
            .values()
            .filter(|b| {
                b.config.requester == build.config.requester && b.created_at >= limits.quota_since
            })
            .count() as u32;
        if recent >= limits.requester_quota {
            return Ok(Admission::QuotaExceeded {
                recent,
                quota: limits.requester_quota,
            });
        }

        if builds.contains_key(&build.id) {
            return Err(DbError::Duplicate(format!("build {}", build.id)));
        }
        builds.insert(build.id, build.clone());
        Ok(Admission::Admitted)
    }

    async fn get(&self, id: BuildId) -> DbResult<Build> {
        self.builds
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn compare_and_swap(&self, build: &Build) -> DbResult<Build> {
        let mut builds = self.builds.lock().await;
        let stored = builds
            .get_mut(&build.id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", build.id)))?;
        if stored.version != build.version {
            return Err(DbError::Conflict(format!(
                "build {} is no longer at version {}",
                build.id, build.version
            )));
        }
        let mut next = build.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_active(&self) -> DbResult<Vec<Build>> {
        let mut active: Vec<Build> = self
            .builds
            .lock()
            .await
            .values()
            .filter(|b| !b.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|b| b.created_at);
        Ok(active)
    }

    async fn list_by_requester(&self, requester: &str, limit: i64) -> DbResult<Vec<Build>> {
        let mut builds: Vec<Build> = self
            .builds
            .lock()
            .await
            .values()
            .filter(|b| b.config.requester == requester)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        builds.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(builds)
    }

    async fn count_active(&self) -> DbResult<u32> {
        let builds = self.builds.lock().await;
        Ok(builds.values().filter(|b| !b.is_terminal()).count() as u32)
    }

    async fn list_finished_before(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<Build>> {
        let mut builds: Vec<Build> = self
            .builds
            .lock()
            .await
            .values()
            .filter(|b| b.finished_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.finished_at);
        Ok(builds)
    }

    async fn list_terminal_with_worker(&self) -> DbResult<Vec<Build>> {
        Ok(self
            .builds
            .lock()
            .await
            .values()
            .filter(|b| b.is_terminal() && b.worker.is_some())
            .cloned()
            .collect())
    }

    async fn delete(&self, id: BuildId) -> DbResult<()> {
        self.builds.lock().await.remove(&id);
        Ok(())
    }

    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}

/// Status channel held in memory.
#[derive(Default)]
pub struct MemoryStatusChannel {
    records: Mutex<HashMap<BuildId, StatusRecord>>,
}

impl MemoryStatusChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusChannel for MemoryStatusChannel {
    async fn publish(&self, build_id: BuildId, record: &StatusRecord) -> isoforge_core::Result<()> {
        self.records.lock().await.insert(build_id, record.clone());
        Ok(())
    }

    async fn latest(&self, build_id: BuildId) -> isoforge_core::Result<Option<StatusRecord>> {
        Ok(self.records.lock().await.get(&build_id).cloned())
    }

    async fn clear(&self, build_id: BuildId) -> isoforge_core::Result<()> {
        self.records.lock().await.remove(&build_id);
        Ok(())
    }
}

/// Artifact store held in memory, keyed by `{build_id}/{file}`.
#[derive(Default)]
pub struct MemoryArtifactStore {
    files: Mutex<HashMap<String, Bytes>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an artifact the way a worker would.
    pub async fn insert(&self, build_id: BuildId, file: &str, data: impl Into<Bytes>) {
        self.files
            .lock()
            .await
            .insert(format!("{build_id}/{file}"), data.into());
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn prepare(&self, build_id: BuildId) -> isoforge_core::Result<String> {
        Ok(format!("memory://{build_id}"))
    }

    async fn stat(
        &self,
        build_id: BuildId,
        file: &str,
    ) -> isoforge_core::Result<Option<ArtifactRef>> {
        let key = format!("{build_id}/{file}");
        let files = self.files.lock().await;
        Ok(files.get(&key).map(|data| ArtifactRef {
            size: data.len() as u64,
            key,
        }))
    }

    async fn open(
        &self,
        artifact: &ArtifactRef,
    ) -> isoforge_core::Result<BoxStream<'static, std::result::Result<Bytes, std::io::Error>>>
    {
        let data = self
            .files
            .lock()
            .await
            .get(&artifact.key)
            .cloned()
            .ok_or_else(|| isoforge_core::Error::NotFound(format!("artifact {}", artifact.key)))?;
        Ok(futures::stream::once(async move { Ok(data) }).boxed())
    }

    async fn delete(&self, build_id: BuildId) -> isoforge_core::Result<()> {
        let prefix = format!("{build_id}/");
        self.files
            .lock()
            .await
            .retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}
