//! Artifact delivery through short-lived signed URLs.

use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::stream::BoxStream;
use isoforge_core::artifact::{ArtifactRef, ArtifactStore};
use isoforge_core::signing::Signer;
use isoforge_core::{BuildId, BuildStatus};
use isoforge_db::{BuildRepo, DbError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// A time-limited download grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadGrant {
    pub url: String,
    pub size: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("build {0} not found")]
    NotFound(BuildId),

    #[error("build is {0}, not completed")]
    NotCompleted(BuildStatus),

    #[error("artifact for build {0} is no longer available")]
    ArtifactGone(BuildId),

    #[error("download link expired")]
    Expired,

    #[error("invalid download signature")]
    InvalidSignature,

    #[error("storage error: {0}")]
    Storage(String),
}

impl DeliveryError {
    /// Machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryError::NotFound(_) => "not_found",
            DeliveryError::NotCompleted(_) => "not_completed",
            DeliveryError::ArtifactGone(_) => "artifact_gone",
            DeliveryError::Expired => "expired",
            DeliveryError::InvalidSignature => "invalid_signature",
            DeliveryError::Storage(_) => "storage",
        }
    }
}

impl From<isoforge_core::Error> for DeliveryError {
    fn from(err: isoforge_core::Error) -> Self {
        DeliveryError::Storage(err.to_string())
    }
}

/// Issues and checks download grants.
pub struct Delivery {
    repo: Arc<dyn BuildRepo>,
    artifacts: Arc<dyn ArtifactStore>,
    signer: Arc<Signer>,
    public_url: String,
    ttl: Duration,
}

impl Delivery {
    pub fn new(
        repo: Arc<dyn BuildRepo>,
        artifacts: Arc<dyn ArtifactStore>,
        signer: Arc<Signer>,
        public_url: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            repo,
            artifacts,
            signer,
            public_url: public_url.into(),
            ttl,
        }
    }

    /// Issue a fresh grant for a completed build.
    ///
    /// Grants can be re-issued as long as the build and its artifact exist.
    /// A missing artifact leaves the build `completed`.
    pub async fn grant(
        &self,
        build_id: BuildId,
        now: DateTime<Utc>,
    ) -> Result<DownloadGrant, DeliveryError> {
        let build = self.repo.get(build_id).await.map_err(|e| match e {
            DbError::NotFound(_) => DeliveryError::NotFound(build_id),
            other => DeliveryError::Storage(other.to_string()),
        })?;
        if build.status != BuildStatus::Completed {
            return Err(DeliveryError::NotCompleted(build.status));
        }
        let recorded = build
            .artifact
            .ok_or(DeliveryError::ArtifactGone(build_id))?;
        let artifact = self
            .artifacts
            .stat(build_id, recorded.file_name())
            .await?
            .ok_or(DeliveryError::ArtifactGone(build_id))?;

        let expires_at = now + self.ttl;
        let expires = expires_at.timestamp();
        let file = artifact.file_name();
        let signature = self.signer.download_signature(build_id, file, expires);
        let url = format!(
            "{}/artifacts/{}/{}?expires={}&signature={}",
            self.public_url.trim_end_matches('/'),
            build_id,
            urlencoding::encode(file),
            expires,
            signature
        );

        Ok(DownloadGrant {
            url,
            size: artifact.size,
            expires_at: Utc
                .timestamp_opt(expires, 0)
                .single()
                .unwrap_or(expires_at),
        })
    }

    /// Check a presented grant and resolve the artifact it names.
    pub async fn verify(
        &self,
        build_id: BuildId,
        file: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<ArtifactRef, DeliveryError> {
        if !self
            .signer
            .verify_download(build_id, file, expires, signature)
        {
            return Err(DeliveryError::InvalidSignature);
        }
        if now.timestamp() > expires {
            return Err(DeliveryError::Expired);
        }
        self.artifacts
            .stat(build_id, file)
            .await?
            .ok_or(DeliveryError::ArtifactGone(build_id))
    }

    /// Stream a verified artifact.
    pub async fn open(
        &self,
        artifact: &ArtifactRef,
    ) -> Result<BoxStream<'static, std::result::Result<Bytes, std::io::Error>>, DeliveryError> {
        Ok(self.artifacts.open(artifact).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use isoforge_core::FailureReason;

    fn query_param<'a>(url: &'a str, key: &str) -> &'a str {
        url.split(['?', '&'])
            .find_map(|pair| pair.strip_prefix(&format!("{key}=")))
            .unwrap()
    }

    #[tokio::test]
    async fn test_grant_for_completed_build() {
        let h = Harness::new();
        let build = h.completed_build(b"ISO9660 image").await;
        let now = Utc::now();

        let grant = h.delivery.grant(build.id, now).await.unwrap();
        assert_eq!(grant.size, 13);
        assert!(grant.url.starts_with(&format!(
            "http://localhost:3000/artifacts/{}/image.iso?expires=",
            build.id
        )));
        assert!(grant.expires_at > now);

        let expires: i64 = query_param(&grant.url, "expires").parse().unwrap();
        let signature = query_param(&grant.url, "signature");
        let artifact = h
            .delivery
            .verify(build.id, "image.iso", expires, signature, now)
            .await
            .unwrap();
        assert_eq!(artifact.size, 13);
    }

    #[tokio::test]
    async fn test_grant_is_reissuable() {
        let h = Harness::new();
        let build = h.completed_build(b"iso").await;
        let first = h.delivery.grant(build.id, Utc::now()).await.unwrap();
        let second = h
            .delivery
            .grant(build.id, Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        assert_ne!(first.url, second.url);
    }

    #[tokio::test]
    async fn test_not_completed() {
        let h = Harness::new();
        let build = h.running_build().await;
        let err = h.delivery.grant(build.id, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::NotCompleted(BuildStatus::Provisioning)
        ));

        let failed = h.fail(build.id, FailureReason::Execution).await;
        let err = h.delivery.grant(failed.id, Utc::now()).await.unwrap_err();
        assert_eq!(err.reason(), "not_completed");
    }

    #[tokio::test]
    async fn test_missing_artifact_is_gone_and_build_stays_completed() {
        let h = Harness::new();
        let build = h.completed_build(b"iso").await;
        isoforge_core::artifact::ArtifactStore::delete(h.artifacts.as_ref(), build.id)
            .await
            .unwrap();

        let err = h.delivery.grant(build.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::ArtifactGone(_)));
        assert_eq!(
            h.repo.get(build.id).await.unwrap().status,
            BuildStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_unknown_build() {
        let h = Harness::new();
        let err = h.delivery.grant(BuildId::new(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_expired_and_forged_links_rejected() {
        let h = Harness::new();
        let build = h.completed_build(b"iso").await;
        let now = Utc::now();
        let grant = h.delivery.grant(build.id, now).await.unwrap();
        let expires: i64 = query_param(&grant.url, "expires").parse().unwrap();
        let signature = query_param(&grant.url, "signature");

        let err = h
            .delivery
            .verify(build.id, "image.iso", expires, signature, now + Duration::hours(2))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Expired));

        let err = h
            .delivery
            .verify(build.id, "image.iso", expires + 3600, signature, now)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidSignature));

        let err = h
            .delivery
            .verify(BuildId::new(), "image.iso", expires, signature, now)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidSignature));
    }
}
