//! Artifact storage abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{BuildId, Result};

/// File name used when a worker does not report one.
pub const DEFAULT_ARTIFACT_FILE: &str = "image.iso";

/// Reference to a produced image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Storage key, `{build_id}/{file}`.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
}

impl ArtifactRef {
    /// File name part of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Create the build's artifact directory and return its backend location.
    async fn prepare(&self, build_id: BuildId) -> Result<String>;

    /// Look up an artifact a worker placed for a build. `None` when absent.
    async fn stat(&self, build_id: BuildId, file: &str) -> Result<Option<ArtifactRef>>;

    /// Stream an artifact.
    async fn open(
        &self,
        artifact: &ArtifactRef,
    ) -> Result<BoxStream<'static, std::result::Result<Bytes, std::io::Error>>>;

    /// Delete everything stored for a build. Deleting nothing succeeds.
    async fn delete(&self, build_id: BuildId) -> Result<()>;
}
