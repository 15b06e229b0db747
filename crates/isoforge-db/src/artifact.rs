//! Filesystem artifact storage.
//!
//! Layout: `{root}/{build_id}/{file}`. The per-build directory is what gets
//! mounted into the worker.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use isoforge_core::artifact::{ArtifactRef, ArtifactStore};
use isoforge_core::{BuildId, Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Artifact store rooted at a local (or network-mounted) directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn build_dir(&self, build_id: BuildId) -> PathBuf {
        self.root.join(build_id.to_string())
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(dir), Some(file), None) if is_plain(dir) && is_plain(file) => {
                Ok(self.root.join(dir).join(file))
            }
            _ => Err(Error::InvalidInput(format!("bad artifact key {key:?}"))),
        }
    }
}

fn is_plain(segment: &str) -> bool {
    !segment.is_empty() && !segment.starts_with('.') && !segment.contains('\\')
}

fn io_error(context: impl std::fmt::Display, err: io::Error) -> Error {
    Error::Storage(format!("{context}: {err}"))
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn prepare(&self, build_id: BuildId) -> Result<String> {
        let dir = self.build_dir(build_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(dir.display(), e))?;
        let dir = tokio::fs::canonicalize(&dir)
            .await
            .map_err(|e| io_error(dir.display(), e))?;
        debug!(build_id = %build_id, dir = %dir.display(), "Prepared artifact directory");
        Ok(dir.to_string_lossy().into_owned())
    }

    async fn stat(&self, build_id: BuildId, file: &str) -> Result<Option<ArtifactRef>> {
        let key = format!("{build_id}/{file}");
        let path = self.path_of(&key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ArtifactRef {
                key,
                size: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path.display(), e)),
        }
    }

    async fn open(
        &self,
        artifact: &ArtifactRef,
    ) -> Result<BoxStream<'static, std::result::Result<Bytes, io::Error>>> {
        let path = self.path_of(&artifact.key)?;
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(format!("artifact {}", artifact.key))
            } else {
                io_error(path.display(), e)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn delete(&self, build_id: BuildId) -> Result<()> {
        let dir = self.build_dir(build_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(dir.display(), e)),
        }
    }
}
