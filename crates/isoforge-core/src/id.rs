//! Build identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a build, generated once at admission.
/// Uses UUIDv7 so identifiers sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct BuildId(Uuid);

impl BuildId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Simple (hyphen-less) form, safe for container and pod names.
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BuildId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<BuildId> for Uuid {
    fn from(id: BuildId) -> Self {
        id.0
    }
}

impl std::str::FromStr for BuildId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
