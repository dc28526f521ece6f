//! Resource versions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::BuildId;

/// Opaque version metadata reported by a resource.
pub type Version = BTreeMap<String, String>;

/// A version of a resource as recorded by the store.
///
/// Versions are ordered by `sequence`, the discovery order assigned when the
/// store ingested them, never by comparing the version metadata itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVersion {
    pub resource: String,
    pub sequence: i64,
    pub version: Version,
    pub enabled: bool,
}

/// Every version a successful build consumed or produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildVersions {
    pub build_id: BuildId,
    pub versions: Vec<ResourceVersion>,
}

impl BuildVersions {
    /// Enabled versions of `resource` this build touched.
    pub fn versions_of<'a>(
        &'a self,
        resource: &'a str,
    ) -> impl Iterator<Item = &'a ResourceVersion> + 'a {
        self.versions
            .iter()
            .filter(move |v| v.resource == resource && v.enabled)
    }

    pub fn touches(&self, resource: &str) -> bool {
        self.versions_of(resource).next().is_some()
    }
}
