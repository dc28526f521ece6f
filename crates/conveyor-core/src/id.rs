//! Identifiers.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Numeric build identifier, assigned by the store in creation order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct BuildId(i64);

impl BuildId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

/// Version of a saved pipeline config, used for optimistic concurrency.
///
/// A pipeline that has never been saved is at version zero.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct ConfigVersion(i64);

impl ConfigVersion {
    pub fn new(version: i64) -> Self {
        Self(version)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// The version a successful save against this one produces.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::str::FromStr for ConfigVersion {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}
