//! Semantic version parsing for probe output and the embedded build version.

use crate::VersionError;
use semver::Version;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed semantic version.
///
/// Ordering follows semantic-versioning precedence: pre-release versions sort
/// before the release they precede and build metadata is ignored. Two values
/// that differ only in build metadata therefore compare equal.
///
/// # Example
///
/// ```rust
/// use binswap::SemanticVersion;
///
/// let old = SemanticVersion::parse("1.0.0").unwrap();
/// let new = SemanticVersion::parse("1.2.0").unwrap();
/// assert!(new > old);
///
/// let rc = SemanticVersion::parse("1.2.0-rc.1").unwrap();
/// assert!(rc < new);
/// ```
#[derive(Debug, Clone)]
pub struct SemanticVersion(Version);

impl SemanticVersion {
    /// Parse a semantic version string.
    ///
    /// Surrounding whitespace is trimmed and a single leading `v` is accepted
    /// (`v1.2.3`). Anything else must be a complete `major.minor.patch`
    /// version with optional pre-release and build metadata.
    ///
    /// # Returns
    ///
    /// `Err(VersionError::Empty)` for blank input and
    /// `Err(VersionError::Malformed)` for anything that is not a version.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }

        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
        Version::parse(bare)
            .map(Self)
            .map_err(|e| VersionError::Malformed {
                input: trimmed.to_string(),
                reason: e.to_string(),
            })
    }

    /// The underlying `semver` value.
    pub fn as_semver(&self) -> &Version {
        &self.0
    }
}

impl FromStr for SemanticVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Version> for SemanticVersion {
    fn from(version: Version) -> Self {
        Self(version)
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for SemanticVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SemanticVersion {}

impl PartialOrd for SemanticVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SemanticVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp_precedence(&other.0)
    }
}
