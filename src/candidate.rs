//! Probed upgrade candidates.

use crate::SemanticVersion;
use std::path::{Path, PathBuf};

/// An executable that reported a valid semantic version.
///
/// Candidates are produced fresh for every scan and never cached; the
/// directory may change between two requests.
///
/// # Example
///
/// ```rust
/// use binswap::{Candidate, SemanticVersion};
///
/// let candidate = Candidate::new(
///     "/srv/app/update-1.2.0",
///     SemanticVersion::parse("1.2.0").unwrap(),
/// );
/// assert_eq!(candidate.file_name(), Some("update-1.2.0"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    path: PathBuf,
    version: SemanticVersion,
}

impl Candidate {
    /// Pair an executable path with its self-reported version.
    pub fn new(path: impl Into<PathBuf>, version: SemanticVersion) -> Self {
        Self {
            path: path.into(),
            version,
        }
    }

    /// Path to the executable.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The version the executable reported.
    pub fn version(&self) -> &SemanticVersion {
        &self.version
    }

    /// File name component of the path, if it is valid UTF-8.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}
