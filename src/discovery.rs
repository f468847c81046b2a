//! Candidate discovery: scan, probe, select.

use crate::probe::probe_all;
use crate::scanner::scan_dir;
use crate::{select_newest, Candidate, DiscoveryError, SemanticVersion, UpgradeOptions};
use async_trait::async_trait;
use tracing::info;

/// Find the newest executable that may replace the running version.
///
/// # Detection Process
///
/// 1. List `candidate_dir` and keep prefixed, executable regular files
///    other than the running binary
/// 2. Run each with the version flag, bounded by `probe_timeout`, with at
///    most `probe_concurrency` probes at once
/// 3. Keep versions strictly newer than `current` and return the highest
///
/// # Errors
///
/// - `DiscoveryError::Scan` if the directory cannot be read
/// - `DiscoveryError::NoCandidate` if nothing newer was found
///
/// # Example
///
/// ```rust,no_run
/// use binswap::{newest_candidate, SemanticVersion, UpgradeOptions};
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     let current = SemanticVersion::parse("1.0.0").unwrap();
///     match newest_candidate(&current, &UpgradeOptions::default()).await {
///         Ok(candidate) => println!("upgrade to {}", candidate.path().display()),
///         Err(e) if e.is_no_candidate() => println!("up to date"),
///         Err(e) => eprintln!("scan failed: {e}"),
///     }
/// }
/// ```
pub async fn newest_candidate(current: &SemanticVersion, options: &UpgradeOptions) -> Result<Candidate, DiscoveryError> {
    let entries = scan_dir(&options.candidate_dir, &options.prefix, &options.self_name).await?;
    if entries.is_empty() {
        info!(dir = %options.candidate_dir.display(), "no upgrade candidate files");
        return Err(DiscoveryError::NoCandidate);
    }

    let probed = probe_all(
        &entries,
        &options.version_flag,
        options.probe_timeout,
        options.probe_concurrency,
    )
    .await;

    match select_newest(current, probed) {
        Some(candidate) => {
            info!(bin = %candidate.path().display(), version = %candidate.version(), current = %current, "found upgrade candidate");
            Ok(candidate)
        }
        None => {
            info!(current = %current, scanned = entries.len(), "no newer candidate");
            Err(DiscoveryError::NoCandidate)
        }
    }
}

/// Source of upgrade candidates used by the coordinator.
#[async_trait]
pub trait CandidateFinder: Send + Sync + 'static {
    /// Find the newest candidate strictly newer than `current`.
    async fn newest(&self, current: &SemanticVersion) -> Result<Candidate, DiscoveryError>;
}

/// Finder scanning a directory on every call.
#[derive(Debug, Clone)]
pub struct DirectoryFinder {
    options: UpgradeOptions,
}

impl DirectoryFinder {
    /// Create a finder from upgrade options.
    pub fn new(options: UpgradeOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl CandidateFinder for DirectoryFinder {
    async fn newest(&self, current: &SemanticVersion) -> Result<Candidate, DiscoveryError> {
        newest_candidate(current, &self.options).await
    }
}
