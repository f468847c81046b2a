//! Directory scanning for upgrade candidates.
//!
//! A candidate is any regular file next to the running binary whose name
//! starts with the configured prefix and (outside Windows) has at least one
//! execute bit set. The running binary itself is excluded by name.

use crate::ScanError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Execute bits for user, group and others.
const ANY_EXECUTE: u32 = 0o111;

/// A directory entry with the metadata needed for filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateEntry {
    /// Full path to the entry.
    pub path: PathBuf,
    /// File name of the entry.
    pub name: String,
    /// Unix permission bits (zero on platforms without them).
    pub mode: u32,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Predicate deciding whether an entry stays in the candidate set.
pub type EntryFilter<'a> = Box<dyn Fn(&CandidateEntry) -> bool + Send + Sync + 'a>;

/// Rejects directories.
pub fn not_directory(entry: &CandidateEntry) -> bool {
    !entry.is_dir
}

/// Rejects the running binary, compared by file name.
pub fn not_self(self_name: &str) -> impl Fn(&CandidateEntry) -> bool + '_ {
    move |entry| entry.name != self_name
}

/// Rejects entries whose name does not start with `prefix`.
pub fn has_prefix(prefix: &str) -> impl Fn(&CandidateEntry) -> bool + '_ {
    move |entry| entry.name.starts_with(prefix)
}

/// Keeps entries with any of the user, group or other execute bits set.
///
/// This does not check whether the current process may actually execute the
/// file.
pub fn is_executable(entry: &CandidateEntry) -> bool {
    entry.mode & ANY_EXECUTE != 0
}

/// Build the filter chain applied by [`scan_dir`].
///
/// The executable-bit filter is only included on non-Windows targets.
pub fn candidate_filters<'a>(self_name: &'a str, prefix: &'a str) -> Vec<EntryFilter<'a>> {
    let mut filters: Vec<EntryFilter<'a>> = vec![
        Box::new(not_directory),
        Box::new(not_self(self_name)),
        Box::new(has_prefix(prefix)),
    ];
    if !cfg!(windows) {
        filters.push(Box::new(is_executable));
    }
    filters
}

/// Keep the entries accepted by every filter, preserving input order.
pub fn apply_filters(entries: Vec<CandidateEntry>, filters: &[EntryFilter<'_>]) -> Vec<CandidateEntry> {
    entries
        .into_iter()
        .filter(|entry| filters.iter().all(|accept| accept(entry)))
        .collect()
}

/// List `dir` and return the entries that qualify as upgrade candidates.
///
/// Entries are returned sorted by file name. Entries whose metadata cannot be
/// read (for example dangling symlinks) or whose names are not valid UTF-8 are
/// skipped.
///
/// # Errors
///
/// Returns [`ScanError`] if the directory itself cannot be read.
pub async fn scan_dir(dir: &Path, prefix: &str, self_name: &str) -> Result<Vec<CandidateEntry>, ScanError> {
    let entries = read_entries(dir).await?;
    let total = entries.len();

    let mut candidates = apply_filters(entries, &candidate_filters(self_name, prefix));
    candidates.sort_by(|a, b| a.name.cmp(&b.name));

    debug!(dir = %dir.display(), total, candidates = candidates.len(), "scanned candidate directory");
    Ok(candidates)
}

async fn read_entries(dir: &Path) -> Result<Vec<CandidateEntry>, ScanError> {
    let scan_err = |source| ScanError {
        dir: dir.to_path_buf(),
        source,
    };

    let mut reader = tokio::fs::read_dir(dir).await.map_err(scan_err)?;
    let mut entries = Vec::new();

    while let Some(entry) = reader.next_entry().await.map_err(scan_err)? {
        let path = entry.path();
        let Ok(name) = entry.file_name().into_string() else {
            debug!(path = %path.display(), "skipping entry with non UTF-8 name");
            continue;
        };

        // Follow symlinks so a link to an executable is judged by its target.
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };

        entries.push(CandidateEntry {
            path,
            name,
            mode: permission_bits(&metadata),
            is_dir: metadata.is_dir(),
        });
    }

    Ok(entries)
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn permission_bits(_metadata: &std::fs::Metadata) -> u32 {
    0
}
