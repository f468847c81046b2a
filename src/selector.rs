//! Choosing the upgrade target among probed candidates.

use crate::{Candidate, SemanticVersion};

/// Return the newest candidate strictly newer than `current`.
///
/// Candidates at or below the running version are never upgrade targets.
/// Equal highest versions are broken by path, the lexicographically greatest
/// path winning, so the result does not depend on input order.
///
/// Returns `None` when nothing is newer.
///
/// # Example
///
/// ```rust
/// use binswap::{select_newest, Candidate, SemanticVersion};
///
/// let current = SemanticVersion::parse("1.0.0").unwrap();
/// let candidates = vec![
///     Candidate::new("update-0.9.0", SemanticVersion::parse("0.9.0").unwrap()),
///     Candidate::new("update-1.2.0", SemanticVersion::parse("1.2.0").unwrap()),
/// ];
///
/// let chosen = select_newest(&current, candidates).unwrap();
/// assert_eq!(chosen.file_name(), Some("update-1.2.0"));
/// ```
pub fn select_newest(current: &SemanticVersion, candidates: impl IntoIterator<Item = Candidate>) -> Option<Candidate> {
    let mut newer: Vec<Candidate> = candidates
        .into_iter()
        .filter(|candidate| candidate.version() > current)
        .collect();

    newer.sort_by(|a, b| {
        a.version()
            .cmp(b.version())
            .then_with(|| a.path().cmp(b.path()))
    });
    newer.pop()
}
