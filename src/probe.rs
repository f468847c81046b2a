//! Version probing of candidate executables.
//!
//! Each candidate is run with the version-query flag and must print a bare
//! semantic version and exit zero. Anything else excludes the candidate
//! without failing the scan.

use crate::scanner::CandidateEntry;
use crate::{Candidate, ProbeError, SemanticVersion, EMBEDDED_VERSION_ENV};
use futures::future;
use futures::stream::{self, StreamExt};
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Characters accepted in a candidate file name before it is executed.
const SAFE_NAME_PATTERN: &str = r"^[A-Za-z0-9._+-]+$";

fn safe_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SAFE_NAME_PATTERN).expect("Invalid regex pattern"))
}

/// Check that a candidate file name only uses the accepted character set.
///
/// Names are derived from a directory listing and end up as the program of a
/// spawned process, so anything outside `[A-Za-z0-9._+-]` is refused.
pub fn validate_name(name: &str) -> Result<(), ProbeError> {
    if safe_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(ProbeError::UnsafeName {
            name: name.to_string(),
        })
    }
}

/// Run `path` with `flag` and parse its output as a semantic version.
///
/// Standard output and standard error are captured and concatenated, then
/// trimmed before parsing. The child is killed if it does not exit within
/// `probe_timeout`.
///
/// # Errors
///
/// - `Spawn` if the process cannot be started
/// - `Timeout` if it runs longer than `probe_timeout`
/// - `ExitStatus` on a non-zero exit
/// - `Version` if the output is not a semantic version
pub async fn probe_version(path: &Path, flag: &str, probe_timeout: Duration) -> Result<SemanticVersion, ProbeError> {
    let output = timeout(
        probe_timeout,
        Command::new(path)
            .arg(flag)
            .env_remove(EMBEDDED_VERSION_ENV)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| ProbeError::Timeout {
        path: path.to_path_buf(),
        timeout: probe_timeout,
    })?
    .map_err(|source| ProbeError::Spawn {
        path: path.to_path_buf(),
        source,
    })?;

    if !output.status.success() {
        return Err(ProbeError::ExitStatus {
            path: path.to_path_buf(),
            status: output.status.to_string(),
        });
    }

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    let text = String::from_utf8_lossy(&combined);

    SemanticVersion::parse(&text).map_err(|source| ProbeError::Version {
        path: path.to_path_buf(),
        source,
    })
}

/// Probe a single scanned entry, validating its name first.
pub async fn probe_entry(entry: &CandidateEntry, flag: &str, probe_timeout: Duration) -> Result<Candidate, ProbeError> {
    validate_name(&entry.name)?;
    let version = probe_version(&entry.path, flag, probe_timeout).await?;
    Ok(Candidate::new(entry.path.clone(), version))
}

/// Probe every entry with at most `concurrency` probes running at once.
///
/// Failed probes are logged and dropped. The result is sorted by path so the
/// output does not depend on probe completion order.
pub async fn probe_all(
    entries: &[CandidateEntry],
    flag: &str,
    probe_timeout: Duration,
    concurrency: usize,
) -> Vec<Candidate> {
    let mut probed: Vec<Candidate> = stream::iter(entries.to_vec())
        .map(|entry| {
            let flag = flag.to_string();
            async move {
                match probe_entry(&entry, &flag, probe_timeout).await {
                    Ok(candidate) => {
                        debug!(bin = %entry.path.display(), version = %candidate.version(), "probed candidate");
                        Some(candidate)
                    }
                    Err(e @ ProbeError::UnsafeName { .. }) => {
                        warn!(bin = %entry.path.display(), error = %e, "check version");
                        None
                    }
                    Err(e) => {
                        debug!(bin = %entry.path.display(), error = %e, "check version");
                        None
                    }
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(future::ready)
        .collect()
        .await;

    probed.sort_by(|a, b| a.path().cmp(b.path()));
    probed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn entry_for(path: &Path) -> CandidateEntry {
        CandidateEntry {
            path: path.to_path_buf(),
            name: path.file_name().unwrap().to_string_lossy().into_owned(),
            mode: 0o755,
            is_dir: false,
        }
    }

    #[test]
    fn test_validate_name_accepts_common_names() {
        for name in ["update-1.2.0", "update_2", "update-1.0.0+build.7", "UPDATE.bin"] {
            assert!(validate_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_validate_name_rejects_unexpected_characters() {
        for name in ["update 1", "update;rm", "update$(x)", "update\n", "", "update/../x"] {
            assert!(
                matches!(validate_name(name), Err(ProbeError::UnsafeName { .. })),
                "{name:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_probe_nonexistent_is_spawn_error() {
        let path = PathBuf::from("/nonexistent/path/to/update-9.9.9");
        let result = probe_version(&path, "--version", TIMEOUT).await;
        assert!(matches!(result, Err(ProbeError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_parses_bare_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "update-1.2.0", "echo 1.2.0");

        let version = probe_version(&path, "--version", TIMEOUT).await.unwrap();
        assert_eq!(version, SemanticVersion::parse("1.2.0").unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_passes_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            dir.path(),
            "update-flag",
            r#"[ "$1" = "--version" ] && echo 2.0.0 && exit 0
exit 3"#,
        );

        assert!(probe_version(&path, "--version", TIMEOUT).await.is_ok());
        let wrong_flag = probe_version(&path, "-v", TIMEOUT).await;
        assert!(matches!(wrong_flag, Err(ProbeError::ExitStatus { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "update-broken", "echo 1.2.0; exit 1");

        let result = probe_version(&path, "--version", TIMEOUT).await;
        assert!(matches!(result, Err(ProbeError::ExitStatus { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_malformed_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "update-garbage", "echo not-a-version");

        let result = probe_version(&path, "--version", TIMEOUT).await;
        assert!(matches!(result, Err(ProbeError::Version { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "update-slow", "sleep 5; echo 1.0.0");

        let result = probe_version(&path, "--version", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ProbeError::Timeout { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_all_runs_on_spawned_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "update-1.3.0", "echo 1.3.0");
        let entries = vec![entry_for(&path)];
        let flag = String::from("--version");

        let probed = tokio::spawn(async move { probe_all(&entries, &flag, TIMEOUT, 4).await })
            .await
            .unwrap();
        assert_eq!(probed.len(), 1);
        assert_eq!(probed[0].path(), path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_all_drops_failures_and_keeps_rest() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_script(dir.path(), "update-1.2.0", "echo 1.2.0");
        let bad = write_script(dir.path(), "update-bad", "echo not-a-version");
        let failing = write_script(dir.path(), "update-fail", "exit 2");
        let other = write_script(dir.path(), "update-1.1.0", "echo 1.1.0");

        let entries: Vec<_> = [&good, &bad, &failing, &other].iter().map(|p| entry_for(p)).collect();
        let probed = probe_all(&entries, "--version", TIMEOUT, 2).await;

        let paths: Vec<_> = probed.iter().map(|c| c.path().to_path_buf()).collect();
        assert_eq!(paths, vec![other, good]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_all_skips_unsafe_names() {
        let dir = tempfile::tempdir().unwrap();
        let unsafe_path = write_script(dir.path(), "update 1.5.0", "echo 1.5.0");

        let probed = probe_all(&[entry_for(&unsafe_path)], "--version", TIMEOUT, 1).await;
        assert!(probed.is_empty());
    }
}
