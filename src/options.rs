//! Upgrade configuration.
//!
//! This module provides the [`UpgradeOptions`] struct collecting every
//! tunable of discovery and handoff: where candidates live, how they are
//! probed and how long each handoff step may take.

use std::path::PathBuf;
use std::time::Duration;

/// Default file name prefix of upgrade candidates.
pub const DEFAULT_PREFIX: &str = "update";

/// Flag every participating executable answers with its bare version.
pub const VERSION_FLAG: &str = "--version";

/// Environment variable overriding the embedded version of a process.
///
/// Removed from the environment of every probed or launched candidate, which
/// must report the version built into it.
pub const EMBEDDED_VERSION_ENV: &str = "BINSWAP_EMBEDDED_VERSION";

/// Configuration options for discovery and handoff.
///
/// # Example
///
/// ```rust
/// use binswap::UpgradeOptions;
/// use std::time::Duration;
///
/// let opts = UpgradeOptions {
///     probe_timeout: Duration::from_millis(500),
///     ..Default::default()
/// };
/// assert_eq!(opts.prefix, "update");
/// ```
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Directory scanned for candidates.
    ///
    /// Default: `.`
    pub candidate_dir: PathBuf,

    /// Required file name prefix.
    ///
    /// Default: `update`
    pub prefix: String,

    /// File name of the running executable, excluded from the scan.
    pub self_name: String,

    /// Flag passed to candidates to query their version.
    ///
    /// Default: `--version`
    pub version_flag: String,

    /// Maximum time a single version probe may run.
    ///
    /// Default: 2 seconds
    pub probe_timeout: Duration,

    /// Maximum number of probes running at once.
    ///
    /// Default: 4
    pub probe_concurrency: usize,

    /// Grace period for in-flight requests when draining a listener.
    ///
    /// Default: 3 seconds
    pub shutdown_grace: Duration,

    /// How long to wait for the standby process to report ready.
    ///
    /// Default: 5 seconds
    pub ready_timeout: Duration,

    /// Delay between two readiness polls.
    ///
    /// Default: 100 milliseconds
    pub ready_interval: Duration,

    /// Timeout of the `/replace` call.
    ///
    /// Default: 5 seconds
    pub replace_timeout: Duration,

    /// Pause before a standby process tears down its temporary listener,
    /// letting the `/replace` response reach the caller.
    ///
    /// Default: 250 milliseconds
    pub flush_delay: Duration,

    /// Re-bind the production address locally when a handoff fails after
    /// draining, instead of terminating.
    ///
    /// Default: `true`
    pub rebind_on_failure: bool,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            candidate_dir: PathBuf::from("."),
            prefix: DEFAULT_PREFIX.to_string(),
            self_name: current_exe_name(),
            version_flag: VERSION_FLAG.to_string(),
            probe_timeout: Duration::from_secs(2),
            probe_concurrency: 4,
            shutdown_grace: Duration::from_secs(3),
            ready_timeout: Duration::from_secs(5),
            ready_interval: Duration::from_millis(100),
            replace_timeout: Duration::from_secs(5),
            flush_delay: Duration::from_millis(250),
            rebind_on_failure: true,
        }
    }
}

/// File name of the running executable.
///
/// Falls back to the file name in `argv[0]`, then to an empty string (which
/// matches no entry).
pub fn current_exe_name() -> String {
    let from_path = |path: PathBuf| path.file_name().and_then(|n| n.to_str()).map(str::to_string);

    std::env::current_exe()
        .ok()
        .and_then(from_path)
        .or_else(|| std::env::args_os().next().map(PathBuf::from).and_then(from_path))
        .unwrap_or_default()
}
