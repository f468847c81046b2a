//! Error types for discovery, upgrade and handoff operations.
//!
//! Discovery failures that reach the control plane are mapped onto HTTP
//! status codes by the server module: [`DiscoveryError::NoCandidate`] is a
//! 404, everything else a 500. Handoff failures never reach a client because
//! they happen after the triggering request has been answered.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A string could not be parsed as a semantic version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum VersionError {
    /// The input was empty after trimming whitespace.
    #[error("empty version string")]
    Empty,

    /// The input is not a valid semantic version.
    #[error("parse version \"{input}\": {reason}")]
    Malformed {
        /// The trimmed input.
        input: String,
        /// Parser explanation.
        reason: String,
    },
}

/// The candidate directory could not be listed.
#[derive(Debug, Error)]
#[error("read candidate directory {}: {source}", dir.display())]
pub struct ScanError {
    /// The directory that was scanned.
    pub dir: PathBuf,
    /// Underlying I/O failure.
    #[source]
    pub source: io::Error,
}

/// A single candidate could not be probed for its version.
///
/// Probe failures never abort a scan; the candidate is logged and dropped.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProbeError {
    /// The file name contains characters outside the accepted set.
    #[error("refusing to execute {name:?}: unexpected characters in file name")]
    UnsafeName {
        /// The rejected file name.
        name: String,
    },

    /// The process could not be started.
    #[error("start {}: {source}", path.display())]
    Spawn {
        /// Executable path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The process did not exit within the probe timeout.
    #[error("{} did not report its version within {timeout:?}", path.display())]
    Timeout {
        /// Executable path.
        path: PathBuf,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The process exited unsuccessfully.
    #[error("{} exited with {status}", path.display())]
    ExitStatus {
        /// Executable path.
        path: PathBuf,
        /// Exit status description.
        status: String,
    },

    /// The output was not a semantic version.
    #[error("{}: {source}", path.display())]
    Version {
        /// Executable path.
        path: PathBuf,
        /// Parse failure.
        #[source]
        source: VersionError,
    },
}

/// Outcome of a failed candidate discovery.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// Nothing newer than the running version was found.
    ///
    /// This is an expected outcome, not a failure of the scan.
    #[error("no candidate")]
    NoCandidate,

    /// The candidate directory could not be read.
    #[error(transparent)]
    Scan(#[from] ScanError),
}

impl DiscoveryError {
    /// Whether this is the distinguished "nothing to upgrade to" outcome.
    pub fn is_no_candidate(&self) -> bool {
        matches!(self, Self::NoCandidate)
    }
}

/// An upgrade trigger was rejected before any side effect happened.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpgradeError {
    /// Another upgrade is already in flight in this process.
    #[error("upgrade already in progress")]
    Busy,

    /// Candidate selection failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// A failure after the production listener has been drained.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandoffError {
    /// The candidate executable could not be launched.
    #[error("spawn standby {}: {source}", path.display())]
    Spawn {
        /// Candidate path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The standby process never reported ready.
    #[error("standby at {addr} not ready after {waited:?}")]
    NotReady {
        /// Temporary address that was polled.
        addr: SocketAddr,
        /// How long readiness was polled.
        waited: Duration,
    },

    /// The `/replace` call failed or was refused.
    #[error("call /replace on {addr}: {message}")]
    Replace {
        /// Temporary address of the standby process.
        addr: SocketAddr,
        /// Transport error or response status.
        message: String,
    },
}

/// A `/replace` call violated the handoff protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ReplaceError {
    /// The process is not running in the standby role.
    #[error("replace is only accepted by a standby process")]
    NotStandby,

    /// The handoff has already been started.
    #[error("replace already in progress")]
    AlreadyReplaced,
}

/// A listener could not be started or stopped.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// Binding the listening socket failed.
    #[error("bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: SocketAddr,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// No router has been installed for the listener.
    #[error("no router configured for {addr}")]
    NotConfigured {
        /// Address the listener would bind.
        addr: SocketAddr,
    },

    /// The listener is already running.
    #[error("listener on {addr} already running")]
    AlreadyRunning {
        /// Bound address.
        addr: SocketAddr,
    },

    /// Requests were still in flight when the grace period expired.
    ///
    /// Those requests are cut with `503` and the listener is stopped
    /// regardless; callers treat this as a soft error.
    #[error("graceful shutdown of {addr} exceeded {grace:?}, in-flight requests cut")]
    ShutdownTimedOut {
        /// Address of the stopped listener.
        addr: SocketAddr,
        /// Grace period that elapsed.
        grace: Duration,
    },
}
