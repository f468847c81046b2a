//! # binswap
//!
//! In-place self-upgrade for network services.
//!
//! A running service looks for newer builds of itself next to its own
//! executable, asks each one for its version, and hands its production
//! address over to the newest one without an external orchestrator.
//!
//! ## Features
//!
//! - `SemanticVersion` for precedence-ordered version comparison
//! - `newest_candidate()` scanning, probing and selecting an upgrade target
//! - `UpgradeCoordinator` driving the drain, spawn and `/replace` handoff
//! - `Service` wiring the control-plane endpoints for either role
//!
//! ## Example
//!
//! ```rust,no_run
//! use binswap::{newest_candidate, SemanticVersion, UpgradeOptions};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let current = SemanticVersion::parse(binswap::BUILD_VERSION).unwrap();
//!     match newest_candidate(&current, &UpgradeOptions::default()).await {
//!         Ok(candidate) => println!("newer build at {}", candidate.path().display()),
//!         Err(e) if e.is_no_candidate() => println!("up to date"),
//!         Err(e) => eprintln!("scan failed: {e}"),
//!     }
//! }
//! ```

mod candidate;
mod context;
pub mod coordinator;
pub mod discovery;
mod error;
pub mod handoff;
pub mod launcher;
mod options;
pub mod probe;
mod role;
pub mod scanner;
mod selector;
pub mod server;
mod service;
mod version;

pub use candidate::Candidate;
pub use context::{ExitReason, ExitSignal, ServiceContext};
pub use coordinator::{ProductionListener, UpgradeCoordinator, UpgradeState, UpgradeTicket};
pub use discovery::{newest_candidate, CandidateFinder, DirectoryFinder};
pub use error::{
    DiscoveryError, HandoffError, ProbeError, ReplaceError, ScanError, ServerError, UpgradeError, VersionError,
};
pub use handoff::{handoff_url, HandoffClient, HttpHandoffClient};
pub use launcher::{LaunchCommand, LaunchedProcess, ProcessLauncher, TokioLauncher};
pub use options::{current_exe_name, UpgradeOptions, DEFAULT_PREFIX, EMBEDDED_VERSION_ENV, VERSION_FLAG};
pub use role::{RoleKind, ServiceRole};
pub use selector::select_newest;
pub use service::Service;
pub use version::SemanticVersion;

/// Version embedded at build time.
///
/// Taken from the `BINSWAP_VERSION` environment variable during compilation,
/// falling back to the package version.
pub const BUILD_VERSION: &str = match option_env!("BINSWAP_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};
