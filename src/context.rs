//! Process-wide context handed to every component.
//!
//! Nothing in the library keeps global state: the running version, role,
//! options and the channel used to request process termination all travel
//! in a [`ServiceContext`], so tests can build as many isolated services as
//! they need.

use crate::{ServiceRole, SemanticVersion, UpgradeOptions};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Why the process should terminate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// A standby process took over the production address.
    Replaced,
    /// The handoff failed after draining and no fallback was possible.
    HandoffFailed(String),
    /// A standby process could not bind the production address.
    RebindFailed(String),
}

impl ExitReason {
    /// Process exit code for this reason.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Replaced => 0,
            Self::HandoffFailed(_) | Self::RebindFailed(_) => 1,
        }
    }
}

/// Sending half of the termination channel.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    tx: mpsc::UnboundedSender<ExitReason>,
}

impl ExitSignal {
    /// Create a signal and the receiver the process owner awaits.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExitReason>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Request termination. Ignored once the receiver is gone.
    pub fn exit(&self, reason: ExitReason) {
        let _ = self.tx.send(reason);
    }
}

/// Shared, immutable description of the running service.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    version: SemanticVersion,
    role: ServiceRole,
    options: UpgradeOptions,
    exit: ExitSignal,
}

impl ServiceContext {
    /// Assemble a context.
    pub fn new(version: SemanticVersion, role: ServiceRole, options: UpgradeOptions, exit: ExitSignal) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                version,
                role,
                options,
                exit,
            }),
        }
    }

    /// The embedded version of this build.
    pub fn version(&self) -> &SemanticVersion {
        &self.inner.version
    }

    /// The role selected at start.
    pub fn role(&self) -> &ServiceRole {
        &self.inner.role
    }

    /// Upgrade options.
    pub fn options(&self) -> &UpgradeOptions {
        &self.inner.options
    }

    /// Termination channel.
    pub fn exit_signal(&self) -> &ExitSignal {
        &self.inner.exit
    }
}
