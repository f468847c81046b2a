//! Process roles in the handoff protocol.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// The role a process plays, fixed when the process starts.
///
/// A role change is never a mutation of a running process: a `Primary`
/// process hands over by starting a sibling process in the `Standby` role,
/// which later binds the production address itself.
///
/// # Example
///
/// ```rust
/// use binswap::ServiceRole;
///
/// let role = ServiceRole::Standby {
///     upgrade_bind: "127.0.0.1:8081".parse().unwrap(),
///     bind: "0.0.0.0:8080".parse().unwrap(),
/// };
/// assert_eq!(role.kind(), binswap::RoleKind::Standby);
/// assert_eq!(role.listen_addr().port(), 8081);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    /// Serving the production address.
    Primary {
        /// Production address.
        bind: SocketAddr,
    },
    /// Serving only the temporary address, waiting for `/replace`.
    Standby {
        /// Temporary handoff address.
        upgrade_bind: SocketAddr,
        /// Production address bound after the handoff.
        bind: SocketAddr,
    },
}

/// Role discriminant, as reported by the status endpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RoleKind {
    /// See [`ServiceRole::Primary`].
    Primary,
    /// See [`ServiceRole::Standby`].
    Standby,
}

impl ServiceRole {
    /// Select the role from the command-line flags.
    pub fn from_flags(standby: bool, bind: SocketAddr, upgrade_bind: SocketAddr) -> Self {
        if standby {
            Self::Standby { upgrade_bind, bind }
        } else {
            Self::Primary { bind }
        }
    }

    /// The role discriminant.
    pub fn kind(&self) -> RoleKind {
        match self {
            Self::Primary { .. } => RoleKind::Primary,
            Self::Standby { .. } => RoleKind::Standby,
        }
    }

    /// The address this process listens on at start.
    pub fn listen_addr(&self) -> SocketAddr {
        match self {
            Self::Primary { bind } => *bind,
            Self::Standby { upgrade_bind, .. } => *upgrade_bind,
        }
    }

    /// The production address.
    pub fn production_addr(&self) -> SocketAddr {
        match self {
            Self::Primary { bind } | Self::Standby { bind, .. } => *bind,
        }
    }

    /// Whether this is the standby role.
    pub fn is_standby(&self) -> bool {
        matches!(self, Self::Standby { .. })
    }
}
