//! Launching the standby process.

use crate::EMBEDDED_VERSION_ENV;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Flag selecting the standby role.
pub const STANDBY_FLAG: &str = "--standby";
/// Flag carrying the temporary handoff address.
pub const UPGRADE_BIND_FLAG: &str = "--upgrade-bind";
/// Flag carrying the production address.
pub const BIND_FLAG: &str = "--bind";

/// A program and its arguments, ready to be spawned.
///
/// # Example
///
/// ```rust
/// use binswap::LaunchCommand;
///
/// let cmd = LaunchCommand::standby(
///     "/srv/app/update-1.2.0",
///     "127.0.0.1:8081".parse().unwrap(),
///     "0.0.0.0:8080".parse().unwrap(),
/// );
/// assert_eq!(
///     cmd.args,
///     vec!["--standby", "--upgrade-bind", "127.0.0.1:8081", "--bind", "0.0.0.0:8080"],
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// The program to execute.
    pub program: PathBuf,
    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// Command starting `program` in the standby role.
    pub fn standby(program: impl Into<PathBuf>, upgrade_bind: SocketAddr, bind: SocketAddr) -> Self {
        Self {
            program: program.into(),
            args: vec![
                STANDBY_FLAG.to_string(),
                UPGRADE_BIND_FLAG.to_string(),
                upgrade_bind.to_string(),
                BIND_FLAG.to_string(),
                bind.to_string(),
            ],
        }
    }
}

/// A process started by a [`ProcessLauncher`].
#[async_trait]
pub trait LaunchedProcess: Send {
    /// OS process id, if still known.
    fn id(&self) -> Option<u32>;

    /// Kill the process and reap it.
    async fn kill(&mut self) -> io::Result<()>;
}

/// Spawns standby processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync + 'static {
    /// Start `command` without waiting for it to exit.
    async fn launch(&self, command: &LaunchCommand) -> io::Result<Box<dyn LaunchedProcess>>;
}

/// Launcher backed by `tokio::process`.
///
/// The child inherits stdout and stderr and is not killed when its handle is
/// dropped: it must outlive the process that started it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(&self, command: &LaunchCommand) -> io::Result<Box<dyn LaunchedProcess>> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .env_remove(EMBEDDED_VERSION_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false)
            .spawn()?;

        debug!(bin = %command.program.display(), pid = ?child.id(), args = ?command.args, "spawned standby process");
        Ok(Box::new(child))
    }
}

#[async_trait]
impl LaunchedProcess for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    async fn kill(&mut self) -> io::Result<()> {
        Child::kill(self).await
    }
}
