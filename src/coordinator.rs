//! The upgrade coordinator.
//!
//! An upgrade walks through these states:
//!
//! ```text
//! Serving -> Selecting -> Draining -> Spawning -> AwaitingHandoff -> Replaced
//!               |                                                  \-> Failed
//!               \-> Serving (no candidate, scan error)
//! ```
//!
//! Selecting has no side effects and returns to `Serving` on failure. Once a
//! candidate is chosen the production listener is drained and the process is
//! committed: on success it terminates, on failure it either re-binds the
//! production address (when `rebind_on_failure` is set) or terminates
//! abnormally. Between draining and the standby binding the production
//! address, nobody accepts connections on it.

use crate::discovery::CandidateFinder;
use crate::handoff::HandoffClient;
use crate::launcher::{LaunchCommand, LaunchedProcess, ProcessLauncher};
use crate::{
    Candidate, DiscoveryError, ExitReason, HandoffError, ServerError, ServiceContext, UpgradeError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Where an upgrade currently stands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UpgradeState {
    /// Accepting connections on the production address, no upgrade running.
    Serving,
    /// Scanning and probing candidates.
    Selecting,
    /// Shutting down the production listener.
    Draining,
    /// Starting the standby process and waiting for it to become ready.
    Spawning,
    /// Waiting for the standby process to accept `/replace`.
    AwaitingHandoff,
    /// The standby process took over; this process is terminating.
    Replaced,
    /// The handoff failed with no way back; this process is terminating.
    Failed,
}

impl UpgradeState {
    /// Whether the process is committed to terminating.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Replaced | Self::Failed)
    }
}

/// Control over the listener bound to the production address.
#[async_trait]
pub trait ProductionListener: Send + Sync + 'static {
    /// Stop accepting connections and wait up to `grace` for in-flight
    /// requests. A timeout is reported as [`ServerError::ShutdownTimedOut`];
    /// the listener is stopped either way.
    async fn drain(&self, grace: Duration) -> Result<(), ServerError>;

    /// Bind the production address again.
    async fn rebind(&self) -> Result<SocketAddr, ServerError>;
}

/// A started upgrade.
#[derive(Debug)]
pub struct UpgradeTicket {
    /// The candidate being switched to.
    pub candidate: Candidate,
    /// Background task running the handoff; resolves to the final state.
    pub task: JoinHandle<UpgradeState>,
}

/// Drives discovery and the handoff to a standby process.
///
/// At most one upgrade runs per process: a trigger arriving while another is
/// in flight is rejected with [`UpgradeError::Busy`].
pub struct UpgradeCoordinator {
    ctx: ServiceContext,
    upgrade_bind: SocketAddr,
    finder: Arc<dyn CandidateFinder>,
    launcher: Arc<dyn ProcessLauncher>,
    client: Arc<dyn HandoffClient>,
    production: Arc<dyn ProductionListener>,
    permit: Arc<Semaphore>,
    state: watch::Sender<UpgradeState>,
}

impl UpgradeCoordinator {
    /// Create a coordinator that hands off through `upgrade_bind`.
    pub fn new(
        ctx: ServiceContext,
        upgrade_bind: SocketAddr,
        finder: Arc<dyn CandidateFinder>,
        launcher: Arc<dyn ProcessLauncher>,
        client: Arc<dyn HandoffClient>,
        production: Arc<dyn ProductionListener>,
    ) -> Self {
        let (state, _) = watch::channel(UpgradeState::Serving);
        Self {
            ctx,
            upgrade_bind,
            finder,
            launcher,
            client,
            production,
            permit: Arc::new(Semaphore::new(1)),
            state,
        }
    }

    /// Current state.
    pub fn state(&self) -> UpgradeState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<UpgradeState> {
        self.state.subscribe()
    }

    /// Find the newest candidate without side effects.
    pub async fn check(&self) -> Result<Candidate, DiscoveryError> {
        self.finder.newest(self.ctx.version()).await
    }

    /// Select a candidate and start the handoff in the background.
    ///
    /// Returns once a candidate is chosen; draining, spawning and the
    /// `/replace` call continue in the returned task.
    ///
    /// # Errors
    ///
    /// - `Busy` if an upgrade is already running
    /// - `Discovery` if selection failed; nothing has been changed
    pub async fn trigger(self: &Arc<Self>) -> Result<UpgradeTicket, UpgradeError> {
        let permit = Arc::clone(&self.permit)
            .try_acquire_owned()
            .map_err(|_| UpgradeError::Busy)?;

        self.transition(UpgradeState::Selecting);
        let candidate = match self.check().await {
            Ok(c) => c,
            Err(e) => {
                self.transition(UpgradeState::Serving);
                return Err(e.into());
            }
        };

        let this = Arc::clone(self);
        let target = candidate.clone();
        let task = tokio::spawn(async move { this.run(target, permit).await });

        Ok(UpgradeTicket { candidate, task })
    }

    async fn run(&self, candidate: Candidate, permit: OwnedSemaphorePermit) -> UpgradeState {
        let err = match self.hand_off(&candidate).await {
            Ok(()) => {
                info!(bin = %candidate.path().display(), version = %candidate.version(), "replace successful");
                permit.forget();
                self.transition(UpgradeState::Replaced);
                self.ctx.exit_signal().exit(ExitReason::Replaced);
                return UpgradeState::Replaced;
            }
            Err(e) => e,
        };

        error!(bin = %candidate.path().display(), error = %err, "handoff failed");

        if self.ctx.options().rebind_on_failure {
            match self.production.rebind().await {
                Ok(addr) => {
                    warn!(bind = %addr, "production listener re-bound after failed handoff");
                    self.transition(UpgradeState::Serving);
                    drop(permit);
                    return UpgradeState::Serving;
                }
                Err(rebind_err) => {
                    error!(error = %rebind_err, "re-bind production listener");
                }
            }
        }

        permit.forget();
        self.transition(UpgradeState::Failed);
        self.ctx
            .exit_signal()
            .exit(ExitReason::HandoffFailed(err.to_string()));
        UpgradeState::Failed
    }

    async fn hand_off(&self, candidate: &Candidate) -> Result<(), HandoffError> {
        let options = self.ctx.options();

        self.transition(UpgradeState::Draining);
        match self.production.drain(options.shutdown_grace).await {
            Ok(()) => {}
            Err(e @ ServerError::ShutdownTimedOut { .. }) => warn!(error = %e, "shutdown server"),
            Err(e) => warn!(error = %e, "shutdown server, continuing"),
        }

        self.transition(UpgradeState::Spawning);
        let command = LaunchCommand::standby(
            candidate.path(),
            self.upgrade_bind,
            self.ctx.role().production_addr(),
        );
        let mut child = self
            .launcher
            .launch(&command)
            .await
            .map_err(|source| HandoffError::Spawn {
                path: candidate.path().to_path_buf(),
                source,
            })?;
        info!(bin = %candidate.path().display(), bind = %self.upgrade_bind, pid = ?child.id(), "start upgraded server");

        if let Err(e) = self.await_ready().await {
            kill_child(child.as_mut()).await;
            return Err(e);
        }

        self.transition(UpgradeState::AwaitingHandoff);
        if let Err(e) = self.client.replace(self.upgrade_bind).await {
            kill_child(child.as_mut()).await;
            return Err(e);
        }

        Ok(())
    }

    async fn await_ready(&self) -> Result<(), HandoffError> {
        let options = self.ctx.options();
        let started = Instant::now();

        loop {
            if self.client.is_ready(self.upgrade_bind).await {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= options.ready_timeout {
                return Err(HandoffError::NotReady {
                    addr: self.upgrade_bind,
                    waited,
                });
            }
            tokio::time::sleep(options.ready_interval).await;
        }
    }

    fn transition(&self, next: UpgradeState) {
        let previous = self.state.send_replace(next);
        info!(from = %previous, to = %next, "upgrade state");
    }
}

async fn kill_child(child: &mut dyn LaunchedProcess) {
    if let Err(e) = child.kill().await {
        warn!(pid = ?child.id(), error = %e, "kill standby process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExitSignal, SemanticVersion, ServiceRole, UpgradeOptions};
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Drain,
        Rebind,
        Launch(LaunchCommand),
        Ready(SocketAddr),
        Replace(SocketAddr),
        Kill,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
    }

    impl Recorder {
        fn push(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct FakeFinder {
        result: Mutex<Option<Candidate>>,
        fail_scan: bool,
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    #[async_trait]
    impl CandidateFinder for FakeFinder {
        async fn newest(&self, _current: &SemanticVersion) -> Result<Candidate, DiscoveryError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_scan {
                return Err(crate::ScanError {
                    dir: "/missing".into(),
                    source: io::Error::from(io::ErrorKind::NotFound),
                }
                .into());
            }
            self.result.lock().unwrap().clone().ok_or(DiscoveryError::NoCandidate)
        }
    }

    struct FakeChild {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl LaunchedProcess for FakeChild {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        async fn kill(&mut self) -> io::Result<()> {
            self.recorder.push(Call::Kill);
            Ok(())
        }
    }

    struct FakeLauncher {
        recorder: Arc<Recorder>,
        fail: bool,
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn launch(&self, command: &LaunchCommand) -> io::Result<Box<dyn LaunchedProcess>> {
            self.recorder.push(Call::Launch(command.clone()));
            if self.fail {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            Ok(Box::new(FakeChild {
                recorder: Arc::clone(&self.recorder),
            }))
        }
    }

    struct FakeClient {
        recorder: Arc<Recorder>,
        ready_after: usize,
        polls: AtomicUsize,
        replace_ok: bool,
    }

    #[async_trait]
    impl HandoffClient for FakeClient {
        async fn is_ready(&self, addr: SocketAddr) -> bool {
            self.recorder.push(Call::Ready(addr));
            self.polls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
        }

        async fn replace(&self, addr: SocketAddr) -> Result<(), HandoffError> {
            self.recorder.push(Call::Replace(addr));
            if self.replace_ok {
                Ok(())
            } else {
                Err(HandoffError::Replace {
                    addr,
                    message: "connection refused".to_string(),
                })
            }
        }
    }

    struct FakeProduction {
        recorder: Arc<Recorder>,
        rebind_ok: bool,
        drain_times_out: bool,
        drained: AtomicBool,
    }

    #[async_trait]
    impl ProductionListener for FakeProduction {
        async fn drain(&self, grace: Duration) -> Result<(), ServerError> {
            self.recorder.push(Call::Drain);
            self.drained.store(true, Ordering::SeqCst);
            if self.drain_times_out {
                return Err(ServerError::ShutdownTimedOut {
                    addr: prod_addr(),
                    grace,
                });
            }
            Ok(())
        }

        async fn rebind(&self) -> Result<SocketAddr, ServerError> {
            self.recorder.push(Call::Rebind);
            let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
            if self.rebind_ok {
                Ok(addr)
            } else {
                Err(ServerError::Bind {
                    addr,
                    source: io::Error::from(io::ErrorKind::AddrInUse),
                })
            }
        }
    }

    struct Harness {
        coordinator: Arc<UpgradeCoordinator>,
        recorder: Arc<Recorder>,
        exit_rx: mpsc::UnboundedReceiver<ExitReason>,
    }

    #[derive(Clone, Copy)]
    struct Setup {
        candidate: bool,
        fail_scan: bool,
        fail_launch: bool,
        ready_after: usize,
        replace_ok: bool,
        rebind_on_failure: bool,
        rebind_ok: bool,
        drain_times_out: bool,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                candidate: true,
                fail_scan: false,
                fail_launch: false,
                ready_after: 1,
                replace_ok: true,
                rebind_on_failure: true,
                rebind_ok: true,
                drain_times_out: false,
            }
        }
    }

    fn prod_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn temp_addr() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn candidate() -> Candidate {
        Candidate::new("/srv/app/update-1.2.0", SemanticVersion::parse("1.2.0").unwrap())
    }

    fn harness(setup: Setup, gate: Option<Arc<tokio::sync::Notify>>) -> Harness {
        let recorder = Arc::new(Recorder::default());
        let (exit, exit_rx) = ExitSignal::channel();
        let options = UpgradeOptions {
            ready_timeout: Duration::from_millis(50),
            ready_interval: Duration::from_millis(5),
            rebind_on_failure: setup.rebind_on_failure,
            ..Default::default()
        };
        let ctx = ServiceContext::new(
            SemanticVersion::parse("1.0.0").unwrap(),
            ServiceRole::Primary { bind: prod_addr() },
            options,
            exit,
        );

        let coordinator = Arc::new(UpgradeCoordinator::new(
            ctx,
            temp_addr(),
            Arc::new(FakeFinder {
                result: Mutex::new(setup.candidate.then(candidate)),
                fail_scan: setup.fail_scan,
                gate,
            }),
            Arc::new(FakeLauncher {
                recorder: Arc::clone(&recorder),
                fail: setup.fail_launch,
            }),
            Arc::new(FakeClient {
                recorder: Arc::clone(&recorder),
                ready_after: setup.ready_after,
                polls: AtomicUsize::new(0),
                replace_ok: setup.replace_ok,
            }),
            Arc::new(FakeProduction {
                recorder: Arc::clone(&recorder),
                rebind_ok: setup.rebind_ok,
                drain_times_out: setup.drain_times_out,
                drained: AtomicBool::new(false),
            }),
        ));

        Harness {
            coordinator,
            recorder,
            exit_rx,
        }
    }

    fn standby_launch() -> Call {
        Call::Launch(LaunchCommand::standby(
            "/srv/app/update-1.2.0",
            temp_addr(),
            prod_addr(),
        ))
    }

    #[tokio::test]
    async fn test_successful_handoff_sequence() {
        let mut h = harness(Setup::default(), None);

        let ticket = h.coordinator.trigger().await.unwrap();
        assert_eq!(ticket.candidate, candidate());
        assert_eq!(ticket.task.await.unwrap(), UpgradeState::Replaced);

        assert_eq!(
            h.recorder.calls(),
            vec![
                Call::Drain,
                standby_launch(),
                Call::Ready(temp_addr()),
                Call::Replace(temp_addr()),
            ]
        );
        assert_eq!(h.exit_rx.recv().await, Some(ExitReason::Replaced));
        assert!(h.exit_rx.try_recv().is_err());
        assert_eq!(h.coordinator.state(), UpgradeState::Replaced);
    }

    #[tokio::test]
    async fn test_drain_timeout_does_not_stop_handoff() {
        let mut h = harness(
            Setup {
                drain_times_out: true,
                ..Default::default()
            },
            None,
        );

        let ticket = h.coordinator.trigger().await.unwrap();
        assert_eq!(ticket.task.await.unwrap(), UpgradeState::Replaced);

        assert_eq!(
            h.recorder.calls(),
            vec![
                Call::Drain,
                standby_launch(),
                Call::Ready(temp_addr()),
                Call::Replace(temp_addr()),
            ]
        );
        assert_eq!(h.exit_rx.recv().await, Some(ExitReason::Replaced));
    }

    #[tokio::test]
    async fn test_polls_until_ready() {
        let h = harness(
            Setup {
                ready_after: 3,
                ..Default::default()
            },
            None,
        );

        let ticket = h.coordinator.trigger().await.unwrap();
        assert_eq!(ticket.task.await.unwrap(), UpgradeState::Replaced);

        let polls = h
            .recorder
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Ready(_)))
            .count();
        assert_eq!(polls, 3);
    }

    #[tokio::test]
    async fn test_no_candidate_has_no_side_effects() {
        let mut h = harness(
            Setup {
                candidate: false,
                ..Default::default()
            },
            None,
        );

        let err = h.coordinator.trigger().await.unwrap_err();
        assert!(matches!(err, UpgradeError::Discovery(DiscoveryError::NoCandidate)));
        assert!(h.recorder.calls().is_empty());
        assert_eq!(h.coordinator.state(), UpgradeState::Serving);
        assert!(h.exit_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scan_error_has_no_side_effects() {
        let h = harness(
            Setup {
                fail_scan: true,
                ..Default::default()
            },
            None,
        );

        let err = h.coordinator.trigger().await.unwrap_err();
        assert!(matches!(err, UpgradeError::Discovery(DiscoveryError::Scan(_))));
        assert!(h.recorder.calls().is_empty());

        // The lock was released: a later trigger is not rejected as busy.
        let again = h.coordinator.trigger().await.unwrap_err();
        assert!(matches!(again, UpgradeError::Discovery(_)));
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_busy() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let h = harness(Setup::default(), Some(Arc::clone(&gate)));

        let first = {
            let coordinator = Arc::clone(&h.coordinator);
            tokio::spawn(async move { coordinator.trigger().await })
        };

        // Wait until the first trigger holds the lock.
        let mut states = h.coordinator.subscribe();
        states
            .wait_for(|s| *s == UpgradeState::Selecting)
            .await
            .unwrap();

        let second = h.coordinator.trigger().await;
        assert!(matches!(second, Err(UpgradeError::Busy)));

        gate.notify_one();
        let ticket = first.await.unwrap().unwrap();
        assert_eq!(ticket.task.await.unwrap(), UpgradeState::Replaced);

        let launches = h
            .recorder
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Launch(_)))
            .count();
        assert_eq!(launches, 1);
    }

    #[tokio::test]
    async fn test_check_does_not_take_lock() {
        let h = harness(Setup::default(), None);
        assert_eq!(h.coordinator.check().await.unwrap(), candidate());
        assert_eq!(h.coordinator.state(), UpgradeState::Serving);
        assert!(h.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_rebinds() {
        let mut h = harness(
            Setup {
                fail_launch: true,
                ..Default::default()
            },
            None,
        );

        let ticket = h.coordinator.trigger().await.unwrap();
        assert_eq!(ticket.task.await.unwrap(), UpgradeState::Serving);
        assert_eq!(h.recorder.calls(), vec![Call::Drain, standby_launch(), Call::Rebind]);
        assert!(h.exit_rx.try_recv().is_err());

        // Back to serving: another upgrade may be attempted.
        let retry = h.coordinator.trigger().await;
        assert!(retry.is_ok());
    }

    #[tokio::test]
    async fn test_not_ready_kills_child_and_rebinds() {
        let h = harness(
            Setup {
                ready_after: usize::MAX,
                ..Default::default()
            },
            None,
        );

        let ticket = h.coordinator.trigger().await.unwrap();
        assert_eq!(ticket.task.await.unwrap(), UpgradeState::Serving);

        let calls = h.recorder.calls();
        assert!(!calls.contains(&Call::Replace(temp_addr())));
        assert_eq!(&calls[calls.len() - 2..], &[Call::Kill, Call::Rebind]);
    }

    #[tokio::test]
    async fn test_replace_failure_without_rebind_terminates() {
        let mut h = harness(
            Setup {
                replace_ok: false,
                rebind_on_failure: false,
                ..Default::default()
            },
            None,
        );

        let ticket = h.coordinator.trigger().await.unwrap();
        assert_eq!(ticket.task.await.unwrap(), UpgradeState::Failed);

        assert_eq!(
            h.recorder.calls(),
            vec![
                Call::Drain,
                standby_launch(),
                Call::Ready(temp_addr()),
                Call::Replace(temp_addr()),
                Call::Kill,
            ]
        );
        assert!(matches!(h.exit_rx.recv().await, Some(ExitReason::HandoffFailed(_))));

        // Terminal: further triggers are refused.
        assert!(matches!(h.coordinator.trigger().await, Err(UpgradeError::Busy)));
    }

    #[tokio::test]
    async fn test_failed_rebind_terminates() {
        let mut h = harness(
            Setup {
                replace_ok: false,
                rebind_ok: false,
                ..Default::default()
            },
            None,
        );

        let ticket = h.coordinator.trigger().await.unwrap();
        assert_eq!(ticket.task.await.unwrap(), UpgradeState::Failed);
        assert!(h.recorder.calls().contains(&Call::Rebind));
        assert!(matches!(h.exit_rx.recv().await, Some(ExitReason::HandoffFailed(_))));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(UpgradeState::AwaitingHandoff.to_string(), "awaiting_handoff");
        assert_eq!(
            serde_json::to_string(&UpgradeState::Serving).unwrap(),
            "\"serving\""
        );
        assert!(UpgradeState::Replaced.is_terminal());
        assert!(!UpgradeState::Draining.is_terminal());
    }
}
