//! HTTP listeners and control-plane endpoints.
//!
//! A primary process serves `/`, `/ready`, `/check` and `/upgrade` on the
//! production address. A standby process serves `/`, `/ready` and `/replace`
//! on the temporary address until `/replace` moves it to the production
//! address with the full primary router.

use crate::coordinator::{ProductionListener, UpgradeCoordinator, UpgradeState};
use crate::{
    DiscoveryError, ExitReason, ReplaceError, RoleKind, ServerError, ServiceContext, UpgradeError,
};
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A running listener.
///
/// Every request runs under a guard that answers `503` and drops the handler
/// once the shutdown grace period has expired.
pub struct ListenerHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    expired: watch::Sender<bool>,
}

impl ListenerHandle {
    /// Bind `addr` and serve `router` on a background task.
    pub async fn bind(addr: SocketAddr, router: Router) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let address = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let (expired_tx, expired_rx) = watch::channel(false);
        let router = router.layer(middleware::from_fn_with_state(expired_rx, cut_after_grace));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                error!(bind = %address, error = %err, "listen and serve");
            }
        });

        Ok(Self {
            address,
            task,
            shutdown: shutdown_tx,
            expired: expired_tx,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Stop accepting connections and wait up to `grace` for open ones.
    ///
    /// The socket is released as soon as shutdown starts. When the grace
    /// period expires, requests still in flight are cut with `503`, the
    /// serving task is aborted and [`ServerError::ShutdownTimedOut`] is
    /// returned.
    pub async fn shutdown(self, grace: Duration) -> Result<(), ServerError> {
        let Self {
            address,
            mut task,
            shutdown,
            expired,
        } = self;
        let _ = shutdown.send(true);

        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => {
                info!(bind = %address, "listener stopped");
                Ok(())
            }
            Err(_) => {
                let _ = expired.send(true);
                task.abort();
                Err(ServerError::ShutdownTimedOut {
                    addr: address,
                    grace,
                })
            }
        }
    }
}

/// The listener on the production address, which can be stopped and
/// started again.
pub struct ProductionServer {
    addr: SocketAddr,
    router: OnceLock<Router>,
    handle: Mutex<Option<ListenerHandle>>,
}

impl ProductionServer {
    /// A stopped production server for `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            router: OnceLock::new(),
            handle: Mutex::new(None),
        }
    }

    /// Set the router served on every start. Only the first call has effect.
    pub fn install_router(&self, router: Router) {
        let _ = self.router.set(router);
    }

    /// Bind the production address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut slot = self.handle.lock().await;
        if let Some(running) = slot.as_ref() {
            return Err(ServerError::AlreadyRunning {
                addr: running.local_addr(),
            });
        }
        let router = self
            .router
            .get()
            .cloned()
            .ok_or(ServerError::NotConfigured { addr: self.addr })?;

        let handle = ListenerHandle::bind(self.addr, router).await?;
        let bound = handle.local_addr();
        *slot = Some(handle);
        Ok(bound)
    }

    /// The bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.lock().await.as_ref().map(ListenerHandle::local_addr)
    }

    /// Stop the listener if it is running.
    pub async fn stop(&self, grace: Duration) -> Result<(), ServerError> {
        let running = self.handle.lock().await.take();
        match running {
            Some(handle) => handle.shutdown(grace).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProductionListener for ProductionServer {
    async fn drain(&self, grace: Duration) -> Result<(), ServerError> {
        self.stop(grace).await
    }

    async fn rebind(&self) -> Result<SocketAddr, ServerError> {
        self.start().await
    }
}

/// Standby side of the handoff: the temporary listener and the switch to
/// the production address.
pub struct StandbyHandoff {
    ctx: ServiceContext,
    production: Arc<ProductionServer>,
    temporary: Mutex<Option<ListenerHandle>>,
    claimed: AtomicBool,
}

impl StandbyHandoff {
    /// Create the standby side for a process whose production server is
    /// `production`.
    pub fn new(ctx: ServiceContext, production: Arc<ProductionServer>) -> Self {
        Self {
            ctx,
            production,
            temporary: Mutex::new(None),
            claimed: AtomicBool::new(false),
        }
    }

    /// Bind the temporary address with `router`.
    pub async fn start_temporary(&self, router: Router) -> Result<SocketAddr, ServerError> {
        let mut slot = self.temporary.lock().await;
        if let Some(running) = slot.as_ref() {
            return Err(ServerError::AlreadyRunning {
                addr: running.local_addr(),
            });
        }
        let handle = ListenerHandle::bind(self.ctx.role().listen_addr(), router).await?;
        let bound = handle.local_addr();
        *slot = Some(handle);
        Ok(bound)
    }

    /// Whether `/replace` has been accepted.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Accept a `/replace` request and move to the production address in
    /// the background.
    ///
    /// Only the first call is accepted.
    pub fn begin(self: &Arc<Self>) -> Result<JoinHandle<()>, ReplaceError> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReplaceError::AlreadyReplaced);
        }

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.take_over().await }))
    }

    async fn take_over(&self) {
        let options = self.ctx.options();
        tokio::time::sleep(options.flush_delay).await;

        let temporary = self.temporary.lock().await.take();
        if let Some(handle) = temporary {
            if let Err(e) = handle.shutdown(options.shutdown_grace).await {
                warn!(error = %e, "shutdown temporary server");
            }
        }

        match self.production.start().await {
            Ok(addr) => {
                info!(bind = %addr, version = %self.ctx.version(), "start");
            }
            Err(e) => {
                error!(error = %e, "listen and serve on replace");
                self.ctx
                    .exit_signal()
                    .exit(ExitReason::RebindFailed(e.to_string()));
            }
        }
    }

    /// Stop the temporary listener if it is still running.
    pub async fn stop_temporary(&self, grace: Duration) -> Result<(), ServerError> {
        let running = self.temporary.lock().await.take();
        match running {
            Some(handle) => handle.shutdown(grace).await,
            None => Ok(()),
        }
    }
}

/// Body of the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Embedded version of the running build.
    pub version: String,
    /// Role selected at start.
    pub role: RoleKind,
    /// Current upgrade state.
    pub state: UpgradeState,
}

/// State shared by the control-plane handlers.
#[derive(Clone)]
pub struct AppState {
    ctx: ServiceContext,
    coordinator: Arc<UpgradeCoordinator>,
    standby: Option<Arc<StandbyHandoff>>,
}

impl AppState {
    /// Bundle handler state. `standby` is `None` in a primary process.
    pub fn new(ctx: ServiceContext, coordinator: Arc<UpgradeCoordinator>, standby: Option<Arc<StandbyHandoff>>) -> Self {
        Self {
            ctx,
            coordinator,
            standby,
        }
    }
}

/// Router served on the production address.
pub fn primary_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/ready", get(ready))
        .route("/check", get(check))
        .route("/upgrade", get(upgrade))
        .route("/replace", get(replace))
        .with_state(state)
}

/// Router served on the temporary address by a standby process.
pub fn standby_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/ready", get(ready))
        .route("/replace", get(replace))
        .with_state(state)
}

async fn cut_after_grace(State(mut expired): State<watch::Receiver<bool>>, request: Request, next: Next) -> Response {
    let grace_expired = async move {
        let closed = expired.wait_for(|expired| *expired).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        response = next.run(request) => response,
        () = grace_expired => {
            warn!("request cut after shutdown grace period");
            (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response()
        }
    }
}

fn log_request(method: &Method, uri: &Uri) {
    info!(method = %method, uri = %uri, "handle HTTP request");
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(StatusReport {
        version: state.ctx.version().to_string(),
        role: state.ctx.role().kind(),
        state: state.coordinator.state(),
    })
}

async fn ready() -> &'static str {
    "ready"
}

async fn check(method: Method, uri: Uri, State(state): State<AppState>) -> Response {
    log_request(&method, &uri);
    match state.coordinator.check().await {
        Ok(candidate) => (StatusCode::OK, candidate.path().display().to_string()).into_response(),
        Err(e) => discovery_failure(e),
    }
}

async fn upgrade(method: Method, uri: Uri, State(state): State<AppState>) -> Response {
    log_request(&method, &uri);
    match state.coordinator.trigger().await {
        Ok(ticket) => (StatusCode::OK, ticket.candidate.path().display().to_string()).into_response(),
        Err(UpgradeError::Busy) => {
            warn!("upgrade rejected, another upgrade is in progress");
            (StatusCode::CONFLICT, UpgradeError::Busy.to_string()).into_response()
        }
        Err(UpgradeError::Discovery(e)) => discovery_failure(e),
    }
}

async fn replace(method: Method, uri: Uri, State(state): State<AppState>) -> Response {
    log_request(&method, &uri);
    let outcome = match &state.standby {
        Some(standby) => standby.begin().map(|_| ()),
        None => Err(ReplaceError::NotStandby),
    };

    match outcome {
        Ok(()) => (StatusCode::OK, "replacing").into_response(),
        Err(e) => {
            warn!(error = %e, "rejected replace request");
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
    }
}

fn discovery_failure(err: DiscoveryError) -> Response {
    match err {
        DiscoveryError::NoCandidate => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
        other => {
            error!(error = %other, "get newest upgrade candidate");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}
