//! Wiring of a complete service process.

use crate::coordinator::{ProductionListener, UpgradeCoordinator};
use crate::discovery::{CandidateFinder, DirectoryFinder};
use crate::handoff::{HandoffClient, HttpHandoffClient};
use crate::launcher::{ProcessLauncher, TokioLauncher};
use crate::server::{primary_router, standby_router, AppState, ProductionServer, StandbyHandoff};
use crate::{ServerError, ServiceContext, ServiceRole};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// A service process in either role.
///
/// # Example
///
/// ```rust,no_run
/// use binswap::{ExitSignal, SemanticVersion, Service, ServiceContext, ServiceRole, UpgradeOptions};
///
/// #[tokio::main]
/// async fn main() {
///     let (exit, mut exit_rx) = ExitSignal::channel();
///     let role = ServiceRole::Primary { bind: "0.0.0.0:8080".parse().unwrap() };
///     let ctx = ServiceContext::new(
///         SemanticVersion::parse("1.0.0").unwrap(),
///         role,
///         UpgradeOptions::default(),
///         exit,
///     );
///
///     let service = Service::build(ctx, "127.0.0.1:8081".parse().unwrap()).unwrap();
///     service.start().await.unwrap();
///     let reason = exit_rx.recv().await;
///     println!("terminating: {reason:?}");
/// }
/// ```
pub struct Service {
    ctx: ServiceContext,
    coordinator: Arc<UpgradeCoordinator>,
    production: Arc<ProductionServer>,
    standby: Option<Arc<StandbyHandoff>>,
}

impl Service {
    /// Assemble a service with the default finder, launcher and HTTP client.
    pub fn build(ctx: ServiceContext, upgrade_bind: SocketAddr) -> Result<Self, reqwest::Error> {
        let options = ctx.options().clone();
        let client = HttpHandoffClient::new(options.replace_timeout)?;
        Ok(Self::with_parts(
            ctx,
            upgrade_bind,
            Arc::new(DirectoryFinder::new(options)),
            Arc::new(TokioLauncher),
            Arc::new(client),
        ))
    }

    /// Assemble a service from explicit collaborators.
    pub fn with_parts(
        ctx: ServiceContext,
        upgrade_bind: SocketAddr,
        finder: Arc<dyn CandidateFinder>,
        launcher: Arc<dyn ProcessLauncher>,
        client: Arc<dyn HandoffClient>,
    ) -> Self {
        let production = Arc::new(ProductionServer::new(ctx.role().production_addr()));
        let coordinator = Arc::new(UpgradeCoordinator::new(
            ctx.clone(),
            upgrade_bind,
            finder,
            launcher,
            client,
            Arc::clone(&production) as Arc<dyn ProductionListener>,
        ));
        let standby = ctx
            .role()
            .is_standby()
            .then(|| Arc::new(StandbyHandoff::new(ctx.clone(), Arc::clone(&production))));

        let state = AppState::new(ctx.clone(), Arc::clone(&coordinator), standby.clone());
        production.install_router(primary_router(state));

        Self {
            ctx,
            coordinator,
            production,
            standby,
        }
    }

    /// Start listening according to the role and return the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let addr = match (self.ctx.role(), &self.standby) {
            (ServiceRole::Standby { .. }, Some(standby)) => {
                let state = AppState::new(
                    self.ctx.clone(),
                    Arc::clone(&self.coordinator),
                    Some(Arc::clone(standby)),
                );
                standby.start_temporary(standby_router(state)).await?
            }
            _ => self.production.start().await?,
        };

        info!(bind = %addr, version = %self.ctx.version(), role = %self.ctx.role().kind(), "start");
        Ok(addr)
    }

    /// The upgrade coordinator.
    pub fn coordinator(&self) -> &Arc<UpgradeCoordinator> {
        &self.coordinator
    }

    /// The production listener.
    pub fn production(&self) -> &Arc<ProductionServer> {
        &self.production
    }

    /// The standby handoff, in a standby process.
    pub fn standby(&self) -> Option<&Arc<StandbyHandoff>> {
        self.standby.as_ref()
    }

    /// Stop every listener, waiting up to the configured grace period.
    pub async fn shutdown(&self) {
        let grace = self.ctx.options().shutdown_grace;
        if let Some(standby) = &self.standby {
            if let Err(e) = standby.stop_temporary(grace).await {
                warn!(error = %e, "shutdown temporary server");
            }
        }
        if let Err(e) = self.production.stop(grace).await {
            warn!(error = %e, "shutdown server");
        }
    }
}
