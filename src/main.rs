use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use binswap::{
    current_exe_name, ExitSignal, SemanticVersion, Service, ServiceContext, ServiceRole, UpgradeOptions,
    BUILD_VERSION, DEFAULT_PREFIX, EMBEDDED_VERSION_ENV, VERSION_FLAG,
};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_UPGRADE_BIND: &str = "127.0.0.1:8081";

#[derive(Parser, Debug)]
#[command(
    name = "binswap",
    about = "HTTP service that can replace itself with a newer build in place",
    disable_version_flag = true
)]
struct Cli {
    /// Production address.
    #[arg(long, env = "BINSWAP_BIND", default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// Temporary address used during an upgrade.
    #[arg(long, env = "BINSWAP_UPGRADE_BIND", default_value = DEFAULT_UPGRADE_BIND)]
    upgrade_bind: SocketAddr,

    /// Start in the standby role, listening on the upgrade address until
    /// `/replace` is called. Used by the upgrade mechanism.
    #[arg(long)]
    standby: bool,

    /// Print the bare version and exit.
    #[arg(short = 'V', long = "version")]
    print_version: bool,

    /// Version reported by this build.
    #[arg(long, env = EMBEDDED_VERSION_ENV, default_value = BUILD_VERSION, hide = true)]
    embedded_version: String,

    /// Directory scanned for upgrade candidates.
    #[arg(long, env = "BINSWAP_CANDIDATE_DIR", default_value = ".")]
    candidate_dir: PathBuf,

    /// Required file name prefix of upgrade candidates.
    #[arg(long, env = "BINSWAP_PREFIX", default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Timeout of a single version probe.
    #[arg(long, env = "BINSWAP_PROBE_TIMEOUT_MS", default_value_t = 2000)]
    probe_timeout_ms: u64,

    /// Maximum number of concurrent version probes.
    #[arg(long, env = "BINSWAP_PROBE_CONCURRENCY", default_value_t = 4)]
    probe_concurrency: usize,

    /// Grace period for in-flight requests when stopping a listener.
    #[arg(long, env = "BINSWAP_SHUTDOWN_GRACE_MS", default_value_t = 3000)]
    shutdown_grace_ms: u64,

    /// How long to wait for the standby process to become ready.
    #[arg(long, env = "BINSWAP_READY_TIMEOUT_MS", default_value_t = 5000)]
    ready_timeout_ms: u64,

    /// Delay between readiness polls.
    #[arg(long, env = "BINSWAP_READY_INTERVAL_MS", default_value_t = 100)]
    ready_interval_ms: u64,

    /// Timeout of the `/replace` call.
    #[arg(long, env = "BINSWAP_REPLACE_TIMEOUT_MS", default_value_t = 5000)]
    replace_timeout_ms: u64,

    /// Pause before a standby process leaves its temporary address.
    #[arg(long, env = "BINSWAP_FLUSH_DELAY_MS", default_value_t = 250)]
    flush_delay_ms: u64,

    /// Terminate instead of re-binding the production address when a
    /// handoff fails.
    #[arg(long)]
    no_rebind_on_failure: bool,

    /// Human-readable logs instead of JSON.
    #[arg(long)]
    dev: bool,
}

impl Cli {
    fn upgrade_options(&self) -> UpgradeOptions {
        UpgradeOptions {
            candidate_dir: self.candidate_dir.clone(),
            prefix: self.prefix.clone(),
            self_name: current_exe_name(),
            version_flag: VERSION_FLAG.to_string(),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            probe_concurrency: self.probe_concurrency,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            ready_interval: Duration::from_millis(self.ready_interval_ms),
            replace_timeout: Duration::from_millis(self.replace_timeout_ms),
            flush_delay: Duration::from_millis(self.flush_delay_ms),
            rebind_on_failure: !self.no_rebind_on_failure,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Answered before logging starts: probes expect nothing but the version.
    if cli.print_version {
        println!("{}", cli.embedded_version);
        return Ok(ExitCode::SUCCESS);
    }

    init_tracing(cli.dev);

    let version = SemanticVersion::parse(&cli.embedded_version).context("parse embedded version")?;
    let role = ServiceRole::from_flags(cli.standby, cli.bind, cli.upgrade_bind);
    let (exit, mut exit_rx) = ExitSignal::channel();
    let ctx = ServiceContext::new(version, role, cli.upgrade_options(), exit);

    let service = Service::build(ctx, cli.upgrade_bind).context("build handoff client")?;
    service.start().await.context("start listener")?;

    let code = tokio::select! {
        reason = exit_rx.recv() => match reason {
            Some(reason) if reason.exit_code() == 0 => {
                info!(reason = ?reason, "terminating");
                reason.exit_code()
            }
            Some(reason) => {
                error!(reason = ?reason, "terminating");
                reason.exit_code()
            }
            None => 0,
        },
        sig = shutdown_signal() => {
            info!(signal = sig, "catch signal");
            service.shutdown().await;
            0
        }
    };

    Ok(ExitCode::from(code))
}

fn init_tracing(dev: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    // Logs go to stderr so stdout stays reserved for the version answer.
    if dev {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    }
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
