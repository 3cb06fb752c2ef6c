//! gateguard binary: load one profile, wire the supervisor, run until
//! signalled.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateguard::config::{self, Profile, ProfileConfig};
use gateguard::lifecycle::signals;
use gateguard::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "gateguard")]
#[command(about = "Admission-limiting TCP reverse proxy for game login/game services", long_about = None)]
struct Cli {
    /// Path to the JSON config file (default: discover config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Which profile to run.
    #[arg(long, value_enum, default_value_t = Profile::Login)]
    profile: Profile,

    /// Override the configured log level (debug|info|warn|error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut cfg = match config::load_profile(cli.config.as_deref(), cli.profile) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = cli.log_level {
        cfg.log_level = level;
    }

    init_tracing(&cfg, cli.profile);

    if !cfg.metrics_listen_addr.is_empty() {
        init_metrics(&cfg.metrics_listen_addr);
    }

    tracing::info!(
        profile = %cli.profile,
        listen_addr = %cfg.listen_addr,
        backend_addr = %cfg.backend_addr,
        max_total_conns = cfg.max_total_conns,
        "gateguard starting"
    );

    let supervisor = Supervisor::new(cfg, cli.profile);

    // Interactive stop: first SIGINT/SIGTERM triggers graceful shutdown.
    {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            signals::wait_for_signal().await;
            tracing::info!("shutdown signal received");
            supervisor.shutdown().trigger();
        });
    }

    match supervisor.run().await {
        Ok(()) => {
            tracing::info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "gateguard failed");
            ExitCode::FAILURE
        }
    }
}

/// Initialise the tracing subscriber.
///
/// An explicit `log_file` wins; with no console (service-style launch)
/// logs land in a file next to the executable; otherwise stderr.
fn init_tracing(cfg: &ProfileConfig, profile: Profile) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("gateguard={}", cfg.log_level)));

    let log_path = if !cfg.log_file.is_empty() {
        Some(PathBuf::from(&cfg.log_file))
    } else if !std::io::stderr().is_terminal() {
        Some(default_log_path(profile))
    } else {
        None
    };

    if let Some(path) = log_path {
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(false)
                            .with_writer(Arc::new(file)),
                    )
                    .init();
                tracing::info!(log_file = %path.display(), "logging to file");
                return;
            }
            Err(e) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
                tracing::warn!(
                    log_file = %path.display(),
                    error = %e,
                    "could not open log file, using stderr"
                );
                return;
            }
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_log_path(profile: Profile) -> PathBuf {
    let name = format!("gateguard-{profile}.log");
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Start the Prometheus exporter when configured.
fn init_metrics(listen_addr: &str) {
    let addr: std::net::SocketAddr = match listen_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(metrics_listen_addr = %listen_addr, error = %e, "invalid metrics address");
            return;
        }
    };
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!(address = %addr, "metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "failed to install metrics exporter"),
    }
}
