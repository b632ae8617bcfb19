//! hostwall - host firewall control plane
//!
//! # Usage
//!
//! ```bash
//! hostwall run                       # Run the daemon with the default config
//! hostwall run --config fw.json      # Run with an explicit config file
//! hostwall config                    # Validate and print the effective config
//! hostwall backend                   # Show which mechanism auto-detection picks
//! hostwall --log-level debug run     # Override RUST_LOG
//! ```
//!
//! # Shutdown
//!
//! On SIGINT/SIGTERM producers stop before the hub: capture is cancelled and
//! the bridge awaited, then the observer endpoint, then the hub closes every
//! remaining observer queue. Installed rules stay in the kernel.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hostwall::backend::{BackendKind, create_backend};
use hostwall::bridge::Bridge;
use hostwall::capture::{CaptureMode, create_monitor};
use hostwall::config::{Config, load_config};
use hostwall::hub::{BROADCAST_CAPACITY, Hub};
use hostwall::manager::Manager;
use hostwall::observer::{self, KEEPALIVE_INTERVAL};

#[derive(Parser)]
#[command(name = "hostwall")]
#[command(about = "Host firewall control plane with a live traffic feed", long_about = None)]
struct Cli {
    /// Log filter, e.g. `info` or `hostwall=debug` (overrides RUST_LOG)
    #[arg(long, global = true, value_name = "FILTER")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until interrupted
    Run {
        /// Configuration file (default: XDG config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate the configuration and print it with defaults filled in
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the backend auto-detection would choose on this host
    Backend,
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .compact()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn resolve_config(path: Option<PathBuf>) -> hostwall::Result<Config> {
    match path.or_else(hostwall::utils::default_config_path) {
        Some(path) => load_config(&path).await,
        None => {
            warn!("No config directory available, using defaults");
            Ok(Config::default())
        }
    }
}

async fn handle_cli(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Run { config } => {
            let config = resolve_config(config).await?;
            run_daemon(config).await?;
        }
        Commands::Config { config } => {
            let config = resolve_config(config).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Backend => {
            println!("{}", BackendKind::Auto.resolve());
        }
    }
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

async fn run_daemon(config: Config) -> hostwall::Result<()> {
    let (hub, hub_task) = Hub::spawn(BROADCAST_CAPACITY, config.client_buffer);

    let backend = create_backend(config.backend).await?;
    let manager = Manager::new(backend, config.immutable_ports.clone()).with_events(hub.clone());
    manager.ensure_immutable_ports().await?;

    if !config.rules.is_empty() {
        manager.apply_rules(config.rules.clone()).await?;
    }
    for cidr in &config.blocklist {
        manager.block_source(*cidr).await?;
    }
    info!(
        "{} backend: {} rules, {} immutable ports",
        manager.backend_name(),
        manager.list_rules().await.len(),
        manager.immutable_ports().await.len()
    );

    let capture_cancel = CancellationToken::new();
    let bridge_task = match create_monitor(config.capture, config.nflog_group, config.synthetic_interval()) {
        Some(monitor) => {
            if config.capture == CaptureMode::Nflog {
                manager.setup_traffic_monitoring(config.nflog_group).await?;
            }
            let bridge = Bridge::new(monitor, hub.clone());
            let cancel = capture_cancel.clone();
            let events = hub.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = bridge.run(cancel).await {
                    error!("Traffic capture stopped: {e}");
                    events.emit_error("capture", e.to_string());
                }
            }))
        }
        None => {
            info!("Traffic capture disabled");
            None
        }
    };

    let listener = TcpListener::bind(config.observer_addr).await?;
    let observer_cancel = CancellationToken::new();
    let observer_task = tokio::spawn(observer::serve(
        listener,
        hub.clone(),
        KEEPALIVE_INTERVAL,
        observer_cancel.clone(),
    ));

    shutdown_signal().await?;
    info!("Shutting down");

    capture_cancel.cancel();
    if let Some(task) = bridge_task
        && let Err(e) = task.await
    {
        warn!("Bridge task ended abnormally: {e}");
    }

    observer_cancel.cancel();
    match observer_task.await {
        Ok(Err(e)) => warn!("Observer endpoint failed: {e}"),
        Err(e) => warn!("Observer task ended abnormally: {e}"),
        Ok(Ok(())) => {}
    }

    hub.shutdown();
    if let Err(e) = hub_task.await {
        warn!("Hub task ended abnormally: {e}");
    }

    info!("Stopped; {} managed rules remain installed", manager.list_rules().await.len());
    Ok(())
}
