//! ss-relay: Multi-tenant Shadowsocks relay
//!
//! This is the main entry point for the relay server.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration path
//! ./ss-relay
//!
//! # Run with custom configuration
//! ./ss-relay -c /path/to/config.json
//!
//! # Reload access keys without restarting
//! kill -HUP $(pidof ss-relay)
//!
//! # Run with environment overrides
//! SS_RELAY_LOG_LEVEL=debug ./ss-relay
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ss_relay::config::{create_default_config, load_config_with_env, LogConfig};
use ss_relay::ipc::{IpcHandler, IpcServer};
use ss_relay::ss_inbound::{Reconciler, RelayContext};
use ss_relay::stats::{RelayMetrics, RelayStats};

/// Time allowed for the IPC server to stop after shutdown
const IPC_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/ss-relay/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("ss-relay v{}", ss_relay::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"ss-relay v{}

Multi-tenant, multi-port Shadowsocks relay.

USAGE:
    ss-relay [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/ss-relay/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    SS_RELAY_LOG_LEVEL          Override log level (trace, debug, info, warn, error)
    SS_RELAY_REPLAY_HISTORY     Override replay cache capacity (0 disables)
    SS_RELAY_NAT_TIMEOUT_SECS   Override UDP NAT idle timeout
    SS_RELAY_IPC_SOCKET         Override IPC socket path

SIGNALS:
    SIGHUP                  Reload access keys from the configuration file
    SIGINT, SIGTERM         Close all ports and exit
"#,
        ss_relay::VERSION
    );
}

/// Initialize logging
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(log.target);

    if log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).with_context(|| {
        format!("Failed to load configuration from {:?}", args.config_path)
    })?;

    if args.check_config {
        println!(
            "Configuration is valid: {} keys on {} ports",
            config.keys.len(),
            config.ports().len()
        );
        return Ok(());
    }

    init_logging(&config.log);

    info!("ss-relay v{}", ss_relay::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let stats = Arc::new(RelayStats::new());
    let metrics: Arc<dyn RelayMetrics> = stats.clone();
    let ctx = Arc::new(RelayContext::from_config(&config.server, metrics));
    let reconciler = Arc::new(Reconciler::new(ctx));

    // A port that cannot be opened at startup is fatal
    let summary = reconciler
        .reconcile_from_config(&config.keys)
        .await
        .context("Initial reconciliation failed")?;
    info!(
        ports = summary.opened.len(),
        rejected_keys = summary.rejected_keys,
        "Ports opened"
    );

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(4);

    let ipc_handler = Arc::new(IpcHandler::new(
        Arc::clone(&reconciler),
        Arc::clone(&stats),
        Some(args.config_path.clone()),
        shutdown_tx.clone(),
    ));
    let ipc_server = IpcServer::new(config.ipc.clone(), Arc::clone(&ipc_handler));
    let ipc_shutdown = shutdown_tx.subscribe();
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server.run(ipc_shutdown).await {
            error!("IPC server error: {}", e);
        }
    });

    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                match ipc_handler.reload(None).await {
                    Ok(summary) => info!(
                        opened = summary.opened.len(),
                        closed = summary.closed.len(),
                        updated = summary.updated.len(),
                        rejected_keys = summary.rejected_keys,
                        "Configuration reloaded"
                    ),
                    // Unaffected ports keep serving
                    Err(e) => error!(error = %e, "Reload failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, initiating shutdown...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
                break;
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown requested via IPC");
                break;
            }
        }
    }

    info!("Shutting down...");

    let _ = shutdown_tx.send(());
    reconciler.shutdown().await;

    if tokio::time::timeout(IPC_STOP_TIMEOUT, ipc_handle).await.is_err() {
        warn!("IPC server did not stop in time");
    }

    let stats = stats.snapshot();
    info!(
        "Final stats: {} TCP connections ({} completed, {} errored), {} UDP packets in, {} out",
        stats.tcp_accepted,
        stats.tcp_completed,
        stats.tcp_errored,
        stats.udp_packets_from_client,
        stats.udp_packets_from_target
    );
    info!(
        "Transferred: {} bytes from clients, {} bytes to clients",
        stats.bytes_from_client, stats.bytes_to_client
    );

    info!("Shutdown complete");
    Ok(())
}
