//! rust-l2tp: L2TPv2 tunnel server
//!
//! Main entry point for the standalone server.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./rust-l2tp
//!
//! # Run with custom configuration
//! ./rust-l2tp -c /path/to/config.json
//!
//! # Run with environment overrides
//! L2TP_LOG_LEVEL=debug ./rust-l2tp
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::signal;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

use rust_l2tp::config::{load_config_with_env, Config};
use rust_l2tp::ppp::{ChannelPacketSink, DefaultPppEngine};
use rust_l2tp::server::Server;

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
        let mut config_path = PathBuf::from("/etc/rust-l2tp/config.json");
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
                    println!("rust-l2tp v{}", rust_l2tp::VERSION);
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
        r#"rust-l2tp v{}

L2TPv2 (RFC 2661) tunnel server.

USAGE:
    rust-l2tp [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/rust-l2tp/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    L2TP_LISTEN_ADDR        Override listen address
    L2TP_HOSTNAME           Override the Host Name AVP
    L2TP_LOG_LEVEL          Override log level (trace, debug, info, warn, error)
    L2TP_IDLE_TIMEOUT_SECS  Override idle-tunnel timeout

EXAMPLE:
    rust-l2tp -c /etc/rust-l2tp/config.json
"#,
        rust_l2tp::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
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
        rust_l2tp::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("rust-l2tp v{}", rust_l2tp::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    // Stock collaborators: accept any PAP credentials and drain
    // inbound IP packets on a bounded channel. A deployment embedding
    // this crate supplies its own engine and sink instead.
    let (sink, mut packets) = ChannelPacketSink::new(256);
    let engine = Arc::new(DefaultPppEngine::accept_all());

    let server = Arc::new(Server::new(config.server.clone(), engine, Arc::new(sink)));
    server
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start server: {e}"))?;

    // The standalone binary has no network stack to hand packets to;
    // drain and trace them so the channel never fills.
    let drain = tokio::spawn(async move {
        while let Some(packet) = packets.recv().await {
            debug!(
                protocol = packet.protocol,
                len = packet.payload.len(),
                "Inbound IP packet"
            );
        }
    });

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Graceful shutdown
    info!("Shutting down...");
    server.stop();
    drain.abort();

    let stats = server.stats_snapshot();
    info!(
        "Final stats: {} datagrams, {} control, {} data, {} decode errors",
        stats.datagrams_received, stats.control_messages, stats.data_messages, stats.decode_errors
    );
    info!(
        "Lifetime totals: {} tunnels, {} sessions",
        stats.tunnels_created, stats.sessions_created
    );

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await;
}
