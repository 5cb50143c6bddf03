//! tun-relay: relay TUN traffic through a SOCKS5 proxy
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./tun-relay
//!
//! # Run with custom configuration
//! sudo ./tun-relay -c /path/to/config.json
//!
//! # Run with environment overrides
//! TUN_RELAY_LOG_LEVEL=debug sudo ./tun-relay
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tun_relay::config::{load_config_with_env, Config, LogFormat, TunConfig};
use tun_relay::engine::EngineBuilder;
use tun_relay::stack::NetstackBackend;

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
        let mut config_path = PathBuf::from("/etc/tun-relay/config.json");
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
                    println!("tun-relay v{}", tun_relay::VERSION);
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
        r#"tun-relay v{}

Relays TCP and UDP flows captured on a TUN device through a SOCKS5 proxy.

USAGE:
    tun-relay [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tun-relay/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    TUN_RELAY_SOCKS5_ADDR       Override SOCKS5 server address
    TUN_RELAY_UDP_RELAY_ADDR    Override UDP envelope relay address
    TUN_RELAY_LOG_LEVEL         Override log filter (trace, debug, info, warn, error)
    TUN_RELAY_IO_TIMEOUT_SECS   Override relay I/O timeout

REQUIREMENTS:
    - CAP_NET_ADMIN capability (or root) to create the TUN device
    - Routes sending the traffic to relay into the TUN device
"#,
        tun_relay::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

/// Create and bring up the TUN device described by `tun`
fn open_tun(tun: &TunConfig) -> Result<tun::AsyncDevice> {
    let mut config = tun::Configuration::default();
    config.tun_name(&tun.name);
    config.address(tun.address.addr());
    config.netmask(tun.address.netmask());
    config.mtu(tun.mtu);
    config.up();

    tun::create_as_async(&config).with_context(|| format!("Failed to create TUN device {}", tun.name))
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        tun_relay::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).with_context(|| {
        format!("Failed to load configuration from {:?}", args.config_path)
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("tun-relay v{}", tun_relay::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let device = open_tun(&config.tun)?;
    let mtu = config.tun.mtu;
    info!(
        "TUN device {} up at {} (mtu {})",
        config.tun.name, config.tun.address, mtu
    );
    info!(
        "Relaying through SOCKS5 {} (UDP relay {})",
        config.proxy.socks5_addr, config.proxy.udp_relay_addr
    );

    let engine = EngineBuilder::new(config)
        .build()
        .context("Failed to build relay engine")?;
    engine.start();

    let backend = NetstackBackend::new();
    engine.attach(backend.as_ref())?;

    let shutdown = CancellationToken::new();
    let stack = tokio::spawn(Arc::clone(&backend).run(device, mtu, shutdown.clone()));

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    info!("Shutting down...");
    shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(5), stack).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Stack backend error: {}", e),
        Ok(Err(e)) => error!("Stack backend task failed: {}", e),
        Err(_) => error!("Stack backend did not stop within 5s"),
    }

    let closed = engine.shutdown().await;
    let stats = engine.stats();
    info!(
        "Final TCP stats: {} opened, {} dial failures, {} bytes up, {} bytes down",
        stats.relay.tcp_opened,
        stats.relay.tcp_dial_failures,
        stats.relay.tcp_bytes_up,
        stats.relay.tcp_bytes_down
    );
    info!(
        "Final UDP stats: {} flows opened, {} expired, {} dropped, {} DNS cache hits",
        stats.relay.udp_flows_opened,
        stats.udp_flows_expired,
        stats.relay.udp_dropped,
        stats.relay.dns_cache_hits
    );

    info!("Shutdown complete, {} flows closed", closed);
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
