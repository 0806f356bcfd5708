//! MQTT Bridge - forwards locally published messages to a remote broker
//!
//! Usage:
//!   mqtt-bridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path (default: config.json)
//!   -d, --log-dir <DIR>      Log directory (overrides logDirectory)
//!   -l, --log-level <LEVEL>  Log level (error, warn, info, debug, trace)
//!   -h, --help               Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use mqtt_bridge::bridge::{BridgeOrchestrator, SysinfoProbe};
use mqtt_bridge::broker::{Broker, BrokerConfig};
use mqtt_bridge::config::Config;
use mqtt_bridge::logging;
use mqtt_bridge::upstream::MqttUpstream;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// MQTT Bridge - local endpoint that forwards publishes upstream
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge")]
#[command(author = "MQTT Bridge Contributors")]
#[command(version)]
#[command(about = "MQTT bridge forwarding locally published messages to a remote broker")]
struct Args {
    /// Configuration file path (JSON format)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Directory for the rolling log files
    #[arg(short = 'd', long)]
    log_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file {:?}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // CLI overrides RUST_LOG, RUST_LOG overrides the config file
    let filter = logging::resolve_filter(args.log_level.map(LogLevel::as_str), &config.log_level)?;
    let log_dir = args.log_dir.unwrap_or_else(|| config.log_directory.clone());
    let _log_guard = logging::init(&log_dir, filter)?;

    info!("Loaded configuration from {:?}", args.config);
    info!("  Local endpoint: {}", config.local_addr());
    if let Some(tls_addr) = config.tls_addr() {
        info!("  TLS endpoint: {}", tls_addr);
    }
    info!(
        "  Upstream: {}:{} (tls={})",
        config.bridge_url.trim(),
        config.bridge_port,
        config.use_tls
    );
    info!("  Users: {} configured", config.users.len());
    info!("  Heartbeat interval: {:?}", config.heartbeat_interval());

    let upstream = Arc::new(MqttUpstream::new());
    let broker = Arc::new(Broker::new(BrokerConfig::from(&config)));
    let probe = Arc::new(SysinfoProbe::new()?);

    let bridge = BridgeOrchestrator::new(config, upstream, broker, probe);
    if let Err(e) = bridge.start().await {
        error!("Failed to start bridge: {}", e);
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    bridge.stop().await;

    Ok(())
}
