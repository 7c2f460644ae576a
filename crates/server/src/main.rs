//! usb-fd-bridge
//!
//! Device session daemon: serves the USB descriptor bridge on a Unix socket
//! until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use server::config::ServerConfig;
use server::rpc::BridgeServer;
use server::service;
use server::usb::{DeviceDirectory, RusbHost, UsbHost, select_strategy};
use server::{SessionManager, SessionOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-fd-bridge")]
#[command(
    author,
    version,
    about = "USB descriptor bridge - hand USB serial devices to another process"
)]
#[command(long_about = "
Discovers USB serial (CDC-ACM) devices, checks OS access permission and
hands an exclusively-owned duplicate of a device's file descriptor to a
consumer process connected over a Unix socket. Attach/detach notifications
are streamed to the single subscribed consumer.

EXAMPLES:
    # Run with default config
    usb-fd-bridge

    # Run with custom config
    usb-fd-bridge --config /path/to/config.toml

    # List USB devices without starting the daemon
    usb-fd-bridge --list-devices

    # Run as systemd service
    usb-fd-bridge --service

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-fd-bridge/server.toml
    3. /etc/usb-fd-bridge/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run as systemd service (sd-notify readiness and watchdog)
    #[arg(long)]
    service: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Override the consumer socket path
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ServerConfig::default();
        let path = ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-fd-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let filter = config
        .usb
        .device_filter()
        .context("Invalid USB filter configuration")?;
    let host: Arc<dyn UsbHost> =
        Arc::new(RusbHost::new().context("Failed to initialize USB subsystem")?);

    if args.list_devices {
        return list_devices_mode(host, filter);
    }

    let options = SessionOptions {
        filter,
        dup_strategy: select_strategy(config.handoff.dup_strategy),
        open_timeout: config.handoff.open_timeout,
    };
    let socket_path = args
        .socket
        .clone()
        .unwrap_or_else(|| config.server.socket_path());
    let service_mode = args.service || config.server.service_mode;

    run_daemon(host, options, socket_path, service_mode).await
}

/// Print the device snapshot and exit
fn list_devices_mode(host: Arc<dyn UsbHost>, filter: server::usb::DeviceFilter) -> Result<()> {
    let directory = DeviceDirectory::new(host, filter);
    let devices = directory
        .list_devices()
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            println!(
                "  [{}] {:04x}:{:04x}",
                device.identity, device.vendor_id, device.product_id
            );
        }
    }
    Ok(())
}

async fn run_daemon(
    host: Arc<dyn UsbHost>,
    options: SessionOptions,
    socket_path: PathBuf,
    service_mode: bool,
) -> Result<()> {
    let manager = Arc::new(SessionManager::start(host, options));
    let server = BridgeServer::bind(&socket_path, manager.clone())
        .context("Failed to start consumer socket")?;

    let watchdog = if service_mode {
        info!("Running in service mode");
        service::spawn_watchdog_task()
    } else {
        None
    };

    service::notify_ready().context("Failed to notify systemd ready")?;
    service::notify_status(&format!("Serving on {}", socket_path.display()))
        .context("Failed to send status to systemd")?;
    info!("Press Ctrl+C to shutdown");

    let result = server.run(shutdown_signal()).await;

    if let Err(e) = service::notify_stopping() {
        warn!("Failed to notify systemd stopping: {:#}", e);
    }
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    manager.close().await;

    info!("Bridge shutdown complete");
    result
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let mut terminate = match unix_signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        },
        _ = async {
            match terminate.as_mut() {
                Some(stream) => { stream.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => info!("Received SIGTERM, shutting down gracefully..."),
    }
}
