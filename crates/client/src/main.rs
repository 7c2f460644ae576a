//! usb-fd-client
//!
//! Command-line consumer of the USB descriptor bridge.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use client::BridgeClient;
use client::config::ClientConfig;
use common::setup_logging;
use protocol::{DeviceIdentity, HotplugEvent, HotplugKind};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use tokio::signal;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "usb-fd-client")]
#[command(author, version, about = "USB descriptor bridge consumer")]
#[command(long_about = "
Talks to a running usb-fd-bridge daemon over its Unix socket.

EXAMPLES:
    # List devices the bridge exposes
    usb-fd-client list

    # Check OS access for a device
    usb-fd-client permission 1-1.4

    # Open a device and keep its descriptor until Ctrl+C
    usb-fd-client open 1-1.4 --hold

    # Follow attach/detach events
    usb-fd-client watch

CONFIGURATION:
    The client looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-fd-bridge/client.toml
    3. /etc/usb-fd-bridge/client.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Override the bridge socket path
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices
    List,
    /// Report whether the bridge may open a device
    Permission {
        /// Device identity as printed by `list`
        identity: String,
    },
    /// Open a device and receive its descriptor
    Open {
        /// Device identity as printed by `list`
        identity: String,
        /// Keep the descriptor open until Ctrl+C
        #[arg(long)]
        hold: bool,
    },
    /// Stream hotplug events until Ctrl+C or the bridge ends the stream
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ClientConfig::default();
        let path = ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ClientConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.client.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    let Some(command) = args.command else {
        bail!("No command given, see --help");
    };

    let socket_path = args.socket.unwrap_or_else(|| config.client.socket_path());
    let bridge = BridgeClient::connect(&socket_path)
        .await
        .with_context(|| format!("Failed to connect to {}", socket_path.display()))?
        .with_request_timeout(config.client.request_timeout());

    match command {
        Command::List => list(&bridge).await,
        Command::Permission { identity } => {
            let identity = DeviceIdentity::new(identity);
            let granted = bridge.has_permission(&identity).await?;
            println!("{}: {}", identity, if granted { "granted" } else { "denied" });
            Ok(())
        }
        Command::Open { identity, hold } => open(&bridge, DeviceIdentity::new(identity), hold).await,
        Command::Watch => watch(bridge).await,
    }
}

async fn list(bridge: &BridgeClient) -> Result<()> {
    let devices = bridge.list_devices().await?;
    if devices.is_empty() {
        println!("No devices");
        return Ok(());
    }

    for device in devices {
        let access = match bridge.has_permission(&device.identity).await {
            Ok(true) => "granted",
            Ok(false) => "denied",
            Err(e) => {
                debug!(identity = %device.identity, "Permission query failed: {}", e);
                "unknown"
            }
        };
        println!("{}  [{}]", device, access);
    }
    Ok(())
}

async fn open(bridge: &BridgeClient, identity: DeviceIdentity, hold: bool) -> Result<()> {
    let (opened, fd) = bridge.open_and_duplicate(&identity).await?;
    let raw = fd.as_raw_fd();
    let target = std::fs::read_link(format!("/proc/self/fd/{}", raw))
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "?".to_string());
    println!("{}: fd {} -> {}", opened, raw, target);

    if hold {
        info!("Holding descriptor, press Ctrl+C to release");
        signal::ctrl_c().await?;
    }
    drop(fd);
    Ok(())
}

async fn watch(bridge: BridgeClient) -> Result<()> {
    let mut feed = bridge.subscribe_hotplug().await?;
    println!("Watching for hotplug events, press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = feed.next_event() => {
                match event? {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }
            _ = signal::ctrl_c() => {
                // A frame may have been cut mid-read, so stop reading here
                feed.cancel().await?;
                println!("Cancelled");
                return Ok(());
            }
        }
    }

    if let Some(reason) = feed.end_reason() {
        println!("Stream ended: {}", reason);
    }
    Ok(())
}

fn print_event(event: &HotplugEvent) {
    let marker = match event.kind {
        HotplugKind::Attached => "+",
        HotplugKind::Detached => "-",
    };
    println!("{} {}", marker, event.device);
}
