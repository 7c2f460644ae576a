//! systemd service integration
//!
//! Implements the sd-notify datagram protocol so the bridge can run as a
//! `Type=notify` unit: readiness, status lines, shutdown and watchdog
//! keepalives. Every call is a no-op when `NOTIFY_SOCKET` is unset.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Send one sd-notify state line to `socket_path`
fn notify_to(socket_path: &Path, state: &str) -> Result<()> {
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(state.as_bytes(), socket_path)
        .with_context(|| format!("Failed to send '{}' to systemd", state))?;
    Ok(())
}

/// Send a state line if running under systemd
///
/// Returns whether a notification was sent.
fn notify(state: &str) -> Result<bool> {
    match env::var_os("NOTIFY_SOCKET") {
        Some(socket_path) => {
            notify_to(Path::new(&socket_path), state)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Tell systemd the socket is bound and the session manager is running
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: service ready");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

/// Tell systemd shutdown has begun
pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// Free-form status shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

pub fn notify_watchdog() -> Result<()> {
    notify("WATCHDOG=1").map(|_| ())
}

/// Keepalive interval: half the watchdog timeout systemd configured
pub fn watchdog_interval() -> Option<Duration> {
    let usec: u64 = env::var("WATCHDOG_USEC").ok()?.parse().ok()?;
    Some(Duration::from_micros(usec / 2).max(Duration::from_secs(1)))
}

pub fn is_systemd() -> bool {
    env::var_os("NOTIFY_SOCKET").is_some()
}

/// Send watchdog keepalives in the background, if systemd asked for them
pub fn spawn_watchdog_task() -> Option<JoinHandle<()>> {
    let interval = watchdog_interval()?;
    info!("Systemd watchdog enabled, keepalive every {:?}", interval);

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = notify_watchdog() {
                error!("Failed to send watchdog keepalive: {:#}", e);
            }
        }
    }))
}
