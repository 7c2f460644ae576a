//! Bridge Socket Server
//!
//! Binds the consumer-facing Unix socket, accepts connections and spawns a
//! [`ConsumerConnection`] for each.

use anyhow::{Context, Result, anyhow};
use std::fs;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use super::connection::ConsumerConnection;
use crate::session::SessionManager;

/// Socket file mode: owner and group only
const SOCKET_MODE: u32 = 0o660;

pub struct BridgeServer {
    listener: UnixListener,
    socket_path: PathBuf,
    manager: Arc<SessionManager>,
}

impl BridgeServer {
    /// Bind the consumer socket
    ///
    /// A stale socket file left by a previous run is replaced; a socket with
    /// a live listener behind it is an error.
    pub fn bind(socket_path: &Path, manager: Arc<SessionManager>) -> Result<Self> {
        if socket_path.exists() {
            if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
                return Err(anyhow!(
                    "Another bridge is already listening on {}",
                    socket_path.display()
                ));
            }
            warn!("Removing stale socket {}", socket_path.display());
            fs::remove_file(socket_path).with_context(|| {
                format!("Failed to remove stale socket: {}", socket_path.display())
            })?;
        }

        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory: {}", parent.display())
            })?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(SOCKET_MODE))
            .with_context(|| format!("Failed to set permissions on {}", socket_path.display()))?;

        info!("Listening on {}", socket_path.display());
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            manager,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` resolves, then remove the socket
    /// file
    ///
    /// Connection tasks already running are left to finish on their own.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let mut next_id: u64 = 1;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }

                accepted = self.listener.accept() => {
                    let (stream, _addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };

                    let id = next_id;
                    next_id += 1;
                    match stream.peer_cred() {
                        Ok(cred) => info!(conn = id, uid = cred.uid(), pid = ?cred.pid(), "Consumer connected"),
                        Err(_) => info!(conn = id, "Consumer connected"),
                    }

                    let connection = ConsumerConnection::new(id, stream, self.manager.clone());
                    tokio::spawn(async move {
                        if let Err(e) = connection.run().await {
                            error!(conn = id, "Connection error: {:#}", e);
                        }
                    });
                }
            }
        }

        if let Err(e) = fs::remove_file(&self.socket_path) {
            debug!("Could not remove {}: {}", self.socket_path.display(), e);
        }
        Ok(())
    }
}
