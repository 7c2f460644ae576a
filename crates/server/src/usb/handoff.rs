//! Descriptor Handoff
//!
//! Opens a device and produces an independently-owned duplicate of its OS
//! handle. The original connection is always released before returning, on
//! success and on every failure path, and the duplicate survives that
//! release.
//!
//! How the duplicate is made is a [`DupStrategy`] chosen once at startup:
//! atomic `F_DUPFD_CLOEXEC` where the kernel supports it, otherwise `dup(2)`
//! followed by setting `FD_CLOEXEC`.

use crate::usb::directory::DeviceDirectory;
use crate::usb::host::{HostError, UsbHost};
use crate::usb::permission::PermissionGate;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use protocol::{DeviceIdentity, SessionError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Produces an independent duplicate of an OS handle
pub trait DupStrategy: Send + Sync + fmt::Debug {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Duplicate `fd`; the result is close-on-exec
    fn duplicate(&self, fd: BorrowedFd<'_>) -> io::Result<OwnedFd>;
}

/// Atomic `F_DUPFD_CLOEXEC` duplication
#[derive(Debug, Default)]
pub struct CloexecDup;

impl DupStrategy for CloexecDup {
    fn name(&self) -> &'static str {
        "cloexec"
    }

    fn duplicate(&self, fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
        fd.try_clone_to_owned()
    }
}

/// `dup(2)` then `FD_CLOEXEC`, for kernels without `F_DUPFD_CLOEXEC`
#[derive(Debug, Default)]
pub struct LegacyDup;

impl DupStrategy for LegacyDup {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn duplicate(&self, fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
        let raw = nix::unistd::dup(fd.as_raw_fd()).map_err(io::Error::from)?;
        // SAFETY: dup just returned this descriptor and nothing else owns it
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        fcntl(owned.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
        Ok(owned)
    }
}

/// Configured duplication strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DupStrategyKind {
    /// Probe the kernel once and pick the best available
    #[default]
    Auto,
    Cloexec,
    Legacy,
}

impl fmt::Display for DupStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DupStrategyKind::Auto => f.write_str("auto"),
            DupStrategyKind::Cloexec => f.write_str("cloexec"),
            DupStrategyKind::Legacy => f.write_str("legacy"),
        }
    }
}

/// Resolve the configured strategy to an implementation
pub fn select_strategy(kind: DupStrategyKind) -> Arc<dyn DupStrategy> {
    let strategy: Arc<dyn DupStrategy> = match kind {
        DupStrategyKind::Cloexec => Arc::new(CloexecDup),
        DupStrategyKind::Legacy => Arc::new(LegacyDup),
        DupStrategyKind::Auto => {
            if supports_dupfd_cloexec() {
                Arc::new(CloexecDup)
            } else {
                Arc::new(LegacyDup)
            }
        }
    };
    info!(configured = %kind, selected = strategy.name(), "Descriptor duplication strategy");
    strategy
}

/// Probe `F_DUPFD_CLOEXEC` on a throwaway descriptor
fn supports_dupfd_cloexec() -> bool {
    let probe = match File::open("/dev/null") {
        Ok(file) => file,
        Err(e) => {
            warn!("Cannot open /dev/null to probe F_DUPFD_CLOEXEC: {}", e);
            return false;
        }
    };

    match fcntl(probe.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(0)) {
        Ok(raw) => {
            // SAFETY: fcntl just returned this descriptor and nothing else owns it
            drop(unsafe { OwnedFd::from_raw_fd(raw) });
            true
        }
        Err(e) => {
            debug!("F_DUPFD_CLOEXEC unavailable: {}", e);
            false
        }
    }
}

/// A duplicated device handle owned exclusively by whoever holds it
///
/// Dropping it closes the descriptor.
#[derive(Debug)]
pub struct OwnedHandle {
    identity: DeviceIdentity,
    fd: OwnedFd,
}

impl OwnedHandle {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_parts(self) -> (DeviceIdentity, OwnedFd) {
        (self.identity, self.fd)
    }

    /// Give up ownership of the raw descriptor
    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl AsFd for OwnedHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Open-and-duplicate pipeline
pub struct DescriptorHandoff {
    host: Arc<dyn UsbHost>,
    directory: DeviceDirectory,
    gate: PermissionGate,
    strategy: Arc<dyn DupStrategy>,
}

impl DescriptorHandoff {
    pub fn new(
        host: Arc<dyn UsbHost>,
        directory: DeviceDirectory,
        gate: PermissionGate,
        strategy: Arc<dyn DupStrategy>,
    ) -> Self {
        Self {
            host,
            directory,
            gate,
            strategy,
        }
    }

    /// Open `identity` and return an independent duplicate of its handle
    ///
    /// Never prompts for permission: a device without access fails with
    /// `PermissionDenied` and the caller drives the grant flow. Blocks on the
    /// OS open.
    pub fn open_and_duplicate(&self, identity: &DeviceIdentity) -> Result<OwnedHandle, SessionError> {
        let device = self.directory.resolve(identity)?;

        if !self.gate.state_of(&device).is_granted() {
            debug!(%identity, "Open refused, no OS permission");
            return Err(SessionError::PermissionDenied {
                identity: identity.clone(),
            });
        }

        let connection = self.host.open(&device).map_err(|e| match e {
            HostError::Busy => SessionError::OpenFailed {
                identity: identity.clone(),
                reason: e.to_string(),
                busy: true,
            },
            other => SessionError::open_failed(identity, other.to_string()),
        })?;

        let raw = connection.raw_fd();
        if raw < 0 {
            drop(connection);
            warn!(%identity, raw, "OS returned an invalid handle");
            return Err(SessionError::open_failed(
                identity,
                format!("invalid raw handle {}", raw),
            ));
        }

        // SAFETY: `connection` owns `raw` and is only dropped after the
        // duplicate has been made
        let original = unsafe { BorrowedFd::borrow_raw(raw) };
        let duplicate = self.strategy.duplicate(original);
        drop(connection);

        let fd = duplicate.map_err(|e| {
            warn!(%identity, strategy = self.strategy.name(), "Handle duplication failed: {}", e);
            SessionError::open_failed(identity, format!("failed to duplicate handle: {}", e))
        })?;

        info!(%identity, original = raw, duplicate = fd.as_raw_fd(), "Device handle duplicated");
        Ok(OwnedHandle {
            identity: identity.clone(),
            fd,
        })
    }
}
