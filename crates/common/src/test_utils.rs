//! Test utilities for usb-fd-bridge
//!
//! Fixture builders and helpers shared by the test suites of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_descriptor;
//!
//! let device = create_mock_descriptor("1-1", 0x1209, 0x0001);
//! assert_eq!(device.identity.as_str(), "1-1");
//! ```

use protocol::{DeviceDescriptor, DeviceIdentity, HotplugEvent, HotplugKind};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor/product of the reference CDC-ACM test device (pid.codes test VID)
pub const TEST_VID: u16 = 0x1209;
pub const TEST_PID: u16 = 0x0001;

/// Create a device descriptor
pub fn create_mock_descriptor(identity: &str, vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        identity: DeviceIdentity::new(identity),
        vendor_id,
        product_id,
    }
}

/// Create an Attached event for the reference test device
pub fn attached(identity: &str) -> HotplugEvent {
    HotplugEvent {
        kind: HotplugKind::Attached,
        device: create_mock_descriptor(identity, TEST_VID, TEST_PID),
    }
}

/// Create a Detached event for the reference test device
pub fn detached(identity: &str) -> HotplugEvent {
    HotplugEvent {
        kind: HotplugKind::Detached,
        device: create_mock_descriptor(identity, TEST_VID, TEST_PID),
    }
}

/// Run a future with a timeout
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let value = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(value, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Generate a unique-enough test ID based on current time
pub fn generate_test_id() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A socket path in the temp directory that no other test uses
pub fn unique_socket_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "{}-{}-{}.sock",
        prefix,
        std::process::id(),
        generate_test_id()
    ))
}
