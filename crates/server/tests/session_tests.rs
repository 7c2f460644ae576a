//! Integration tests for the device session manager
//!
//! Drive the full core (directory, permission gate, handoff, hotplug relay)
//! against the scripted USB host.

use common::test_utils::{DEFAULT_TEST_TIMEOUT, TEST_PID, TEST_VID, with_timeout};
use protocol::{DeviceIdentity, HotplugKind, SessionError, StreamEndReason};
use server::test_utils::{MockUsbHost, raw_device};
use server::usb::CloexecDup;
use server::{SessionManager, SessionOptions};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

fn start(host: &Arc<MockUsbHost>) -> SessionManager {
    SessionManager::start(host.clone(), SessionOptions::new(Arc::new(CloexecDup)))
}

/// Poll until `condition` holds or the test timeout passes
async fn wait_until(mut condition: impl FnMut() -> bool) {
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_permission_grant_scenario() {
    let host = Arc::new(MockUsbHost::new());
    host.attach(raw_device(1, 5, Some("1-1")));
    let manager = start(&host);
    let id = DeviceIdentity::new("1-1");

    let devices = manager.list_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].identity, id);
    assert_eq!(devices[0].vendor_id, TEST_VID);
    assert_eq!(devices[0].product_id, TEST_PID);

    assert!(!manager.has_permission(&id).await.unwrap());
    assert!(matches!(
        manager.open_and_duplicate(&id).await,
        Err(SessionError::PermissionDenied { .. })
    ));
    assert_eq!(host.open_calls(), 0);

    // External permission flow completes
    host.grant("1-1");

    assert!(manager.has_permission(&id).await.unwrap());
    let handle = manager.open_and_duplicate(&id).await.unwrap();
    assert!(handle.raw_fd() >= 0);
    assert_eq!(handle.identity(), &id);
    assert_eq!(host.open_connections(), 0);

    manager.close().await;
}

#[tokio::test]
async fn test_identity_stable_across_replug() {
    let host = Arc::new(MockUsbHost::new());
    host.attach(raw_device(3, 4, Some("3-2.1")));
    let manager = start(&host);

    let first = manager.list_devices().await.unwrap();
    assert_eq!(first[0].identity.as_str(), "3-2.1");

    host.unplug("3-2.1");
    assert!(manager.list_devices().await.unwrap().is_empty());

    // The kernel hands out a new address on re-attach
    host.plug(raw_device(3, 11, Some("3-2.1")));
    let second = manager.list_devices().await.unwrap();
    assert_eq!(second[0].identity, first[0].identity);

    manager.close().await;
}

#[tokio::test]
async fn test_identity_falls_back_without_port_path() {
    let host = Arc::new(MockUsbHost::new());
    host.attach(raw_device(2, 7, None));
    let manager = start(&host);

    let devices = manager.list_devices().await.unwrap();
    assert_eq!(devices[0].identity.as_str(), "usb-dev-2007");
    assert!(!manager
        .has_permission(&DeviceIdentity::new("usb-dev-2007"))
        .await
        .unwrap());

    manager.close().await;
}

#[tokio::test]
async fn test_detached_event_matches_listed_identity() {
    let host = Arc::new(MockUsbHost::new());
    host.attach(raw_device(1, 5, Some("1-4")));
    let manager = start(&host);
    let mut events = manager.subscribe();

    let listed = manager.list_devices().await.unwrap();
    host.unplug("1-4");

    let event = with_timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, HotplugKind::Detached);
    assert_eq!(event.device, listed[0]);

    manager.close().await;
}

#[tokio::test]
async fn test_missing_device() {
    let host = Arc::new(MockUsbHost::new());
    let manager = start(&host);
    let id = DeviceIdentity::new("9-9");

    assert!(matches!(
        manager.has_permission(&id).await,
        Err(SessionError::DeviceNotFound { .. })
    ));
    assert!(matches!(
        manager.open_and_duplicate(&id).await,
        Err(SessionError::DeviceNotFound { .. })
    ));

    manager.close().await;
}

#[tokio::test]
async fn test_enumeration_failure_is_retryable() {
    let host = Arc::new(MockUsbHost::new());
    host.attach(raw_device(1, 5, Some("1-1")));
    let manager = start(&host);

    host.fail_enumeration(true);
    let err = manager.list_devices().await.unwrap_err();
    assert!(matches!(err, SessionError::EnumerationError { .. }));
    assert!(err.is_retryable());

    host.fail_enumeration(false);
    assert_eq!(manager.list_devices().await.unwrap().len(), 1);

    manager.close().await;
}

#[tokio::test]
async fn test_busy_device() {
    let host = Arc::new(MockUsbHost::new());
    host.attach(raw_device(1, 5, Some("1-1")));
    host.grant("1-1");
    host.set_busy("1-1", true);
    let manager = start(&host);

    match manager.open_and_duplicate(&DeviceIdentity::new("1-1")).await {
        Err(err @ SessionError::OpenFailed { busy: true, .. }) => assert!(err.is_retryable()),
        other => panic!("expected busy OpenFailed, got {:?}", other.map(|h| h.raw_fd())),
    }
    assert_eq!(host.open_connections(), 0);

    manager.close().await;
}

#[tokio::test]
async fn test_single_open_in_flight() {
    let host = Arc::new(MockUsbHost::new());
    host.attach(raw_device(1, 5, Some("1-1")));
    host.attach(raw_device(1, 6, Some("1-2")));
    host.grant("1-1");
    host.grant("1-2");
    let manager = Arc::new(start(&host));
    let id = DeviceIdentity::new("1-1");

    host.hold_opens();
    let first = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.open_and_duplicate(&id).await })
    };
    wait_until(|| manager.is_opening(&id)).await;

    let second = manager.open_and_duplicate(&id).await;
    assert!(matches!(second, Err(SessionError::AlreadyOpening { .. })));
    assert!(!second.unwrap_err().is_retryable());

    // Other identities are not serialized behind it
    assert!(!manager.is_opening(&DeviceIdentity::new("1-2")));

    host.release_opens();
    let handle = first.await.unwrap().unwrap();
    assert!(handle.raw_fd() >= 0);
    assert_eq!(host.open_calls(), 1);
    assert!(!manager.is_opening(&id));

    // A later open is allowed again
    drop(handle);
    assert!(manager.open_and_duplicate(&id).await.is_ok());

    manager.close().await;
}

#[tokio::test]
async fn test_open_timeout() {
    let host = Arc::new(MockUsbHost::new());
    host.attach(raw_device(1, 5, Some("1-1")));
    host.grant("1-1");
    let mut options = SessionOptions::new(Arc::new(CloexecDup));
    options.open_timeout = Duration::from_millis(50);
    let manager = SessionManager::start(host.clone(), options);
    let id = DeviceIdentity::new("1-1");

    host.hold_opens();
    match manager.open_and_duplicate(&id).await {
        Err(SessionError::OpenFailed { reason, busy, .. }) => {
            assert!(reason.contains("timed out"));
            assert!(!busy);
        }
        other => panic!("expected timeout, got {:?}", other.map(|h| h.raw_fd())),
    }

    // The stuck call still owns the identity
    assert!(matches!(
        manager.open_and_duplicate(&id).await,
        Err(SessionError::AlreadyOpening { .. })
    ));

    host.release_opens();
    wait_until(|| !manager.is_opening(&id)).await;
    assert_eq!(host.open_connections(), 0);

    manager.close().await;
}

#[tokio::test]
async fn test_event_order_follows_os_layer() {
    let host = Arc::new(MockUsbHost::new());
    let manager = start(&host);
    let mut events = manager.subscribe();

    let a = raw_device(1, 5, Some("1-1"));
    let b = raw_device(1, 6, Some("1-2"));

    // Reported out of physical order; the relay must keep the OS order
    host.inject("remove", a.clone());
    host.inject("add", b);
    host.inject("add", a.clone());
    host.inject("change", a);

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = with_timeout(DEFAULT_TEST_TIMEOUT, events.recv())
            .await
            .unwrap()
            .unwrap();
        received.push((event.kind, event.device.identity.to_string()));
    }

    assert_eq!(
        received,
        vec![
            (HotplugKind::Detached, "1-1".to_string()),
            (HotplugKind::Attached, "1-2".to_string()),
            (HotplugKind::Attached, "1-1".to_string()),
        ]
    );

    manager.close().await;
}

#[tokio::test]
async fn test_resubscribe_replaces_previous() {
    let host = Arc::new(MockUsbHost::new());
    let manager = start(&host);

    let mut first = manager.subscribe();
    let mut second = manager.subscribe();

    assert!(with_timeout(DEFAULT_TEST_TIMEOUT, first.recv()).await.unwrap().is_none());
    assert_eq!(first.end_reason(), Some(StreamEndReason::Replaced));

    host.plug(raw_device(1, 5, Some("1-1")));
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, second.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, HotplugKind::Attached);

    // Subscriber churn never re-registers with the OS
    assert!(host.is_watching());

    manager.close().await;
}

#[tokio::test]
async fn test_registration_loss_ends_stream() {
    let host = Arc::new(MockUsbHost::new());
    let manager = start(&host);
    let mut events = manager.subscribe();

    host.lose_registration();
    assert!(with_timeout(DEFAULT_TEST_TIMEOUT, events.recv()).await.unwrap().is_none());
    assert_eq!(events.end_reason(), Some(StreamEndReason::RegistrationLost));

    manager.close().await;
}

#[tokio::test]
async fn test_close_keeps_issued_handles() {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let host = Arc::new(MockUsbHost::new());
    host.attach(raw_device(1, 5, Some("1-1")));
    host.grant("1-1");
    let manager = start(&host);
    let mut events = manager.subscribe();

    let handle = manager
        .open_and_duplicate(&DeviceIdentity::new("1-1"))
        .await
        .unwrap();
    let mut peer = host.take_peer("1-1").unwrap();

    manager.close().await;
    assert!(events.recv().await.is_none());
    assert_eq!(events.end_reason(), Some(StreamEndReason::Shutdown));
    assert!(!host.is_watching());

    let (_, fd) = handle.into_parts();
    assert!(fd.as_raw_fd() >= 0);
    let mut device = UnixStream::from(fd);
    device.write_all(b"AT\r").unwrap();
    let mut buf = [0u8; 3];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"AT\r");
}

#[tokio::test]
async fn test_detach_does_not_revoke_handle() {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let host = Arc::new(MockUsbHost::new());
    host.attach(raw_device(1, 5, Some("1-1")));
    host.grant("1-1");
    let manager = start(&host);
    let mut events = manager.subscribe();

    let handle = manager
        .open_and_duplicate(&DeviceIdentity::new("1-1"))
        .await
        .unwrap();
    let mut peer = host.take_peer("1-1").unwrap();

    host.unplug("1-1");
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, HotplugKind::Detached);

    let mut device = UnixStream::from(handle.into_parts().1);
    peer.write_all(b"ok").unwrap();
    let mut buf = [0u8; 2];
    device.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ok");

    manager.close().await;
}
