//! Protocol Integration Tests
//!
//! Covers the behaviour the bridge daemon and client depend on:
//! - Session results (success and every failure kind) survive the codec
//! - Several frames read back-to-back from one stream
//! - Version negotiation and frame limits
//!
//! Run with: `cargo test -p protocol`

use protocol::{
    CURRENT_VERSION, DeviceDescriptor, DeviceIdentity, HotplugEvent, HotplugKind,
    MAX_FRAME_SIZE, Message, MessagePayload, ProtocolError, ProtocolVersion, SessionError,
    StreamEndReason, decode_framed, encode_framed, read_framed, validate_version, write_framed,
};
use std::io::Cursor;

// ============================================================================
// Test Utilities
// ============================================================================

fn descriptor(id: &str, vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        identity: DeviceIdentity::new(id),
        vendor_id,
        product_id,
    }
}

fn through_frame(payload: MessagePayload) -> MessagePayload {
    let framed = encode_framed(&Message::new(payload)).expect("Failed to encode framed message");
    decode_framed(&framed)
        .expect("Failed to decode framed message")
        .payload
}

// ============================================================================
// Session Results
// ============================================================================

#[test]
fn test_device_list_preserves_identity_and_ids() {
    let devices = vec![
        descriptor("1-1", 0x1209, 0x0001),
        descriptor("usb-dev-2007", 0x303a, 0x1001),
    ];

    match through_frame(MessagePayload::ListDevicesResponse {
        result: Ok(devices.clone()),
    }) {
        MessagePayload::ListDevicesResponse { result } => assert_eq!(result.unwrap(), devices),
        other => panic!("Wrong payload type: {:?}", other),
    }
}

#[test]
fn test_every_session_error_survives_the_wire() {
    let identity = DeviceIdentity::new("1-1");
    let errors = vec![
        SessionError::EnumerationError {
            message: "libusb: no memory".to_string(),
        },
        SessionError::DeviceNotFound {
            identity: identity.clone(),
        },
        SessionError::PermissionDenied {
            identity: identity.clone(),
        },
        SessionError::OpenFailed {
            identity: identity.clone(),
            reason: "Device or resource busy".to_string(),
            busy: true,
        },
        SessionError::AlreadyOpening {
            identity: identity.clone(),
        },
    ];

    for error in errors {
        match through_frame(MessagePayload::OpenAndDuplicateResponse {
            result: Err(error.clone()),
        }) {
            MessagePayload::OpenAndDuplicateResponse { result } => {
                assert_eq!(result.unwrap_err(), error)
            }
            other => panic!("Wrong payload type: {:?}", other),
        }
    }
}

#[test]
fn test_hotplug_notification_and_stream_end() {
    let event = HotplugEvent {
        kind: HotplugKind::Detached,
        device: descriptor("1-1.4", 0x1209, 0x0001),
    };

    match through_frame(MessagePayload::HotplugNotification {
        event: event.clone(),
    }) {
        MessagePayload::HotplugNotification { event: decoded } => assert_eq!(decoded, event),
        other => panic!("Wrong payload type: {:?}", other),
    }

    match through_frame(MessagePayload::HotplugStreamEnded {
        reason: StreamEndReason::RegistrationLost,
    }) {
        MessagePayload::HotplugStreamEnded { reason } => {
            assert_eq!(reason, StreamEndReason::RegistrationLost)
        }
        other => panic!("Wrong payload type: {:?}", other),
    }
}

// ============================================================================
// Stream Framing
// ============================================================================

#[test]
fn test_sequential_frames_from_one_stream() {
    let mut buffer = Vec::new();
    write_framed(&mut buffer, &Message::new(MessagePayload::SubscribeHotplugRequest)).unwrap();
    write_framed(
        &mut buffer,
        &Message::new(MessagePayload::HasPermissionRequest {
            identity: DeviceIdentity::new("1-1"),
        }),
    )
    .unwrap();
    write_framed(&mut buffer, &Message::new(MessagePayload::CancelHotplugRequest)).unwrap();

    let mut cursor = Cursor::new(buffer);
    assert!(matches!(
        read_framed(&mut cursor).unwrap().payload,
        MessagePayload::SubscribeHotplugRequest
    ));
    match read_framed(&mut cursor).unwrap().payload {
        MessagePayload::HasPermissionRequest { identity } => assert_eq!(identity.as_str(), "1-1"),
        other => panic!("Wrong payload type: {:?}", other),
    }
    assert!(matches!(
        read_framed(&mut cursor).unwrap().payload,
        MessagePayload::CancelHotplugRequest
    ));

    // Stream exhausted
    assert!(matches!(
        read_framed(&mut cursor),
        Err(ProtocolError::Io(_))
    ));
}

#[test]
fn test_oversized_frame_header_rejected_before_allocation() {
    let mut bytes = ((MAX_FRAME_SIZE as u32) + 1).to_be_bytes().to_vec();
    bytes.extend_from_slice(&[0u8; 8]);

    assert!(matches!(
        read_framed(&mut Cursor::new(bytes)),
        Err(ProtocolError::FrameTooLarge { .. })
    ));
}

// ============================================================================
// Version Negotiation
// ============================================================================

#[test]
fn test_major_version_mismatch_rejected() {
    let future = ProtocolVersion {
        major: CURRENT_VERSION.major + 1,
        minor: 0,
        patch: 0,
    };
    let msg = Message {
        version: future,
        payload: MessagePayload::ListDevicesRequest,
    };
    let decoded = decode_framed(&encode_framed(&msg).unwrap()).unwrap();

    let err = validate_version(&decoded.version).unwrap_err();
    assert!(err.to_string().contains("this bridge speaks 1.0"));
}
