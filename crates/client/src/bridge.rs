//! Bridge consumer connection
//!
//! [`BridgeClient`] issues the session commands over the bridge socket.
//! Successful opens return the duplicated descriptor received as
//! `SCM_RIGHTS` ancillary data; the caller owns it from then on.
//!
//! Hotplug events use a dedicated connection: [`BridgeClient::subscribe_hotplug`]
//! consumes the client and turns it into a [`HotplugFeed`].

use common::{Error, ReceivedMessage, Result, recv_message, send_message};
use protocol::{
    DeviceDescriptor, DeviceIdentity, HotplugEvent, Message, MessagePayload, StreamEndReason,
};
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Default bound on one request/response exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Command connection to the bridge daemon
///
/// Requests are answered in order, one at a time. An exchange that does not
/// complete (timeout, I/O error, or the caller dropping the future) leaves
/// the stream at an unknown frame boundary; the client is then unusable and
/// every later request fails with `ConnectionClosed`.
pub struct BridgeClient {
    stream: UnixStream,
    request_timeout: Duration,
    exchange: Mutex<()>,
    desynced: AtomicBool,
}

impl BridgeClient {
    /// Connect to the bridge socket at `path`
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await?;
        debug!("Connected to bridge at {}", path.display());
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            exchange: Mutex::new(()),
            desynced: AtomicBool::new(false),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Snapshot of the devices the bridge exposes
    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        match self.request(MessagePayload::ListDevicesRequest).await?.message.payload {
            MessagePayload::ListDevicesResponse { result } => Ok(result?),
            other => Err(unexpected(&other)),
        }
    }

    /// Whether the bridge currently holds OS access to `identity`
    pub async fn has_permission(&self, identity: &DeviceIdentity) -> Result<bool> {
        let payload = MessagePayload::HasPermissionRequest {
            identity: identity.clone(),
        };
        match self.request(payload).await?.message.payload {
            MessagePayload::HasPermissionResponse { result } => Ok(result?),
            other => Err(unexpected(&other)),
        }
    }

    /// Open a device and take ownership of the duplicated descriptor
    pub async fn open_and_duplicate(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<(DeviceIdentity, OwnedFd)> {
        let payload = MessagePayload::OpenAndDuplicateRequest {
            identity: identity.clone(),
        };
        let (message, fd) = self.request(payload).await?.into_single_fd();

        match message.payload {
            MessagePayload::OpenAndDuplicateResponse { result } => {
                let opened = result?;
                let fd = fd.ok_or_else(|| {
                    Error::UnexpectedMessage("open succeeded but no descriptor arrived".to_string())
                })?;
                debug!(identity = %opened, "Received device descriptor");
                Ok((opened, fd))
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Become the bridge's hotplug subscriber
    ///
    /// Any other subscriber, on this or another connection, is replaced.
    pub async fn subscribe_hotplug(self) -> Result<HotplugFeed> {
        match self.request(MessagePayload::SubscribeHotplugRequest).await?.message.payload {
            MessagePayload::HotplugSubscribed => Ok(HotplugFeed {
                stream: self.stream,
                ended: None,
            }),
            other => Err(unexpected(&other)),
        }
    }

    async fn request(&self, payload: MessagePayload) -> Result<ReceivedMessage> {
        let _exclusive = self.exchange.lock().await;
        if self.desynced.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        trace!(kind = payload.kind(), "Request");
        // Cleared only once a whole response has been read
        self.desynced.store(true, Ordering::SeqCst);
        let exchange = async {
            send_message(&self.stream, &Message::new(payload)).await?;
            recv_message(&self.stream).await?.ok_or(Error::ConnectionClosed)
        };

        let received = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout = ?self.request_timeout, "Request timed out, abandoning connection");
                return Err(Error::Timeout(self.request_timeout));
            }
        };
        self.desynced.store(false, Ordering::SeqCst);

        if let MessagePayload::Error { message } = &received.message.payload {
            return Err(Error::Remote(message.clone()));
        }
        Ok(received)
    }
}

/// Hotplug event stream from the bridge
pub struct HotplugFeed {
    stream: UnixStream,
    ended: Option<StreamEndReason>,
}

impl HotplugFeed {
    /// Next event, or `None` once the bridge ended the stream
    pub async fn next_event(&mut self) -> Result<Option<HotplugEvent>> {
        if self.ended.is_some() {
            return Ok(None);
        }

        let received = recv_message(&self.stream).await?.ok_or(Error::ConnectionClosed)?;
        match received.message.payload {
            MessagePayload::HotplugNotification { event } => Ok(Some(event)),
            MessagePayload::HotplugStreamEnded { reason } => {
                debug!(%reason, "Hotplug stream ended");
                self.ended = Some(reason);
                Ok(None)
            }
            MessagePayload::Error { message } => Err(Error::Remote(message)),
            other => {
                warn!(kind = other.kind(), "Unexpected message on hotplug feed");
                Err(unexpected(&other))
            }
        }
    }

    /// Why the stream ended, once it has
    pub fn end_reason(&self) -> Option<StreamEndReason> {
        self.ended
    }

    /// Ask the bridge to stop the stream
    ///
    /// Events already in flight are still returned by `next_event`, followed
    /// by the end of the stream.
    pub async fn cancel(&self) -> Result<()> {
        send_message(&self.stream, &Message::new(MessagePayload::CancelHotplugRequest)).await
    }
}

fn unexpected(payload: &MessagePayload) -> Error {
    Error::UnexpectedMessage(payload.kind().to_string())
}
