//! Consumer Connection Handler
//!
//! Serves one consumer socket: answers session commands, forwards hotplug
//! events while this connection holds the subscription, and attaches the
//! duplicated descriptor to successful open responses.

use anyhow::{Context, Result};
use common::{ReceivedMessage, recv_message, send_message, send_message_with_fd};
use protocol::{
    DeviceIdentity, HotplugEvent, Message, MessagePayload, StreamEndReason, validate_version,
};
use std::os::fd::AsFd;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::session::SessionManager;
use crate::usb::HotplugSubscription;

/// Requests buffered between the reader task and the handler loop
const REQUEST_QUEUE_DEPTH: usize = 16;

/// Per-consumer connection handler
///
/// Frames are read by a separate task so that waiting for a request never
/// races with forwarding a hotplug event; all writes happen on the handler
/// loop, one whole frame at a time.
pub struct ConsumerConnection {
    /// Connection number for logging
    id: u64,
    stream: Arc<UnixStream>,
    manager: Arc<SessionManager>,
    /// Hotplug subscription held by this connection, if any
    subscription: Option<HotplugSubscription>,
}

impl ConsumerConnection {
    pub fn new(id: u64, stream: UnixStream, manager: Arc<SessionManager>) -> Self {
        Self {
            id,
            stream: Arc::new(stream),
            manager,
            subscription: None,
        }
    }

    /// Serve the connection until the consumer disconnects
    pub async fn run(mut self) -> Result<()> {
        debug!(conn = self.id, "Connection handler started");

        let (request_tx, mut requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let reader_stream = self.stream.clone();
        let conn = self.id;
        let reader = tokio::spawn(async move {
            loop {
                match recv_message(&reader_stream).await {
                    Ok(Some(received)) => {
                        if request_tx.send(received).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(conn, "Consumer closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(conn, "Failed to read request: {}", e);
                        break;
                    }
                }
            }
        });

        let result = self.serve(&mut requests).await;

        // A departing consumer must not keep the subscriber slot
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        reader.abort();

        debug!(conn = self.id, "Connection handler stopped");
        result
    }

    async fn serve(&mut self, requests: &mut mpsc::Receiver<ReceivedMessage>) -> Result<()> {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await?,
                    None => return Ok(()),
                },

                event = next_event(&mut self.subscription) => match event {
                    Some(event) => self.forward_event(event).await?,
                    None => self.end_stream().await?,
                },
            }
        }
    }

    async fn handle_request(&mut self, request: ReceivedMessage) -> Result<()> {
        let (message, stray_fd) = request.into_single_fd();
        if stray_fd.is_some() {
            warn!(conn = self.id, "Closing descriptor sent with a request");
        }

        if let Err(e) = validate_version(&message.version) {
            warn!(conn = self.id, "Protocol version mismatch: {}", e);
            return self
                .reply(MessagePayload::Error {
                    message: e.to_string(),
                })
                .await;
        }

        trace!(conn = self.id, kind = message.payload.kind(), "Request");

        match message.payload {
            MessagePayload::ListDevicesRequest => {
                let result = self.manager.list_devices().await;
                self.reply(MessagePayload::ListDevicesResponse { result }).await
            }

            MessagePayload::HasPermissionRequest { identity } => {
                let result = self.manager.has_permission(&identity).await;
                self.reply(MessagePayload::HasPermissionResponse { result })
                    .await
            }

            MessagePayload::OpenAndDuplicateRequest { identity } => {
                self.handle_open(identity).await
            }

            MessagePayload::SubscribeHotplugRequest => {
                // Replacing our own subscription; the old one's end is not forwarded
                self.subscription = Some(self.manager.subscribe());
                info!(conn = self.id, "Consumer subscribed to hotplug events");
                self.reply(MessagePayload::HotplugSubscribed).await
            }

            MessagePayload::CancelHotplugRequest => match &self.subscription {
                // The relay acknowledges with a Cancelled stream end
                Some(subscription) => {
                    subscription.cancel();
                    Ok(())
                }
                None => {
                    self.reply(MessagePayload::HotplugStreamEnded {
                        reason: StreamEndReason::Cancelled,
                    })
                    .await
                }
            },

            other => {
                warn!(conn = self.id, kind = other.kind(), "Unexpected message from consumer");
                self.reply(MessagePayload::Error {
                    message: format!("unexpected message: {}", other.kind()),
                })
                .await
            }
        }
    }

    async fn handle_open(&mut self, identity: DeviceIdentity) -> Result<()> {
        let handle = match self.manager.open_and_duplicate(&identity).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!(conn = self.id, %identity, "Open failed: {}", e);
                return self
                    .reply(MessagePayload::OpenAndDuplicateResponse { result: Err(e) })
                    .await;
            }
        };

        let response = Message::new(MessagePayload::OpenAndDuplicateResponse {
            result: Ok(handle.identity().clone()),
        });
        let sent = send_message_with_fd(&self.stream, &response, handle.as_fd()).await;

        // The consumer holds its own reference now; ours goes either way
        let fd = handle.raw_fd();
        drop(handle);
        sent.context("Failed to hand descriptor to consumer")?;

        info!(conn = self.id, %identity, fd, "Descriptor handed to consumer");
        Ok(())
    }

    async fn forward_event(&mut self, event: HotplugEvent) -> Result<()> {
        trace!(conn = self.id, device = %event.device, kind = ?event.kind, "Forwarding hotplug event");
        self.reply(MessagePayload::HotplugNotification { event }).await
    }

    async fn end_stream(&mut self) -> Result<()> {
        let reason = self
            .subscription
            .take()
            .and_then(|s| s.end_reason())
            .unwrap_or(StreamEndReason::Shutdown);

        info!(conn = self.id, %reason, "Hotplug stream ended");
        self.reply(MessagePayload::HotplugStreamEnded { reason }).await
    }

    async fn reply(&self, payload: MessagePayload) -> Result<()> {
        send_message(&self.stream, &Message::new(payload))
            .await
            .context("Failed to send response")
    }
}

/// Next event from the subscription; pends forever without one
async fn next_event(subscription: &mut Option<HotplugSubscription>) -> Option<HotplugEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
