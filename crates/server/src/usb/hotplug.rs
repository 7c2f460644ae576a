//! Hotplug Event Stream
//!
//! A single-subscriber relay between the OS hotplug facility and the
//! consumer. The OS registration is made once when the relay starts and lives
//! as long as the relay; subscribing and cancelling only swap the delivery
//! target.
//!
//! # Architecture
//!
//! ```text
//! OS context (usb-hotplug thread)
//!   └─> raw async_channel ──┐
//!                           ├─> relay task (single delivery context)
//! subscribe / cancel ───────┘     ├─> classify action, apply filter
//!   (control channel)             ├─> identity via directory rule
//!                                 └─> current subscriber (at most one)
//! ```
//!
//! The relay task owns the subscriber slot, so events reach the subscriber in
//! the order the OS layer produced them and never concurrently.

use crate::usb::directory::describe;
use crate::usb::filter::DeviceFilter;
use crate::usb::host::{RawNotification, UsbHost, WatchGuard};
use protocol::{HotplugEvent, HotplugKind, StreamEndReason};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// What the relay pushes to a subscriber
#[derive(Debug)]
enum Feed {
    Event(HotplugEvent),
    End(StreamEndReason),
}

enum Control {
    Attach {
        id: u64,
        sink: mpsc::UnboundedSender<Feed>,
    },
    Cancel {
        id: u64,
    },
    Shutdown,
}

/// Receiving end of a hotplug subscription
///
/// `recv` yields events until the subscription ends; `end_reason` then says
/// why.
#[derive(Debug)]
pub struct HotplugSubscription {
    id: u64,
    feed: mpsc::UnboundedReceiver<Feed>,
    control: mpsc::UnboundedSender<Control>,
    ended: Option<StreamEndReason>,
}

impl HotplugSubscription {
    /// Next event, or `None` once the subscription has ended
    pub async fn recv(&mut self) -> Option<HotplugEvent> {
        if self.ended.is_some() {
            return None;
        }

        match self.feed.recv().await {
            Some(Feed::Event(event)) => Some(event),
            Some(Feed::End(reason)) => {
                self.ended = Some(reason);
                None
            }
            // Relay task is gone without saying goodbye
            None => {
                self.ended = Some(StreamEndReason::Shutdown);
                None
            }
        }
    }

    /// Why the subscription ended, once it has
    pub fn end_reason(&self) -> Option<StreamEndReason> {
        self.ended
    }

    /// Stop receiving events
    ///
    /// The next `recv` returns `None` with `Cancelled`, unless the
    /// subscription had already ended for another reason.
    pub fn cancel(&self) {
        let _ = self.control.send(Control::Cancel { id: self.id });
    }
}

/// Single-subscriber relay
pub struct HotplugRelay {
    control: mpsc::UnboundedSender<Control>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    watch: Mutex<Option<WatchGuard>>,
}

impl HotplugRelay {
    /// Register with the OS and start the relay task
    ///
    /// A failed registration is not fatal: the relay starts in the lost
    /// state and every subscription ends immediately with
    /// `RegistrationLost`.
    pub fn start(host: &dyn UsbHost, filter: DeviceFilter) -> Self {
        let (raw_tx, raw_rx) = async_channel::unbounded();
        let watch = match host.watch(raw_tx) {
            Ok(guard) => {
                info!("Registered for OS hotplug notifications");
                Some(guard)
            }
            Err(e) => {
                warn!("Hotplug registration failed: {}", e);
                None
            }
        };

        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_relay(control_rx, raw_rx, filter));

        Self {
            control,
            next_id: AtomicU64::new(1),
            task: Mutex::new(Some(task)),
            watch: Mutex::new(watch),
        }
    }

    /// Become the single subscriber, ending any previous subscription with
    /// `Replaced`
    pub fn subscribe(&self) -> HotplugSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sink, feed) = mpsc::unbounded_channel();
        let mut subscription = HotplugSubscription {
            id,
            feed,
            control: self.control.clone(),
            ended: None,
        };

        if self.control.send(Control::Attach { id, sink }).is_err() {
            subscription.ended = Some(StreamEndReason::Shutdown);
        }
        subscription
    }

    /// End the current subscription with `Shutdown`, stop the relay task and
    /// drop the OS registration
    pub async fn close(&self) {
        let _ = self.control.send(Control::Shutdown);

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("Hotplug relay task failed: {}", e);
        }

        let watch = self.watch.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(watch) = watch {
            // Unregistering joins the OS event thread
            let _ = tokio::task::spawn_blocking(move || drop(watch)).await;
        }
        debug!("Hotplug relay closed");
    }
}

/// Current delivery target
struct Subscriber {
    id: u64,
    sink: mpsc::UnboundedSender<Feed>,
}

impl Subscriber {
    fn end(self, reason: StreamEndReason) {
        debug!(subscriber = self.id, %reason, "Ending hotplug subscription");
        let _ = self.sink.send(Feed::End(reason));
    }
}

async fn run_relay(
    mut control: mpsc::UnboundedReceiver<Control>,
    raw: async_channel::Receiver<RawNotification>,
    filter: DeviceFilter,
) {
    let mut current: Option<Subscriber> = None;
    let mut lost = false;

    loop {
        tokio::select! {
            biased;

            command = control.recv() => match command {
                Some(Control::Attach { id, sink }) => {
                    let subscriber = Subscriber { id, sink };
                    if lost {
                        subscriber.end(StreamEndReason::RegistrationLost);
                        continue;
                    }
                    if let Some(previous) = current.replace(subscriber) {
                        previous.end(StreamEndReason::Replaced);
                    }
                    debug!(subscriber = id, "Hotplug subscriber attached");
                }
                Some(Control::Cancel { id }) => match current.take() {
                    Some(subscriber) if subscriber.id == id => {
                        subscriber.end(StreamEndReason::Cancelled)
                    }
                    other => current = other,
                },
                Some(Control::Shutdown) | None => {
                    if let Some(subscriber) = current.take() {
                        subscriber.end(StreamEndReason::Shutdown);
                    }
                    break;
                }
            },

            notification = raw.recv(), if !lost => match notification {
                Ok(notification) => deliver(&mut current, &filter, notification),
                Err(_) => {
                    warn!("OS hotplug registration lost");
                    lost = true;
                    if let Some(subscriber) = current.take() {
                        subscriber.end(StreamEndReason::RegistrationLost);
                    }
                }
            },
        }
    }

    debug!("Hotplug relay task stopped");
}

fn deliver(current: &mut Option<Subscriber>, filter: &DeviceFilter, notification: RawNotification) {
    let RawNotification { action, device } = notification;

    let Some(kind) = HotplugKind::from_action(&action) else {
        trace!(action = %action, %device, "Ignoring non-hotplug action");
        return;
    };
    let allowed = match kind {
        HotplugKind::Attached => filter.allows(&device),
        HotplugKind::Detached => filter.allows_departed(&device),
    };
    if !allowed {
        return;
    }

    let event = HotplugEvent {
        kind,
        device: describe(&device),
    };
    debug!(kind = ?event.kind, device = %event.device, "Hotplug event");

    let Some(subscriber) = current else {
        trace!("No hotplug subscriber, dropping event");
        return;
    };
    if subscriber.sink.send(Feed::Event(event)).is_err() {
        debug!(subscriber = subscriber.id, "Hotplug subscriber went away");
        *current = None;
    }
}
