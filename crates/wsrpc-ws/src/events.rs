//! Event bus: typed publish/subscribe for transport lifecycle and pushes.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use wsrpc_core::error::TransportError;
use wsrpc_core::request::RpcMessage;

use crate::socket::CloseInfo;

/// Where an event is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// The socket opened.
    Open,
    /// The socket closed (every close, including ones followed by a reconnect).
    Close,
    /// Transport or framing error.
    Error,
    /// Unsolicited server messages.
    Data,
    /// Push notifications for one server-issued subscription id.
    Subscription(String),
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
            Self::Error => write!(f, "error"),
            Self::Data => write!(f, "data"),
            Self::Subscription(id) => write!(f, "subscription:{id}"),
        }
    }
}

/// Payload delivered to subscribers.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Close(CloseInfo),
    Error(Arc<TransportError>),
    Data(RpcMessage),
}

/// Identifies one subscriber for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Receiving side of a bus subscription. Ends when unsubscribed or when the
/// bus is cleared.
#[derive(Debug)]
pub struct EventStream {
    handle: SubscriptionHandle,
    channel: Channel,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventStream {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Wait for the next event; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = TransportEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

type Subscriber = (SubscriptionHandle, mpsc::UnboundedSender<TransportEvent>);

#[derive(Default)]
struct BusInner {
    subscribers: HashMap<Channel, Vec<Subscriber>>,
    next_handle: u64,
}

impl BusInner {
    fn add(
        &mut self,
        channel: Channel,
        tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle);
        self.next_handle += 1;
        self.subscribers.entry(channel).or_default().push((handle, tx));
        handle
    }

    fn remove(&mut self, handle: SubscriptionHandle) -> bool {
        let mut found = false;
        self.subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(h, _)| *h != handle);
            found |= subs.len() != before;
            !subs.is_empty()
        });
        found
    }
}

/// Cloneable handle to one shared bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live subscriber of `channel`.
    /// Returns the number of subscribers reached.
    pub fn publish(&self, channel: &Channel, event: TransportEvent) -> usize {
        self.publish_all(std::slice::from_ref(channel), event)
    }

    /// Deliver `event` on several channels as one step: no subscribe,
    /// unsubscribe or transfer can land between the deliveries.
    pub fn publish_all(&self, channels: &[Channel], event: TransportEvent) -> usize {
        let mut inner = self.lock();
        let mut reached = 0;
        for channel in channels {
            let Some(subscribers) = inner.subscribers.get_mut(channel) else {
                continue;
            };
            subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
            reached += subscribers.len();
            if subscribers.is_empty() {
                inner.subscribers.remove(channel);
            }
        }
        reached
    }

    pub fn subscribe(&self, channel: Channel) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.lock().add(channel.clone(), tx);
        EventStream {
            handle,
            channel,
            rx,
        }
    }

    /// Remove one subscriber. Returns `false` if the handle was unknown.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.lock().remove(handle)
    }

    /// Replace `from` with a subscription on `channel`, carrying over the
    /// events `from` already holds that satisfy `keep`.
    ///
    /// Runs under the bus lock, so an event published meanwhile is seen by
    /// exactly one of the two subscriptions.
    pub fn transfer(
        &self,
        mut from: EventStream,
        channel: Channel,
        keep: impl Fn(&TransportEvent) -> bool,
    ) -> EventStream {
        let mut inner = self.lock();
        inner.remove(from.handle);
        let (tx, rx) = mpsc::unbounded_channel();
        while let Ok(event) = from.rx.try_recv() {
            if keep(&event) {
                let _ = tx.send(event);
            }
        }
        let handle = inner.add(channel.clone(), tx);
        EventStream {
            handle,
            channel,
            rx,
        }
    }

    /// Drop every subscriber on every channel.
    pub fn clear(&self) {
        self.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.lock().subscribers.get(channel).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("EventBus")
            .field("channels", &inner.subscribers.len())
            .finish()
    }
}
