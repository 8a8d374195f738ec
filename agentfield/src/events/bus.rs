//! Generic in-process publish/subscribe bus.
//!
//! Publishing never blocks and never fails. Subscribers pick one of two
//! policies:
//!
//! - [`QueuePolicy::Lossy`]: a `broadcast` receiver bounded to the bus
//!   capacity. A subscriber that falls behind loses its oldest events and
//!   keeps the most recent `capacity`. Used by live streams.
//! - [`QueuePolicy::Lossless`]: an unbounded `mpsc` receiver, for consumers
//!   that must see every event, such as the webhook pipeline.
//!
//! The bus owns no background task. Dropping the last bus handle closes all
//! subscriptions; `recv` then returns the remaining queued events and then
//! `None`.

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tracing::{debug, trace};

/// Queue policy for a single subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    Lossy { capacity: usize },
    Lossless,
}

struct BusInner<T> {
    name: &'static str,
    capacity: usize,
    lossy: broadcast::Sender<T>,
    lossless: RwLock<Vec<mpsc::UnboundedSender<T>>>,
    published: AtomicU64,
}

/// Cloneable handle to a typed event bus.
pub struct EventBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// New bus whose lossy subscribers hold at most `capacity` events.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (lossy, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                name,
                capacity,
                lossy,
                lossless: RwLock::new(Vec::new()),
                published: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Fan `event` out to every subscriber. Returns the number of subscribers reached.
    pub fn publish(&self, event: T) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let mut lossless = self.inner.lossless.write();
        lossless.retain(|tx| tx.send(event.clone()).is_ok());
        // Err only means there is no lossy subscriber right now.
        let lossy = self.inner.lossy.send(event).unwrap_or(0);

        let reached = lossy + lossless.len();
        trace!(bus = self.inner.name, subscribers = reached, "event published");
        reached
    }

    /// Best-effort subscription bounded to the bus capacity.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            receiver: Receiver::Lossy {
                rx: self.inner.lossy.subscribe(),
                capacity: self.inner.capacity,
            },
            evicted: 0,
            bus: self.inner.name,
        }
    }

    /// Subscription that never loses events.
    pub fn subscribe_lossless(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lossless.write().push(tx);
        Subscription {
            receiver: Receiver::Lossless(rx),
            evicted: 0,
            bus: self.inner.name,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut lossless = self.inner.lossless.write();
        lossless.retain(|tx| !tx.is_closed());
        self.inner.lossy.receiver_count() + lossless.len()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

enum Receiver<T> {
    Lossy {
        rx: broadcast::Receiver<T>,
        capacity: usize,
    },
    Lossless(mpsc::UnboundedReceiver<T>),
}

/// Receiving end of a bus subscription. Unsubscribes on drop.
pub struct Subscription<T> {
    receiver: Receiver<T>,
    evicted: u64,
    bus: &'static str,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Drop the oldest backlog past `capacity`.
    ///
    /// The broadcast ring rounds its size up to a power of two, so the bound
    /// is enforced here rather than by the channel.
    fn trim(&mut self) {
        let Receiver::Lossy { rx, capacity } = &mut self.receiver else {
            return;
        };
        while rx.len() > *capacity {
            match rx.try_recv() {
                Ok(_) => self.evicted += 1,
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.evicted += n,
                Err(_) => break,
            }
        }
    }

    /// Next event, or `None` once the bus is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            self.trim();
            match &mut self.receiver {
                Receiver::Lossless(rx) => return rx.recv().await,
                Receiver::Lossy { rx, .. } => match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => self.evicted += n,
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            self.trim();
            match &mut self.receiver {
                Receiver::Lossless(rx) => return rx.try_recv().ok(),
                Receiver::Lossy { rx, .. } => match rx.try_recv() {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::TryRecvError::Lagged(n)) => self.evicted += n,
                    Err(_) => return None,
                },
            }
        }
    }

    /// Events currently queued.
    pub fn len(&self) -> usize {
        match &self.receiver {
            Receiver::Lossy { rx, capacity } => rx.len().min(*capacity),
            Receiver::Lossless(rx) => rx.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events this subscriber lost because it fell behind.
    pub fn evicted_count(&self) -> u64 {
        match &self.receiver {
            Receiver::Lossy { rx, capacity } => self.evicted + rx.len().saturating_sub(*capacity) as u64,
            Receiver::Lossless(_) => 0,
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        match &self.receiver {
            Receiver::Lossy { capacity, .. } => QueuePolicy::Lossy { capacity: *capacity },
            Receiver::Lossless(_) => QueuePolicy::Lossless,
        }
    }

    /// Stream of events. Lossy streams skip whatever they lagged past.
    pub fn into_stream(mut self) -> Pin<Box<dyn Stream<Item = T> + Send>> {
        self.trim();
        let bus = self.bus;
        match self.receiver {
            Receiver::Lossless(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            Receiver::Lossy { rx, .. } => Box::pin(BroadcastStream::new(rx).filter_map(move |result| async move {
                match result {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        debug!(bus, skipped = n, "Stream subscriber lagged");
                        None
                    }
                }
            })),
        }
    }
}
