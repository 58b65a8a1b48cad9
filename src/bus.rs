//! Fan-out of published events to live subscribers
//!
//! Every subscriber owns a bounded channel. Publishing never waits: when a
//! subscriber's buffer is full the new event is dropped for that subscriber only
//! (drop-newest) and counted. A subscriber that stays idle for the keepalive
//! interval receives a [`BusMessage::Ping`] instead of an update.

use crate::error::SubscriberFault;
use crate::types::Event;
use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// What a subscriber receives
#[derive(Debug, Clone)]
pub enum BusMessage {
    Update(Arc<Event>),
    Ping(Ping),
}

/// Keepalive payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ping {
    /// Unix time in seconds
    pub ts: f64,
}

impl Ping {
    pub fn now() -> Self {
        Self {
            ts: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

impl BusMessage {
    /// SSE event name
    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::Update(_) => "update",
            BusMessage::Ping(_) => "ping",
        }
    }
}

struct BusInner {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<Event>>>>,
    next_id: AtomicU64,
    buffer: usize,
    keepalive: Duration,
    dropped: AtomicU64,
}

/// Single-producer, multi-subscriber event bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(buffer: usize, keepalive: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                keepalive,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Deliver `event` to every current subscriber; returns how many accepted it
    pub fn publish(&self, event: Arc<Event>) -> usize {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    subscriber = id,
                    trans_num = %event.trans_num,
                    "Subscriber buffer full, dropping event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, "Pruning closed subscriber");
                false
            }
        });

        delivered
    }

    /// Start receiving every event published from now on
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.buffer);

        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        debug!(subscriber = id, "Subscriber registered");

        Subscription {
            id,
            rx,
            keepalive: self.inner.keepalive,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Events not delivered because a subscriber's buffer was full
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Disconnect every subscriber; their streams end after draining buffered events
    pub fn close(&self) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// One subscriber's view of the bus. Dropping it unregisters the subscriber.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<Event>>,
    keepalive: Duration,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next update, or a ping if nothing arrives within the keepalive interval
    pub async fn recv(&mut self) -> Result<BusMessage, SubscriberFault> {
        match tokio::time::timeout(self.keepalive, self.rx.recv()).await {
            Ok(Some(event)) => Ok(BusMessage::Update(event)),
            Ok(None) => Err(SubscriberFault::BusClosed),
            Err(_) => Ok(BusMessage::Ping(Ping::now())),
        }
    }

    /// Lazy stream of messages, ending when the bus closes
    pub fn into_stream(mut self) -> impl Stream<Item = BusMessage> + Send + 'static {
        async_stream::stream! {
            while let Ok(message) = self.recv().await {
                yield message;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
            debug!(subscriber = self.id, "Subscriber unregistered");
        }
    }
}
