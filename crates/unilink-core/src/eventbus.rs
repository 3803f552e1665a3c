//! Event bus for the connectivity layer.
//!
//! Every component publishes [`ConnectivityEvent`]s here and external
//! collaborators (persistence, UI) subscribe to them. The bus is bounded:
//! a subscriber that falls more than `capacity` events behind loses the
//! oldest events and keeps receiving from the newest retained one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::event::{ConnectivityEvent, EventMetadata};

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Bounded broadcast bus for connectivity events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(ConnectivityEvent, EventMetadata)>,
    name: String,
    published: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many events are buffered for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            name: "default".to_string(),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the bus name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events published since creation.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Publish an event from the "system" source.
    pub fn publish(&self, event: ConnectivityEvent) -> bool {
        self.publish_with_source(event, "system")
    }

    /// Publish an event with a custom source.
    ///
    /// Returns `true` if there was at least one subscriber. Publishing never
    /// blocks and never waits for slow subscribers.
    pub fn publish_with_source(&self, event: ConnectivityEvent, source: impl Into<String>) -> bool {
        self.publish_with_metadata(event, EventMetadata::new(source))
    }

    /// Publish an event with custom metadata.
    pub fn publish_with_metadata(&self, event: ConnectivityEvent, metadata: EventMetadata) -> bool {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Subscribe to events matching `filter`.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&ConnectivityEvent) -> bool + Send + 'static,
    {
        FilteredReceiver {
            inner: self.subscribe(),
            filter,
        }
    }

    /// Subscribe to events about one device.
    pub fn subscribe_device(
        &self,
        device_id: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&ConnectivityEvent) -> bool + Send + 'static> {
        let device_id = device_id.into();
        self.subscribe_filtered(move |event| event.device_id() == device_id)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(ConnectivityEvent, EventMetadata)>,
    dropped: u64,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once every publisher is gone. Events dropped because
    /// this receiver lagged are counted in [`dropped`](Self::dropped).
    pub async fn recv(&mut self) -> Option<(ConnectivityEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    warn!(skipped, "event subscriber lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(ConnectivityEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                }
                Err(_) => return None,
            }
        }
    }

    /// Events lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<F>
where
    F: Fn(&ConnectivityEvent) -> bool + Send,
{
    inner: EventBusReceiver,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&ConnectivityEvent) -> bool + Send,
{
    /// Receive the next event matching the filter.
    pub async fn recv(&mut self) -> Option<(ConnectivityEvent, EventMetadata)> {
        loop {
            let (event, meta) = self.inner.recv().await?;
            if (self.filter)(&event) {
                return Some((event, meta));
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<(ConnectivityEvent, EventMetadata)> {
        while let Some((event, meta)) = self.inner.try_recv() {
            if (self.filter)(&event) {
                return Some((event, meta));
            }
        }
        None
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;

    fn state_event(device: &str) -> ConnectivityEvent {
        ConnectivityEvent::state_changed(
            device,
            None,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
        )
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert!(bus.publish(state_event("a")));
        let (event, meta) = rx.recv().await.unwrap();
        assert_eq!(event.device_id(), "a");
        assert_eq!(meta.source, "system");
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert!(!bus.publish(state_event("a")));
    }

    #[tokio::test]
    async fn test_device_filter() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_device("b");

        bus.publish(state_event("a"));
        bus.publish(state_event("b"));

        let (event, _) = rx.recv().await.unwrap();
        assert_eq!(event.device_id(), "b");
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = EventBus::with_capacity(4);
        let mut rx = bus.subscribe();

        for i in 0..10 {
            bus.publish(state_event(&format!("d{}", i)));
        }

        let (first, _) = rx.recv().await.unwrap();
        assert_eq!(first.device_id(), "d6");
        assert_eq!(rx.dropped(), 6);
    }
}
