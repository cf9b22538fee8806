//! Unsolicited-event fan-out.
//!
//! The reader loop publishes every non-response message to an [`EventBus`].
//! Each subscriber owns an unbounded MPSC queue and a tag filter, so
//! publishing never blocks the reader and each subscriber sees its events in
//! the order the lines were read. A UI task pulls from its [`Subscription`]
//! with `recv().await`, or drains it once per frame with [`Subscription::drain`].

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use boardlink_core::events::{BoardEvent, EventTag};
use tokio::sync::mpsc;

/// Identifies one subscription on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub{}", self.0)
    }
}

struct Subscriber {
    id: SubscriptionId,
    tags: HashSet<EventTag>,
    tx: mpsc::UnboundedSender<BoardEvent>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Tag-filtered publish/subscribe for [`BoardEvent`]s.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in `tags`. `bus` is a weak handle to this bus so
    /// the subscription can remove itself on drop.
    pub(crate) fn subscribe(&self, bus: Weak<EventBus>, tags: &[EventTag]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.subscribers.push(Subscriber {
            id,
            tags: tags.iter().copied().collect(),
            tx,
        });
        tracing::debug!(subscription = %id, tags = ?tags, "subscribed");
        Subscription { id, rx, bus }
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.len() != before
    }

    /// Deliver `event` to every subscriber of its tag. Subscribers whose
    /// receiver has gone away are pruned. Returns the number of deliveries.
    pub fn publish(&self, event: BoardEvent) -> usize {
        let tag = event.tag();
        let mut inner = self.lock();
        let mut delivered = 0;
        inner.subscribers.retain(|s| {
            if !s.tags.contains(&tag) {
                return !s.tx.is_closed();
            }
            match s.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    tracing::debug!(subscription = %s.id, "pruning closed subscriber");
                    false
                }
            }
        });
        tracing::trace!(tag = %tag, delivered, "event published");
        delivered
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// The receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<BoardEvent>,
    bus: Weak<EventBus>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event. Returns `None` once the subscription has
    /// been removed and its queue is empty.
    pub async fn recv(&mut self) -> Option<BoardEvent> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<BoardEvent> {
        self.rx.try_recv().ok()
    }

    /// Take every queued event without waiting.
    pub fn drain(&mut self) -> Vec<BoardEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.rx.try_recv() {
            out.push(ev);
        }
        out
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardlink_core::events::{PinUpdate, SensorReading};
    use std::sync::Arc;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new())
    }

    fn sub(bus: &Arc<EventBus>, tags: &[EventTag]) -> Subscription {
        bus.subscribe(Arc::downgrade(bus), tags)
    }

    fn pin(name: &str, value: i64) -> BoardEvent {
        BoardEvent::PinUpdate(PinUpdate {
            pin_name: name.into(),
            value,
        })
    }

    fn sensor(value: f64) -> BoardEvent {
        BoardEvent::SensorUpdate(SensorReading {
            sensor: "B24_TEMP".into(),
            value: Some(value),
            intensity: None,
            vibrating: None,
            unit: Some("C".into()),
        })
    }

    #[test]
    fn delivers_only_matching_tags() {
        let bus = bus();
        let mut pins = sub(&bus, &[EventTag::PinUpdate]);
        let mut sensors = sub(&bus, &[EventTag::SensorUpdate]);

        assert_eq!(bus.publish(pin("D13", 1)), 1);
        assert_eq!(bus.publish(sensor(21.0)), 1);

        assert_eq!(pins.drain(), vec![pin("D13", 1)]);
        assert_eq!(sensors.drain(), vec![sensor(21.0)]);
    }

    #[test]
    fn every_subscriber_of_a_tag_gets_a_copy() {
        let bus = bus();
        let mut a = sub(&bus, &[EventTag::SensorUpdate]);
        let mut b = sub(&bus, &EventTag::ALL);
        assert_eq!(bus.publish(sensor(22.5)), 2);
        assert_eq!(a.try_recv(), Some(sensor(22.5)));
        assert_eq!(b.try_recv(), Some(sensor(22.5)));
    }

    #[test]
    fn per_subscriber_order_is_publish_order() {
        let bus = bus();
        let mut s = sub(&bus, &[EventTag::PinUpdate]);
        for v in 0..50 {
            bus.publish(pin("A0", v));
        }
        let got: Vec<i64> = s
            .drain()
            .into_iter()
            .map(|e| match e {
                BoardEvent::PinUpdate(u) => u.value,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(got, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = bus();
        let s = sub(&bus, &[EventTag::PinUpdate]);
        assert_eq!(bus.subscriber_count(), 1);
        drop(s);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(pin("D2", 0)), 0);
    }

    #[test]
    fn explicit_unsubscribe() {
        let bus = bus();
        let mut s = sub(&bus, &[EventTag::Status]);
        assert!(bus.unsubscribe(s.id()));
        assert!(!bus.unsubscribe(s.id()));
        bus.publish(BoardEvent::Status {
            message: "ready".into(),
        });
        assert!(s.try_recv().is_none());
    }

    #[test]
    fn closed_receivers_are_pruned_on_publish() {
        let bus = bus();
        // A subscription whose bus handle is dangling cannot unsubscribe
        // itself; publish must clean it up.
        let s = bus.subscribe(Weak::new(), &[EventTag::PinUpdate]);
        drop(s);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.publish(pin("D3", 1)), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn connection_events_use_connection_tag() {
        let bus = bus();
        let mut s = sub(&bus, &[EventTag::Connection]);
        bus.publish(BoardEvent::Connected);
        bus.publish(BoardEvent::Disconnected);
        assert_eq!(
            s.drain(),
            vec![BoardEvent::Connected, BoardEvent::Disconnected]
        );
    }

    #[tokio::test]
    async fn recv_waits_for_publish() {
        let bus = bus();
        let mut s = sub(&bus, &[EventTag::PinUpdate]);
        let publisher = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                bus.publish(pin("D7", 1));
            })
        };
        assert_eq!(s.recv().await, Some(pin("D7", 1)));
        publisher.await.unwrap();
    }
}
