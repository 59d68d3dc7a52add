//! At-most-once pub/sub fan-out.
//!
//! Publishers hand a message to the gateway; every live subscriber whose
//! filter matches the topic gets a copy in its own bounded buffer. A full
//! buffer drops its oldest entry, so a slow or disconnected subscriber
//! never blocks the publisher. Dropped deliveries are counted, not
//! retried.

mod mqtt;

pub use mqtt::MqttPublisher;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::event::EventRecord;
use crate::frame::{Detection, Frame};
use crate::PipelineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicKind {
    Events,
    Frames,
}

impl TopicKind {
    fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Events => "events",
            TopicKind::Frames => "frames",
        }
    }
}

/// Channel key: one stream, one kind of traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topic {
    pub stream_id: String,
    pub kind: TopicKind,
}

impl Topic {
    pub fn events(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            kind: TopicKind::Events,
        }
    }

    pub fn frames(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            kind: TopicKind::Frames,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stream_id, self.kind.as_str())
    }
}

/// Subscriber-side topic selection. `None` fields match anything.
#[derive(Clone, Debug, Default)]
pub struct TopicFilter {
    pub stream_id: Option<String>,
    pub kind: Option<TopicKind>,
}

impl TopicFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn events() -> Self {
        Self {
            stream_id: None,
            kind: Some(TopicKind::Events),
        }
    }

    pub fn stream(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: Some(stream_id.into()),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: TopicKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        if let Some(stream_id) = &self.stream_id {
            if *stream_id != topic.stream_id {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if kind != topic.kind {
                return false;
            }
        }
        true
    }
}

/// What travels over a topic.
#[derive(Clone, Debug)]
pub enum GatewayPayload {
    Event(EventRecord),
    /// A frame with the detections drawn from it, for preview consumers.
    Frame {
        frame: Frame,
        detections: Vec<Detection>,
    },
}

/// One delivery. The payload is shared across subscribers.
#[derive(Clone, Debug)]
pub struct GatewayMessage {
    pub topic: Topic,
    pub payload: Arc<GatewayPayload>,
}

struct SubscriptionInner {
    capacity: usize,
    queue: Mutex<VecDeque<GatewayMessage>>,
    available: Condvar,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Receiving end of a gateway subscription. Dropping it unsubscribes.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Next message, waiting up to `timeout`. `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<GatewayMessage> {
        let mut queue = match self.inner.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.is_empty() {
            let (guard, _) = match self.inner.available.wait_timeout(queue, timeout) {
                Ok(pair) => pair,
                Err(poisoned) => {
                    let (guard, timed_out) = poisoned.into_inner();
                    (guard, timed_out)
                }
            };
            queue = guard;
        }
        queue.pop_front()
    }

    pub fn try_recv(&self) -> Option<GatewayMessage> {
        match self.inner.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliveries dropped on this subscription because its buffer was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

struct SubscriberEntry {
    filter: TopicFilter,
    inner: Weak<SubscriptionInner>,
}

pub struct Gateway {
    buffer: usize,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Gateway {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            buffer: subscriber_buffer.max(1),
            subscribers: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, filter: TopicFilter) -> Subscription {
        let inner = Arc::new(SubscriptionInner {
            capacity: self.buffer,
            queue: Mutex::new(VecDeque::with_capacity(self.buffer)),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let mut subscribers = self.lock_subscribers();
        subscribers.push(SubscriberEntry {
            filter,
            inner: Arc::downgrade(&inner),
        });
        Subscription { inner }
    }

    /// Deliver to every matching live subscriber. Returns the number of
    /// buffers the message landed in. Never blocks on a subscriber.
    pub fn publish(&self, topic: Topic, payload: GatewayPayload) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let message = GatewayMessage {
            topic,
            payload: Arc::new(payload),
        };

        let mut delivered = 0;
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|entry| {
            let Some(inner) = entry.inner.upgrade() else {
                return false;
            };
            if inner.closed.load(Ordering::Acquire) {
                return false;
            }
            if !entry.filter.matches(&message.topic) {
                return true;
            }
            let mut queue = match inner.queue.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() >= inner.capacity {
                queue.pop_front();
                inner.dropped.fetch_add(1, Ordering::Relaxed);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "{}",
                    PipelineError::GatewayPublishFailure {
                        topic: message.topic.to_string(),
                        reason: "subscriber buffer full, dropped oldest".into(),
                    }
                );
            }
            queue.push_back(message.clone());
            drop(queue);
            inner.available.notify_one();
            delivered += 1;
            true
        });
        delivered
    }

    pub fn published_total(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Deliveries dropped across all subscribers.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<SubscriberEntry>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn event(stream_id: &str, track_id: u64) -> GatewayPayload {
        GatewayPayload::Event(EventRecord {
            kind: EventKind::Enter,
            stream_id: stream_id.to_string(),
            track_id,
            timestamp_ms: 0,
            class: None,
            bbox: None,
            confidence: None,
            zone: None,
            counts: None,
            anomaly: None,
        })
    }

    fn track_id(message: &GatewayMessage) -> u64 {
        match message.payload.as_ref() {
            GatewayPayload::Event(e) => e.track_id,
            GatewayPayload::Frame { .. } => panic!("expected event"),
        }
    }

    #[test]
    fn filter_routes_by_stream_and_kind() {
        let gateway = Gateway::new(8);
        let cam_a = gateway.subscribe(TopicFilter::stream("cam_a"));
        let all_events = gateway.subscribe(TopicFilter::events());

        gateway.publish(Topic::events("cam_a"), event("cam_a", 1));
        gateway.publish(Topic::events("cam_b"), event("cam_b", 2));

        assert_eq!(cam_a.len(), 1);
        assert_eq!(all_events.len(), 2);
    }

    #[test]
    fn slow_subscriber_drops_oldest_keeps_newest() {
        let gateway = Gateway::new(3);
        let sub = gateway.subscribe(TopicFilter::all());

        for track in 1..=5 {
            gateway.publish(Topic::events("cam_a"), event("cam_a", track));
        }

        assert_eq!(sub.len(), 3);
        assert_eq!(sub.dropped(), 2);
        assert_eq!(gateway.dropped_total(), 2);
        let survivors: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .map(|m| track_id(&m))
            .collect();
        assert_eq!(survivors, vec![3, 4, 5]);
    }

    #[test]
    fn dropped_subscription_is_unregistered() {
        let gateway = Gateway::new(8);
        let sub = gateway.subscribe(TopicFilter::all());
        assert_eq!(gateway.publish(Topic::events("cam_a"), event("cam_a", 1)), 1);
        drop(sub);
        assert_eq!(gateway.publish(Topic::events("cam_a"), event("cam_a", 2)), 0);
    }

    #[test]
    fn recv_timeout_wakes_on_publish() {
        let gateway = Arc::new(Gateway::new(8));
        let sub = gateway.subscribe(TopicFilter::all());

        let publisher = {
            let gateway = gateway.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                gateway.publish(Topic::events("cam_a"), event("cam_a", 9));
            })
        };

        let message = sub.recv_timeout(Duration::from_secs(2)).expect("delivery");
        assert_eq!(track_id(&message), 9);
        publisher.join().unwrap();
    }

    #[test]
    fn recv_timeout_returns_none_when_idle() {
        let gateway = Gateway::new(8);
        let sub = gateway.subscribe(TopicFilter::all());
        assert!(sub.recv_timeout(Duration::from_millis(10)).is_none());
    }
}
