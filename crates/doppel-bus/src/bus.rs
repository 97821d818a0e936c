//! Event bus implementation
//!
//! Delivery is synchronous from the publisher's perspective: `publish`
//! returns once every listener subscribed at publish time has been
//! invoked on the caller's context. The subscriber list is snapshotted
//! before dispatch, so listener callbacks may re-enter the bus
//! (publish, subscribe, unsubscribe) without deadlocking. A listener
//! that panics is isolated: the panic is caught, logged, and delivery
//! continues for the remaining listeners.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use doppel_core::{EventEnvelope, Topic, TopicFilter, TwinError, TwinId, TwinResult};

/// Receiver side of a subscription
///
/// One method for every envelope whose topic is in the subscriber's
/// filter. Callbacks run on the publisher's context and must be fast
/// or hand off work themselves.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Arc<EventEnvelope>);
}

struct SubscriberEntry {
    subscriber_id: String,
    listener: Arc<dyn EventListener>,
}

impl SubscriberEntry {
    fn matches(&self, subscriber_id: &str, listener: &Arc<dyn EventListener>) -> bool {
        self.subscriber_id == subscriber_id && Arc::ptr_eq(&self.listener, listener)
    }
}

#[derive(Default)]
struct TwinNamespace {
    by_topic: HashMap<Topic, Vec<SubscriberEntry>>,
}

/// Process-local, topic-filtered publish/subscribe dispatcher,
/// keyed by twin id
#[derive(Default)]
pub struct EventBus {
    namespaces: Mutex<HashMap<TwinId, TwinNamespace>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Register `listener` for every topic in `filter`.
    ///
    /// Subscribing the same listener to the same topic twice is
    /// idempotent.
    pub fn subscribe(
        &self,
        twin_id: &TwinId,
        subscriber_id: &str,
        filter: &TopicFilter,
        listener: Arc<dyn EventListener>,
    ) {
        let mut namespaces = self.namespaces.lock();
        let namespace = namespaces.entry(twin_id.clone()).or_default();

        for topic in filter {
            let entries = namespace.by_topic.entry(topic.clone()).or_default();
            if entries.iter().any(|e| e.matches(subscriber_id, &listener)) {
                debug!(twin = %twin_id, %topic, subscriber = subscriber_id,
                       "subscriber already registered");
                continue;
            }
            entries.push(SubscriberEntry {
                subscriber_id: subscriber_id.to_string(),
                listener: Arc::clone(&listener),
            });
            debug!(twin = %twin_id, %topic, subscriber = subscriber_id, "subscribed");
        }
    }

    /// Remove only the given topics from that listener's registration.
    ///
    /// Removing a topic the listener is not registered for is a no-op.
    pub fn unsubscribe(
        &self,
        twin_id: &TwinId,
        subscriber_id: &str,
        filter: &TopicFilter,
        listener: &Arc<dyn EventListener>,
    ) {
        let mut namespaces = self.namespaces.lock();
        let Some(namespace) = namespaces.get_mut(twin_id) else {
            return;
        };

        for topic in filter {
            if let Some(entries) = namespace.by_topic.get_mut(topic) {
                entries.retain(|e| !e.matches(subscriber_id, listener));
                if entries.is_empty() {
                    namespace.by_topic.remove(topic);
                }
                debug!(twin = %twin_id, %topic, subscriber = subscriber_id, "unsubscribed");
            }
        }
    }

    /// Deliver `envelope` to every listener currently subscribed to its
    /// topic within the twin's namespace.
    ///
    /// Returns once all deliveries have been attempted. A panicking
    /// listener does not abort the publish loop.
    pub fn publish(
        &self,
        twin_id: &TwinId,
        publisher_id: &str,
        envelope: EventEnvelope,
    ) -> TwinResult<()> {
        if envelope.topic().is_empty() {
            return Err(TwinError::BadRequest(
                "cannot publish an envelope with an empty topic".to_string(),
            ));
        }

        let envelope = Arc::new(envelope);

        // Snapshot the matching subscribers so listeners can re-enter
        // the bus during dispatch.
        let targets: Vec<(String, Arc<dyn EventListener>)> = {
            let namespaces = self.namespaces.lock();
            namespaces
                .get(twin_id)
                .and_then(|ns| ns.by_topic.get(envelope.topic()))
                .map(|entries| {
                    entries
                        .iter()
                        .map(|e| (e.subscriber_id.clone(), Arc::clone(&e.listener)))
                        .collect()
                })
                .unwrap_or_default()
        };

        debug!(twin = %twin_id, topic = %envelope.topic(), publisher = publisher_id,
               subscribers = targets.len(), "publishing event");

        for (subscriber_id, listener) in targets {
            let delivery = catch_unwind(AssertUnwindSafe(|| listener.on_event(&envelope)));
            if delivery.is_err() {
                warn!(twin = %twin_id, topic = %envelope.topic(),
                      subscriber = subscriber_id.as_str(),
                      "listener panicked during delivery, continuing");
            }
        }

        Ok(())
    }

    /// Number of listeners registered for one topic of one twin
    pub fn subscriber_count(&self, twin_id: &TwinId, topic: &Topic) -> usize {
        self.namespaces
            .lock()
            .get(twin_id)
            .and_then(|ns| ns.by_topic.get(topic))
            .map_or(0, Vec::len)
    }

    /// Drop a twin's whole namespace (used on twin removal)
    pub fn drop_twin(&self, twin_id: &TwinId) {
        self.namespaces.lock().remove(twin_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    struct Recorder {
        received: PlMutex<Vec<Arc<EventEnvelope>>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                received: PlMutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.received.lock().len()
        }
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &Arc<EventEnvelope>) {
            self.received.lock().push(Arc::clone(event));
        }
    }

    struct Panicker;

    impl EventListener for Panicker {
        fn on_event(&self, _event: &Arc<EventEnvelope>) {
            panic!("listener failure");
        }
    }

    fn envelope(topic: &str) -> EventEnvelope {
        EventEnvelope::new(topic).with_body_value(json!({"k": 1}))
    }

    #[test]
    fn test_subscribe_then_publish_delivers_exactly_once() {
        let bus = EventBus::new();
        let twin = TwinId::new("twin-1");
        let recorder = Recorder::new();

        bus.subscribe(
            &twin,
            "observer",
            &TopicFilter::of(["dt.state.update"]),
            recorder.clone(),
        );
        bus.publish(&twin, "publisher", envelope("dt.state.update"))
            .unwrap();

        assert_eq!(recorder.count(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let twin = TwinId::new("twin-1");
        let recorder = Recorder::new();
        let filter = TopicFilter::of(["dt.state.update"]);

        bus.subscribe(&twin, "observer", &filter, recorder.clone());
        let listener: Arc<dyn EventListener> = recorder.clone();
        bus.unsubscribe(&twin, "observer", &filter, &listener);
        bus.publish(&twin, "publisher", envelope("dt.state.update"))
            .unwrap();

        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn test_duplicate_subscription_is_idempotent() {
        let bus = EventBus::new();
        let twin = TwinId::new("twin-1");
        let recorder = Recorder::new();
        let filter = TopicFilter::of(["dt.state.update"]);

        bus.subscribe(&twin, "observer", &filter, recorder.clone());
        bus.subscribe(&twin, "observer", &filter, recorder.clone());
        bus.publish(&twin, "publisher", envelope("dt.state.update"))
            .unwrap();

        assert_eq!(recorder.count(), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let twin = TwinId::new("twin-1");
        let filter = TopicFilter::of(["dt.state.update"]);

        // The panicking listener subscribes first so it dispatches first.
        bus.subscribe(&twin, "broken", &filter, Arc::new(Panicker));
        let recorder = Recorder::new();
        bus.subscribe(&twin, "observer", &filter, recorder.clone());

        bus.publish(&twin, "publisher", envelope("dt.state.update"))
            .unwrap();

        assert_eq!(recorder.count(), 1);
    }

    #[test]
    fn test_twin_namespaces_are_isolated() {
        let bus = EventBus::new();
        let twin_a = TwinId::new("twin-a");
        let twin_b = TwinId::new("twin-b");
        let recorder = Recorder::new();

        bus.subscribe(
            &twin_a,
            "observer",
            &TopicFilter::of(["dt.state.update"]),
            recorder.clone(),
        );
        bus.publish(&twin_b, "publisher", envelope("dt.state.update"))
            .unwrap();

        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn test_publisher_observes_publish_order() {
        let bus = EventBus::new();
        let twin = TwinId::new("twin-1");
        let recorder = Recorder::new();

        bus.subscribe(
            &twin,
            "observer",
            &TopicFilter::of(["dt.lifecycle"]),
            recorder.clone(),
        );
        for i in 0..5 {
            bus.publish(
                &twin,
                "publisher",
                EventEnvelope::new("dt.lifecycle").with_body_value(json!(i)),
            )
            .unwrap();
        }

        let received = recorder.received.lock();
        let order: Vec<i64> = received
            .iter()
            .map(|e| e.body().as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_topic_is_rejected() {
        let bus = EventBus::new();
        let twin = TwinId::new("twin-1");
        let err = bus
            .publish(&twin, "publisher", EventEnvelope::new(""))
            .unwrap_err();
        assert!(matches!(err, TwinError::BadRequest(_)));
    }

    #[test]
    fn test_unsubscribe_removes_only_given_topics() {
        let bus = EventBus::new();
        let twin = TwinId::new("twin-1");
        let recorder = Recorder::new();

        bus.subscribe(
            &twin,
            "observer",
            &TopicFilter::of(["dt.state.update", "dt.lifecycle"]),
            recorder.clone(),
        );
        let listener: Arc<dyn EventListener> = recorder.clone();
        bus.unsubscribe(
            &twin,
            "observer",
            &TopicFilter::of(["dt.state.update"]),
            &listener,
        );

        bus.publish(&twin, "publisher", envelope("dt.state.update"))
            .unwrap();
        bus.publish(&twin, "publisher", envelope("dt.lifecycle"))
            .unwrap();

        assert_eq!(recorder.count(), 1);
    }
}
