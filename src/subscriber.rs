//! Local subscriber dispatch
//!
//! Subscribers react in-process to published events. They run in
//! priority order (lower value first, registration order within a
//! priority), every subscriber runs even after one fails, and any
//! failure fails the whole publish so the record is retried.

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::{OutboxError, Result};
use crate::record::EventRecord;

/// Priority given to subscribers that do not declare one; sorts last
pub const LOWEST_PRIORITY: i32 = i32::MAX;

/// An in-process reaction to a published event
#[async_trait]
pub trait LocalSubscriber: Send + Sync {
    /// Payload type this subscriber reacts to
    fn payload_type(&self) -> &str;

    /// Dispatch order; lower runs first
    fn priority(&self) -> i32 {
        LOWEST_PRIORITY
    }

    async fn on_event(&self, record: &EventRecord) -> Result<()>;
}

/// Ordered set of local subscribers
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Vec<Box<dyn LocalSubscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping the list priority-sorted; ties keep registration
    /// order.
    pub fn subscribe(&mut self, subscriber: Box<dyn LocalSubscriber>) {
        let priority = subscriber.priority();
        let at = self
            .subscribers
            .partition_point(|s| s.priority() <= priority);
        self.subscribers.insert(at, subscriber);
    }

    /// Subscribers for a payload type, in dispatch order
    pub fn subscribers_for(&self, payload_type: &str) -> Vec<&dyn LocalSubscriber> {
        self.subscribers
            .iter()
            .filter(|s| s.payload_type() == payload_type)
            .map(|s| s.as_ref())
            .collect()
    }

    /// Run every matching subscriber. All of them run; if any failed,
    /// the combined failure comes back so the caller retries the record.
    pub async fn dispatch(&self, record: &EventRecord) -> Result<()> {
        let mut failures = Vec::new();
        for subscriber in self.subscribers_for(&record.payload_type) {
            debug!(
                event_id = %record.id,
                payload_type = %record.payload_type,
                priority = subscriber.priority(),
                "dispatching to local subscriber"
            );
            if let Err(e) = subscriber.on_event(record).await {
                error!(event_id = %record.id, error = %e, "local subscriber failed");
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(OutboxError::Delivery {
                id: record.id.to_string(),
                reason: failures.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EventDescriptor;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct Recording {
        label: &'static str,
        priority: i32,
        order: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl LocalSubscriber for Recording {
        fn payload_type(&self) -> &str {
            "OrderPlaced"
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn on_event(&self, _record: &EventRecord) -> Result<()> {
            self.order.lock().unwrap().push(self.label);
            if self.fail {
                Err(OutboxError::Store("subscriber down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn test_record() -> EventRecord {
        let desc = EventDescriptor::domain("OrderPlaced", "order.placed");
        EventRecord::new(&desc, serde_json::json!({}), "svc", Utc::now())
    }

    #[tokio::test]
    async fn test_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriberRegistry::new();
        for (label, priority) in [("late", 10), ("early", 1), ("mid", 5)] {
            registry.subscribe(Box::new(Recording {
                label,
                priority,
                order: order.clone(),
                fail: false,
            }));
        }

        registry.dispatch(&test_record()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["early", "mid", "late"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_others() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriberRegistry::new();
        registry.subscribe(Box::new(Recording {
            label: "first",
            priority: 1,
            order: order.clone(),
            fail: true,
        }));
        registry.subscribe(Box::new(Recording {
            label: "second",
            priority: 2,
            order: order.clone(),
            fail: false,
        }));

        let err = registry.dispatch(&test_record()).await.unwrap_err();
        assert!(matches!(err, OutboxError::Delivery { .. }));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_unmatched_payload_is_silent() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        struct Other;

        #[async_trait]
        impl LocalSubscriber for Other {
            fn payload_type(&self) -> &str {
                "StockReserved"
            }
            async fn on_event(&self, _record: &EventRecord) -> Result<()> {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let mut registry = SubscriberRegistry::new();
        registry.subscribe(Box::new(Other));
        registry.dispatch(&test_record()).await.unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    }
}
