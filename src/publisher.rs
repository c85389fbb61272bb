//! Event publishing pipeline
//!
//! The publisher owns the delivery side of the outbox: classify the
//! record via the registry, run the interceptor chain, dispatch to local
//! subscribers (domain events) or fan out to transport publishers
//! (integration events), and keep the persisted record in step with the
//! outcome. Deferred records go through a lazily-created bounded worker
//! pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::error::{OutboxError, Result};
use crate::interceptor::InterceptorChain;
use crate::record::EventRecord;
use crate::registry::{EventKind, EventRegistry};
use crate::store::EventStore;
use crate::subscriber::SubscriberRegistry;

/// Upper bound on resume's internal catch-up loop; hitting it means the
/// record's schedule is not advancing.
const RESUME_MAX_ITERATIONS: u32 = 65_535;

/// Outcome hooks a transport must fire exactly once per publish
#[async_trait]
pub trait PublishCallback: Send + Sync {
    /// Broker acknowledged the record
    async fn on_success(&self, record: EventRecord) -> Result<()>;

    /// Broker rejected the record or the send failed
    async fn on_exception(&self, record: EventRecord, reason: &str) -> Result<()>;
}

/// An outbound channel for integration events
///
/// Implementations fire the callback exactly once after the broker
/// answers. Returning `Err` means the callback was never invoked; the
/// publisher then records the failure itself.
#[async_trait]
pub trait TransportPublisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(
        &self,
        record: &EventRecord,
        callback: Arc<dyn PublishCallback>,
    ) -> Result<()>;
}

/// Callback that settles the persisted record
pub struct StoreCallback {
    store: Arc<dyn EventStore>,
    interceptors: Arc<InterceptorChain>,
    kind: EventKind,
}

impl StoreCallback {
    pub fn new(
        store: Arc<dyn EventStore>,
        interceptors: Arc<InterceptorChain>,
        kind: EventKind,
    ) -> Self {
        Self {
            store,
            interceptors,
            kind,
        }
    }
}

#[async_trait]
impl PublishCallback for StoreCallback {
    async fn on_success(&self, mut record: EventRecord) -> Result<()> {
        record.confirm_delivery(Utc::now());
        if record.is_persist() {
            self.interceptors.pre_persist(self.kind, &mut record).await?;
            self.store.save(&mut record).await?;
            self.interceptors.post_persist(self.kind, &record).await?;
        }
        debug!(event_id = %record.id, event_type = %record.event_type, "delivery confirmed");
        Ok(())
    }

    async fn on_exception(&self, mut record: EventRecord, reason: &str) -> Result<()> {
        record.occurred_exception(Utc::now(), reason);
        if record.is_persist() {
            self.store.save(&mut record).await?;
        }
        self.interceptors.on_exception(self.kind, &record).await?;
        warn!(
            event_id = %record.id,
            event_type = %record.event_type,
            reason,
            next_try_time = %record.next_try_time,
            "delivery failed, awaiting compensation"
        );
        Ok(())
    }
}

/// The delivery pipeline
pub struct Publisher {
    registry: Arc<EventRegistry>,
    store: Arc<dyn EventStore>,
    subscribers: Arc<SubscriberRegistry>,
    interceptors: Arc<InterceptorChain>,
    transports: Vec<Arc<dyn TransportPublisher>>,
    pool: OnceCell<Arc<Semaphore>>,
    worker_pool_size: usize,
}

impl Publisher {
    pub fn new(
        config: &OutboxConfig,
        registry: Arc<EventRegistry>,
        store: Arc<dyn EventStore>,
        subscribers: Arc<SubscriberRegistry>,
        interceptors: Arc<InterceptorChain>,
        transports: Vec<Arc<dyn TransportPublisher>>,
    ) -> Self {
        Self {
            registry,
            store,
            subscribers,
            interceptors,
            transports,
            pool: OnceCell::new(),
            worker_pool_size: config.worker_pool_size,
        }
    }

    /// Worker pool for deferred records, created at most once
    async fn pool(&self) -> Arc<Semaphore> {
        self.pool
            .get_or_init(|| async { Arc::new(Semaphore::new(self.worker_pool_size)) })
            .await
            .clone()
    }

    /// Publish a record now, or hand it to the worker pool when its
    /// schedule lies in the future. Deferred records must already be
    /// persisted so a crash before the timer fires loses nothing.
    pub async fn publish(self: &Arc<Self>, record: EventRecord) -> Result<()> {
        let now = Utc::now();
        if record.create_at > now {
            let delay = (record.create_at - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            let pool = self.pool().await;
            let publisher = Arc::clone(self);
            debug!(
                event_id = %record.id,
                schedule = %record.create_at,
                "deferring delivery"
            );
            tokio::spawn(async move {
                // Wait out the timer before taking a permit so sleeping
                // records cannot starve the pool.
                tokio::time::sleep(delay).await;
                let _permit = pool.acquire_owned().await;
                if let Err(e) = publisher.deliver(record).await {
                    error!(error = %e, "deferred delivery failed");
                }
            });
            return Ok(());
        }
        self.deliver(record).await
    }

    /// Drive one delivery attempt through the interceptor chain and the
    /// matching dispatch path.
    pub async fn deliver(self: &Arc<Self>, mut record: EventRecord) -> Result<()> {
        let descriptor = self.registry.expect(&record.payload_type)?;
        let kind = descriptor.kind;
        let callback: Arc<dyn PublishCallback> = Arc::new(StoreCallback::new(
            Arc::clone(&self.store),
            Arc::clone(&self.interceptors),
            kind,
        ));

        self.interceptors.pre_publish(&mut record).await?;

        match kind {
            EventKind::Domain => match self.subscribers.dispatch(&record).await {
                Ok(()) => {
                    callback.on_success(record.clone()).await?;
                    self.interceptors.post_publish(&record).await?;
                    Ok(())
                }
                Err(e) => {
                    let reason = e.to_string();
                    callback.on_exception(record.clone(), &reason).await?;
                    Err(OutboxError::Delivery {
                        id: record.id.to_string(),
                        reason,
                    })
                }
            },
            EventKind::Integration => {
                if self.transports.is_empty() {
                    let reason = "no transport publisher registered".to_string();
                    callback.on_exception(record.clone(), &reason).await?;
                    return Err(OutboxError::Delivery {
                        id: record.id.to_string(),
                        reason,
                    });
                }
                let mut failures = Vec::new();
                for transport in &self.transports {
                    if let Err(e) = transport.publish(&record, Arc::clone(&callback)).await {
                        let reason = format!("{}: {}", transport.name(), e);
                        callback.on_exception(record.clone(), &reason).await?;
                        failures.push(reason);
                    }
                }
                if failures.is_empty() {
                    self.interceptors.post_publish(&record).await?;
                    Ok(())
                } else {
                    Err(OutboxError::Delivery {
                        id: record.id.to_string(),
                        reason: failures.join("; "),
                    })
                }
            }
        }
    }

    /// Catch a stalled record up to the sweep window and republish it
    ///
    /// Re-drives `begin_delivery` until the record's next try moves past
    /// `min_next_try_time`. A record whose schedule stops advancing would
    /// spin here forever, so the loop is bounded and raises a guard
    /// error instead.
    pub async fn resume(
        self: &Arc<Self>,
        mut record: EventRecord,
        min_next_try_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut delivering = false;
        let mut iterations = 0u32;
        while record.next_try_time <= min_next_try_time {
            iterations += 1;
            if iterations > RESUME_MAX_ITERATIONS {
                return Err(OutboxError::Guard(format!(
                    "event {} schedule is not advancing, suspected livelock",
                    record.id
                )));
            }
            if record.begin_delivery(record.next_try_time) {
                delivering = true;
            } else if record.is_invalid() || record.is_delivered() {
                break;
            }
        }
        record.mark_persist(true);
        self.store.save(&mut record).await?;

        if delivering {
            info!(
                event_id = %record.id,
                event_type = %record.event_type,
                tried_times = record.tried_times,
                "resuming delivery"
            );
            self.deliver(record).await?;
        }
        Ok(())
    }

    /// Re-run delivery for a stored record by id. The attempt goes
    /// through the guarded transition so it is counted and rescheduled
    /// like any other.
    pub async fn retry(self: &Arc<Self>, id: Uuid) -> Result<()> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| OutboxError::NotFound(format!("event {id}")))?;
        let now = Utc::now().max(record.next_try_time);
        if !record.begin_delivery(now) {
            return Err(OutboxError::Guard(format!("event {id} is not retryable")));
        }
        record.mark_persist(true);
        self.store.save(&mut record).await?;
        self.deliver(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EventDescriptor;
    use crate::store::MemoryEventStore;
    use crate::subscriber::LocalSubscriber;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl LocalSubscriber for Counting {
        fn payload_type(&self) -> &str {
            "OrderPlaced"
        }
        async fn on_event(&self, _record: &EventRecord) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl LocalSubscriber for Failing {
        fn payload_type(&self) -> &str {
            "OrderPlaced"
        }
        async fn on_event(&self, _record: &EventRecord) -> Result<()> {
            Err(OutboxError::Store("handler lost its database".into()))
        }
    }

    fn registry() -> Arc<EventRegistry> {
        let mut registry = EventRegistry::new();
        registry.register(EventDescriptor::domain("OrderPlaced", "order.placed"));
        Arc::new(registry)
    }

    fn publisher(
        subscribers: SubscriberRegistry,
        store: Arc<MemoryEventStore>,
    ) -> Arc<Publisher> {
        Arc::new(Publisher::new(
            &OutboxConfig::default(),
            registry(),
            store,
            Arc::new(subscribers),
            Arc::new(InterceptorChain::new()),
            Vec::new(),
        ))
    }

    fn record(store_persist: bool) -> EventRecord {
        let desc = EventDescriptor::domain("OrderPlaced", "order.placed");
        let mut r = EventRecord::new(&desc, serde_json::json!({"orderId": "O1"}), "svc", Utc::now());
        r.mark_persist(store_persist);
        r
    }

    #[tokio::test]
    async fn test_domain_delivery_confirms_record() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut subscribers = SubscriberRegistry::new();
        subscribers.subscribe(Box::new(Counting(calls.clone())));
        let store = Arc::new(MemoryEventStore::new());
        let publisher = publisher(subscribers, store.clone());

        let mut r = record(true);
        store.save(&mut r).await.unwrap();
        publisher.publish(r.clone()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = store.get(r.id).await.unwrap().unwrap();
        assert!(stored.is_delivered());
    }

    #[tokio::test]
    async fn test_failed_delivery_records_exception() {
        let mut subscribers = SubscriberRegistry::new();
        subscribers.subscribe(Box::new(Failing));
        let store = Arc::new(MemoryEventStore::new());
        let publisher = publisher(subscribers, store.clone());

        let mut r = record(true);
        store.save(&mut r).await.unwrap();
        let tried_before = r.tried_times;
        let next_before = r.next_try_time;

        let err = publisher.publish(r.clone()).await.unwrap_err();
        assert!(matches!(err, OutboxError::Delivery { .. }));

        // The failure writes the error but does not count a second
        // attempt; the creation-time accounting already covered this one.
        let stored = store.get(r.id).await.unwrap().unwrap();
        assert!(stored.is_valid());
        assert_eq!(stored.tried_times, tried_before);
        assert_eq!(stored.next_try_time, next_before);
        assert!(stored.exception.is_some());
    }

    #[tokio::test]
    async fn test_resume_counts_attempts_only_through_begin() {
        let mut subscribers = SubscriberRegistry::new();
        subscribers.subscribe(Box::new(Failing));
        let store = Arc::new(MemoryEventStore::new());
        let publisher = publisher(subscribers, store.clone());

        // A record stalled one interval in the past: the catch-up loop
        // begins exactly once before next_try_time crosses the window,
        // and the failing subscriber must not add a second count.
        let mut r = record(true);
        r.next_try_time = Utc::now() - chrono::Duration::seconds(1);
        store.save(&mut r).await.unwrap();
        let tried_before = r.tried_times;

        let err = publisher.resume(r.clone(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, OutboxError::Delivery { .. }));

        let stored = store.get(r.id).await.unwrap().unwrap();
        assert_eq!(stored.tried_times, tried_before + 1);
        assert!(stored.is_valid());
        assert!(stored.exception.is_some());
    }

    #[tokio::test]
    async fn test_resume_guard_on_non_advancing_schedule() {
        let store = Arc::new(MemoryEventStore::new());
        let publisher = publisher(SubscriberRegistry::new(), store.clone());

        // A zero retry interval keeps next_try_time pinned, so the
        // catch-up loop can never cross the window and must bail out.
        let desc = EventDescriptor::domain("OrderPlaced", "order.placed").with_retry(
            crate::registry::RetryPolicy {
                retry_times: u32::MAX,
                expire_after: chrono::Duration::days(3650),
                intervals: vec![chrono::Duration::zero()],
            },
        );
        let mut stuck = EventRecord::new(&desc, serde_json::json!({}), "svc", Utc::now());
        stuck.mark_persist(true);
        store.save(&mut stuck).await.unwrap();

        let window = Utc::now() + chrono::Duration::days(365);
        let err = publisher.resume(stuck, window).await.unwrap_err();
        assert!(matches!(err, OutboxError::Guard(_)));
    }

    #[tokio::test]
    async fn test_resume_stops_on_invalid_record() {
        let store = Arc::new(MemoryEventStore::new());
        let publisher = publisher(SubscriberRegistry::new(), store.clone());

        let mut r = record(true);
        r.cancel_delivery(Utc::now());
        store.save(&mut r).await.unwrap();

        // Cancelled records end the catch-up loop without delivering
        let window = Utc::now() + chrono::Duration::days(365);
        publisher.resume(r.clone(), window).await.unwrap();
        let stored = store.get(r.id).await.unwrap().unwrap();
        assert_eq!(stored.state, crate::record::EventState::Cancel);
    }

    #[tokio::test]
    async fn test_resume_stops_on_delivered_record() {
        let store = Arc::new(MemoryEventStore::new());
        let publisher = publisher(SubscriberRegistry::new(), store.clone());

        let mut r = record(true);
        r.confirm_delivery(Utc::now());
        store.save(&mut r).await.unwrap();

        // An already-delivered record swept with a far-future window
        // must exit the loop cleanly instead of tripping the guard.
        let window = Utc::now() + chrono::Duration::days(365);
        publisher.resume(r.clone(), window).await.unwrap();
        let stored = store.get(r.id).await.unwrap().unwrap();
        assert!(stored.is_delivered());
    }

    #[tokio::test]
    async fn test_deferred_timer_does_not_hold_worker_permit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut subscribers = SubscriberRegistry::new();
        subscribers.subscribe(Box::new(Counting(calls.clone())));
        let store = Arc::new(MemoryEventStore::new());
        let config = OutboxConfig {
            worker_pool_size: 1,
            ..OutboxConfig::default()
        };
        let publisher = Arc::new(Publisher::new(
            &config,
            registry(),
            store.clone(),
            Arc::new(subscribers),
            Arc::new(InterceptorChain::new()),
            Vec::new(),
        ));

        // A far-out deferral must not pin the single permit while it
        // sleeps; the near-term record has to get through.
        let desc = EventDescriptor::domain("OrderPlaced", "order.placed");
        let mut far = EventRecord::new(
            &desc,
            serde_json::json!({"orderId": "far"}),
            "svc",
            Utc::now() + chrono::Duration::minutes(10),
        );
        far.mark_persist(true);
        store.save(&mut far).await.unwrap();
        publisher.publish(far).await.unwrap();

        let mut near = EventRecord::new(
            &desc,
            serde_json::json!({"orderId": "near"}),
            "svc",
            Utc::now() + chrono::Duration::milliseconds(20),
        );
        near.mark_persist(true);
        store.save(&mut near).await.unwrap();
        publisher.publish(near).await.unwrap();

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("near-term deferred record never delivered");
    }

    #[tokio::test]
    async fn test_retry_unknown_id() {
        let store = Arc::new(MemoryEventStore::new());
        let publisher = publisher(SubscriberRegistry::new(), store);

        let err = publisher.retry(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OutboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retry_counts_an_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut subscribers = SubscriberRegistry::new();
        subscribers.subscribe(Box::new(Counting(calls.clone())));
        let store = Arc::new(MemoryEventStore::new());
        let publisher = publisher(subscribers, store.clone());

        let mut r = record(true);
        store.save(&mut r).await.unwrap();
        let tried_before = r.tried_times;

        publisher.retry(r.id).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = store.get(r.id).await.unwrap().unwrap();
        assert!(stored.is_delivered());
        assert_eq!(stored.tried_times, tried_before + 1);
    }

    #[tokio::test]
    async fn test_retry_refuses_cancelled_record() {
        let store = Arc::new(MemoryEventStore::new());
        let publisher = publisher(SubscriberRegistry::new(), store.clone());

        let mut r = record(true);
        r.cancel_delivery(Utc::now());
        store.save(&mut r).await.unwrap();

        let err = publisher.retry(r.id).await.unwrap_err();
        assert!(matches!(err, OutboxError::Guard(_)));
    }

    #[tokio::test]
    async fn test_integration_without_transport_fails() {
        let mut registry = EventRegistry::new();
        registry.register(EventDescriptor::integration("StockSynced", "stock.synced"));
        let store = Arc::new(MemoryEventStore::new());
        let publisher = Arc::new(Publisher::new(
            &OutboxConfig::default(),
            Arc::new(registry),
            store.clone(),
            Arc::new(SubscriberRegistry::new()),
            Arc::new(InterceptorChain::new()),
            Vec::new(),
        ));

        let desc = EventDescriptor::integration("StockSynced", "stock.synced");
        let mut r = EventRecord::new(&desc, serde_json::json!({}), "svc", Utc::now());
        r.mark_persist(true);
        store.save(&mut r).await.unwrap();

        let err = publisher.publish(r.clone()).await.unwrap_err();
        assert!(matches!(err, OutboxError::Delivery { .. }));
        let stored = store.get(r.id).await.unwrap().unwrap();
        assert!(stored.is_valid());
        assert!(stored.exception.is_some());
    }
}
