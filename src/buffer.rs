//! Per-unit-of-work event buffer
//!
//! A buffer collects events raised while a transaction runs and turns
//! them into records only at `release`, which the caller invokes right
//! after its commit. Dropping the buffer without releasing it (the
//! rollback path) leaves no trace.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{OutboxError, Result};
use crate::interceptor::InterceptorChain;
use crate::publisher::Publisher;
use crate::record::EventRecord;
use crate::registry::{EventKind, EventRegistry};
use crate::store::EventStore;

struct Entry {
    id: u64,
    payload_type: String,
    payload: serde_json::Value,
    schedule: DateTime<Utc>,
    entity: Option<String>,
}

/// Ordered event staging area for one unit of work
pub struct EventBuffer {
    registry: Arc<EventRegistry>,
    store: Arc<dyn EventStore>,
    interceptors: Arc<InterceptorChain>,
    svc_name: String,
    entries: Vec<Entry>,
    next_entry: u64,
}

impl EventBuffer {
    pub fn new(
        registry: Arc<EventRegistry>,
        store: Arc<dyn EventStore>,
        interceptors: Arc<InterceptorChain>,
        svc_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            interceptors,
            svc_name: svc_name.into(),
            entries: Vec::new(),
            next_entry: 0,
        }
    }

    fn push(
        &mut self,
        payload_type: &str,
        payload: serde_json::Value,
        schedule: DateTime<Utc>,
        entity: Option<String>,
    ) -> u64 {
        let id = self.next_entry;
        self.next_entry += 1;
        self.entries.push(Entry {
            id,
            payload_type: payload_type.to_string(),
            payload,
            schedule,
            entity,
        });
        id
    }

    /// Stage a domain event bound to an entity; the event only becomes a
    /// record if that entity is named at release. Returns an entry id
    /// usable with `detach`.
    pub fn attach_to_entity(
        &mut self,
        payload_type: &str,
        payload: serde_json::Value,
        entity: &str,
        schedule: DateTime<Utc>,
    ) -> Result<u64> {
        let descriptor = self.registry.expect(payload_type)?;
        if descriptor.kind != EventKind::Domain {
            return Err(OutboxError::Guard(format!(
                "{payload_type} is an integration event and cannot bind to entity {entity}"
            )));
        }
        Ok(self.push(payload_type, payload, schedule, Some(entity.to_string())))
    }

    /// Stage an unbound event of either kind
    pub fn attach(
        &mut self,
        payload_type: &str,
        payload: serde_json::Value,
        schedule: DateTime<Utc>,
    ) -> Result<u64> {
        self.registry.expect(payload_type)?;
        Ok(self.push(payload_type, payload, schedule, None))
    }

    /// Stage an integration event; rejects domain payload types
    pub fn attach_integration(
        &mut self,
        payload_type: &str,
        payload: serde_json::Value,
        schedule: DateTime<Utc>,
    ) -> Result<u64> {
        let descriptor = self.registry.expect(payload_type)?;
        if descriptor.kind != EventKind::Integration {
            return Err(OutboxError::Guard(format!(
                "{payload_type} is a domain event"
            )));
        }
        Ok(self.push(payload_type, payload, schedule, None))
    }

    /// Remove a staged entry; false when it was already gone
    pub fn detach(&mut self, entry_id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != entry_id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Turn staged entries into records and hand them to the publisher
    ///
    /// Entries bound to an entity convert only when that entity appears
    /// in `persisted_entities`; unbound entries always convert. Records
    /// are persisted when the descriptor says so, when delivery is
    /// deferred, or for integration events. The buffer drains even when
    /// individual entries fail; those failures are logged and the
    /// persisted record waits for compensation.
    pub async fn release(
        &mut self,
        persisted_entities: &[&str],
        publisher: &Arc<Publisher>,
    ) -> Result<Vec<Uuid>> {
        let entries = std::mem::take(&mut self.entries);
        let now = Utc::now();
        let mut released = Vec::new();

        for entry in entries {
            if let Some(entity) = &entry.entity {
                if !persisted_entities.contains(&entity.as_str()) {
                    debug!(
                        payload_type = %entry.payload_type,
                        entity = %entity,
                        "dropping event for unpersisted entity"
                    );
                    continue;
                }
            }

            let descriptor = self.registry.expect(&entry.payload_type)?;
            let kind = descriptor.kind;
            let mut record =
                EventRecord::new(descriptor, entry.payload, self.svc_name.clone(), entry.schedule);

            let deferred = entry.schedule > now;
            record.mark_persist(descriptor.persist || deferred || kind == EventKind::Integration);

            self.interceptors.pre_release(kind, &mut record).await?;

            if record.is_persist() {
                self.interceptors.pre_persist(kind, &mut record).await?;
                self.store.save(&mut record).await?;
                self.interceptors.post_persist(kind, &record).await?;
            }

            released.push(record.id);
            let snapshot = record.clone();
            if let Err(e) = publisher.publish(record).await {
                error!(
                    event_id = %snapshot.id,
                    event_type = %snapshot.event_type,
                    error = %e,
                    "release-time delivery failed"
                );
            }
            self.interceptors.post_release(kind, &snapshot).await?;
        }

        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboxConfig;
    use crate::registry::EventDescriptor;
    use crate::store::MemoryEventStore;
    use crate::subscriber::SubscriberRegistry;

    fn registry() -> Arc<EventRegistry> {
        let mut registry = EventRegistry::new();
        registry.register(EventDescriptor::domain("OrderPlaced", "order.placed"));
        registry.register(EventDescriptor::integration("StockSynced", "stock.synced"));
        Arc::new(registry)
    }

    fn fixture() -> (EventBuffer, Arc<Publisher>, Arc<MemoryEventStore>) {
        let registry = registry();
        let store = Arc::new(MemoryEventStore::new());
        let interceptors = Arc::new(InterceptorChain::new());
        let publisher = Arc::new(Publisher::new(
            &OutboxConfig::default(),
            Arc::clone(&registry),
            store.clone() as Arc<dyn EventStore>,
            Arc::new(SubscriberRegistry::new()),
            Arc::clone(&interceptors),
            Vec::new(),
        ));
        let buffer = EventBuffer::new(
            registry,
            store.clone() as Arc<dyn EventStore>,
            interceptors,
            "order-service",
        );
        (buffer, publisher, store)
    }

    #[tokio::test]
    async fn test_kind_guards() {
        let (mut buffer, _, _) = fixture();
        let now = Utc::now();

        let err = buffer
            .attach_to_entity("StockSynced", serde_json::json!({}), "order-1", now)
            .unwrap_err();
        assert!(matches!(err, OutboxError::Guard(_)));

        let err = buffer
            .attach_integration("OrderPlaced", serde_json::json!({}), now)
            .unwrap_err();
        assert!(matches!(err, OutboxError::Guard(_)));

        let err = buffer
            .attach("Unregistered", serde_json::json!({}), now)
            .unwrap_err();
        assert!(matches!(err, OutboxError::Config(_)));
    }

    #[tokio::test]
    async fn test_release_only_persisted_entities() {
        let (mut buffer, publisher, _) = fixture();
        let now = Utc::now();

        buffer
            .attach_to_entity("OrderPlaced", serde_json::json!({"n": 1}), "order-1", now)
            .unwrap();
        buffer
            .attach_to_entity("OrderPlaced", serde_json::json!({"n": 2}), "order-2", now)
            .unwrap();

        let released = buffer.release(&["order-1"], &publisher).await.unwrap();
        assert_eq!(released.len(), 1);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_detach_removes_entry() {
        let (mut buffer, publisher, _) = fixture();
        let now = Utc::now();

        let keep = buffer
            .attach("StockSynced", serde_json::json!({"n": 1}), now)
            .unwrap();
        let extra = buffer
            .attach("StockSynced", serde_json::json!({"n": 2}), now)
            .unwrap();

        assert!(buffer.detach(extra));
        assert!(!buffer.detach(extra));
        assert_ne!(keep, extra);

        let released = buffer.release(&[], &publisher).await.unwrap();
        assert_eq!(released.len(), 1);
    }

    #[tokio::test]
    async fn test_integration_event_persists_even_when_delivery_fails() {
        let (mut buffer, publisher, store) = fixture();
        let now = Utc::now();

        buffer
            .attach_integration("StockSynced", serde_json::json!({}), now)
            .unwrap();

        // No transports registered: delivery fails, the record stays
        // for the compensation sweep.
        let released = buffer.release(&[], &publisher).await.unwrap();
        assert_eq!(released.len(), 1);
        let stored = store.get(released[0]).await.unwrap().unwrap();
        assert!(stored.is_valid());
        assert!(stored.exception.is_some());
    }

    #[tokio::test]
    async fn test_dropped_buffer_leaves_no_records() {
        let (mut buffer, _, store) = fixture();
        buffer
            .attach("OrderPlaced", serde_json::json!({}), Utc::now())
            .unwrap();
        drop(buffer);
        assert!(store.is_empty().await);
    }
}
