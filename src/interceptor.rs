//! Interceptor hooks around publishing and persistence
//!
//! Two layers: generic message interceptors wrap the publish itself,
//! event interceptors additionally see release and persist lifecycle
//! points and can filter by event kind. Both run in priority order,
//! fixed at registration time.

use async_trait::async_trait;

use crate::error::Result;
use crate::record::EventRecord;
use crate::registry::EventKind;

/// Hooks around the publish call itself
#[async_trait]
pub trait MessageInterceptor: Send + Sync {
    fn priority(&self) -> i32 {
        i32::MAX
    }

    /// Before the record leaves the process; may mutate the record
    async fn pre_publish(&self, record: &mut EventRecord) -> Result<()> {
        let _ = record;
        Ok(())
    }

    /// After a successful publish
    async fn post_publish(&self, record: &EventRecord) -> Result<()> {
        let _ = record;
        Ok(())
    }
}

/// Hooks around the event lifecycle
#[async_trait]
pub trait EventInterceptor: Send + Sync {
    fn priority(&self) -> i32 {
        i32::MAX
    }

    /// Restrict to one event kind; `None` sees everything
    fn kind_filter(&self) -> Option<EventKind> {
        None
    }

    /// Before the buffered events of a transaction are released
    async fn pre_release(&self, record: &mut EventRecord) -> Result<()> {
        let _ = record;
        Ok(())
    }

    /// After release, delivery, and persistence all finished
    async fn post_release(&self, record: &EventRecord) -> Result<()> {
        let _ = record;
        Ok(())
    }

    /// Before the record is written to its store
    async fn pre_persist(&self, record: &mut EventRecord) -> Result<()> {
        let _ = record;
        Ok(())
    }

    /// After the record was written
    async fn post_persist(&self, record: &EventRecord) -> Result<()> {
        let _ = record;
        Ok(())
    }

    /// When delivery raised; the error is already on the record
    async fn on_exception(&self, record: &EventRecord) -> Result<()> {
        let _ = record;
        Ok(())
    }
}

/// Priority-ordered interceptor lists, sorted once at registration
#[derive(Default)]
pub struct InterceptorChain {
    message: Vec<Box<dyn MessageInterceptor>>,
    event: Vec<Box<dyn EventInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_message(&mut self, interceptor: Box<dyn MessageInterceptor>) {
        let priority = interceptor.priority();
        let at = self.message.partition_point(|i| i.priority() <= priority);
        self.message.insert(at, interceptor);
    }

    pub fn register_event(&mut self, interceptor: Box<dyn EventInterceptor>) {
        let priority = interceptor.priority();
        let at = self.event.partition_point(|i| i.priority() <= priority);
        self.event.insert(at, interceptor);
    }

    fn event_matching(&self, kind: EventKind) -> impl Iterator<Item = &dyn EventInterceptor> {
        self.event
            .iter()
            .filter(move |i| i.kind_filter().map_or(true, |k| k == kind))
            .map(|i| i.as_ref())
    }

    pub async fn pre_publish(&self, record: &mut EventRecord) -> Result<()> {
        for interceptor in &self.message {
            interceptor.pre_publish(record).await?;
        }
        Ok(())
    }

    pub async fn post_publish(&self, record: &EventRecord) -> Result<()> {
        for interceptor in &self.message {
            interceptor.post_publish(record).await?;
        }
        Ok(())
    }

    pub async fn pre_release(&self, kind: EventKind, record: &mut EventRecord) -> Result<()> {
        for interceptor in self.event_matching(kind) {
            interceptor.pre_release(record).await?;
        }
        Ok(())
    }

    pub async fn post_release(&self, kind: EventKind, record: &EventRecord) -> Result<()> {
        for interceptor in self.event_matching(kind) {
            interceptor.post_release(record).await?;
        }
        Ok(())
    }

    pub async fn pre_persist(&self, kind: EventKind, record: &mut EventRecord) -> Result<()> {
        for interceptor in self.event_matching(kind) {
            interceptor.pre_persist(record).await?;
        }
        Ok(())
    }

    pub async fn post_persist(&self, kind: EventKind, record: &EventRecord) -> Result<()> {
        for interceptor in self.event_matching(kind) {
            interceptor.post_persist(record).await?;
        }
        Ok(())
    }

    pub async fn on_exception(&self, kind: EventKind, record: &EventRecord) -> Result<()> {
        for interceptor in self.event_matching(kind) {
            interceptor.on_exception(record).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EventDescriptor;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    struct Tagging {
        priority: i32,
        tag: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl MessageInterceptor for Tagging {
        fn priority(&self) -> i32 {
            self.priority
        }

        async fn pre_publish(&self, record: &mut EventRecord) -> Result<()> {
            self.seen.lock().unwrap().push(self.tag);
            record.payload[self.tag] = serde_json::json!(true);
            Ok(())
        }
    }

    struct DomainOnly {
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventInterceptor for DomainOnly {
        fn kind_filter(&self) -> Option<EventKind> {
            Some(EventKind::Domain)
        }

        async fn pre_release(&self, _record: &mut EventRecord) -> Result<()> {
            self.seen.lock().unwrap().push("domain-only");
            Ok(())
        }
    }

    fn test_record() -> EventRecord {
        let desc = EventDescriptor::domain("OrderPlaced", "order.placed");
        EventRecord::new(&desc, serde_json::json!({}), "svc", Utc::now())
    }

    #[tokio::test]
    async fn test_message_interceptors_run_in_priority_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        chain.register_message(Box::new(Tagging {
            priority: 5,
            tag: "second",
            seen: seen.clone(),
        }));
        chain.register_message(Box::new(Tagging {
            priority: 1,
            tag: "first",
            seen: seen.clone(),
        }));

        let mut record = test_record();
        chain.pre_publish(&mut record).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(record.payload["first"], true);
    }

    #[tokio::test]
    async fn test_kind_filter_skips_other_kinds() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        chain.register_event(Box::new(DomainOnly { seen: seen.clone() }));

        let mut record = test_record();
        chain
            .pre_release(EventKind::Integration, &mut record)
            .await
            .unwrap();
        assert!(seen.lock().unwrap().is_empty());

        chain
            .pre_release(EventKind::Domain, &mut record)
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["domain-only"]);
    }
}
