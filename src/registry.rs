//! Payload type registry
//!
//! Every payload type the engine handles is described up front by an
//! `EventDescriptor` and registered in an `EventRegistry` built at startup.
//! The Publisher and the attach buffer classify records by looking the
//! payload's type tag up here; there is no runtime reflection.

use crate::error::{OutboxError, Result};
use chrono::Duration;
use std::collections::HashMap;

/// Scope of an event payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Dispatched in-process to local subscribers
    Domain,
    /// Delivered to other services via transport publishers
    Integration,
}

/// Retry schedule for a payload type
///
/// An empty interval table falls back to the tiered default:
/// 1 minute for the first 10 tries, 5 minutes up to 20, 10 minutes beyond.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum delivery attempts before the record is exhausted
    pub retry_times: u32,

    /// How long after the schedule time the record expires
    pub expire_after: Duration,

    /// Explicit wait between attempts, indexed by tried count
    pub intervals: Vec<Duration>,
}

impl RetryPolicy {
    /// Default schedule for domain events: 16 tries, 30 minute expiry
    pub fn domain_default() -> Self {
        Self {
            retry_times: 16,
            expire_after: Duration::minutes(30),
            intervals: Vec::new(),
        }
    }

    /// Default schedule for integration events: 200 tries, one day expiry
    pub fn integration_default() -> Self {
        Self {
            retry_times: 200,
            expire_after: Duration::days(1),
            intervals: Vec::new(),
        }
    }

    /// Default schedule for sagas: 200 tries, one day expiry
    pub fn saga_default() -> Self {
        Self::integration_default()
    }
}

/// Static description of one payload type
#[derive(Debug, Clone)]
pub struct EventDescriptor {
    /// Payload type tag (registry key, carried on every record)
    pub payload_type: String,

    /// Topic the record is published under
    pub topic: String,

    /// Domain or integration scope
    pub kind: EventKind,

    /// Whether records must be persisted even for immediate delivery
    pub persist: bool,

    /// Retry schedule for records of this type
    pub retry: RetryPolicy,
}

impl EventDescriptor {
    /// Describe a domain event type
    pub fn domain(payload_type: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            payload_type: payload_type.into(),
            topic: topic.into(),
            kind: EventKind::Domain,
            persist: false,
            retry: RetryPolicy::domain_default(),
        }
    }

    /// Describe an integration event type
    ///
    /// Integration events are always persisted before delivery.
    pub fn integration(payload_type: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            payload_type: payload_type.into(),
            topic: topic.into(),
            kind: EventKind::Integration,
            persist: true,
            retry: RetryPolicy::integration_default(),
        }
    }

    /// Require persistence on release regardless of delivery timing
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Override the retry schedule
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Lookup table from payload type tag to descriptor
///
/// Built once at startup; lookups are read-only afterwards.
#[derive(Debug, Default)]
pub struct EventRegistry {
    by_type: HashMap<String, EventDescriptor>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type descriptor, replacing any previous entry
    pub fn register(&mut self, descriptor: EventDescriptor) {
        self.by_type
            .insert(descriptor.payload_type.clone(), descriptor);
    }

    /// Look up a descriptor by payload type tag
    pub fn get(&self, payload_type: &str) -> Option<&EventDescriptor> {
        self.by_type.get(payload_type)
    }

    /// Look up a descriptor, failing with a configuration error if absent
    pub fn expect(&self, payload_type: &str) -> Result<&EventDescriptor> {
        self.by_type.get(payload_type).ok_or_else(|| {
            OutboxError::Config(format!("Unregistered payload type: {}", payload_type))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = EventRegistry::new();
        registry.register(EventDescriptor::domain("OrderPlaced", "order.placed"));
        registry.register(EventDescriptor::integration("InvoiceRaised", "invoice.raised"));

        let placed = registry.get("OrderPlaced").unwrap();
        assert_eq!(placed.kind, EventKind::Domain);
        assert_eq!(placed.topic, "order.placed");
        assert!(!placed.persist);

        let raised = registry.get("InvoiceRaised").unwrap();
        assert_eq!(raised.kind, EventKind::Integration);
        assert!(raised.persist);
    }

    #[test]
    fn test_expect_unregistered_is_config_error() {
        let registry = EventRegistry::new();
        let err = registry.expect("Unknown").unwrap_err();
        assert!(matches!(err, crate::error::OutboxError::Config(_)));
    }

    #[test]
    fn test_descriptor_overrides() {
        let desc = EventDescriptor::domain("OrderPlaced", "order.placed")
            .with_persist(true)
            .with_retry(RetryPolicy {
                retry_times: 3,
                expire_after: Duration::minutes(5),
                intervals: vec![Duration::seconds(1)],
            });

        assert!(desc.persist);
        assert_eq!(desc.retry.retry_times, 3);
        assert_eq!(desc.retry.intervals.len(), 1);
    }

    #[test]
    fn test_default_policies() {
        let domain = RetryPolicy::domain_default();
        assert_eq!(domain.retry_times, 16);
        assert_eq!(domain.expire_after, Duration::minutes(30));

        let integration = RetryPolicy::integration_default();
        assert_eq!(integration.retry_times, 200);
        assert_eq!(integration.expire_after, Duration::days(1));
    }
}
