//! # tx-outbox
//!
//! Transactional outbox and saga compensation engine with at-least-once
//! delivery.
//!
//! ## Overview
//!
//! `tx-outbox` turns "publish an event" and "run a multi-step saga" into
//! persisted records that survive crashes. Events raised during a unit of
//! work are staged in an [`EventBuffer`] and only become records when the
//! caller releases the buffer after its commit; a background compensation
//! sweep re-drives anything that stalled, and an archive sweep moves
//! finished records out of the live table.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tx_outbox::{
//!     EventBuffer, EventDescriptor, EventRegistry, InterceptorChain,
//!     MemoryEventStore, OutboxConfig, Publisher, SubscriberRegistry,
//! };
//!
//! # async fn example() -> tx_outbox::Result<()> {
//! let mut registry = EventRegistry::new();
//! registry.register(EventDescriptor::domain("OrderPlaced", "order.placed"));
//! let registry = Arc::new(registry);
//!
//! let store = Arc::new(MemoryEventStore::new());
//! let interceptors = Arc::new(InterceptorChain::new());
//! let publisher = Arc::new(Publisher::new(
//!     &OutboxConfig::default(),
//!     Arc::clone(&registry),
//!     store.clone(),
//!     Arc::new(SubscriberRegistry::new()),
//!     Arc::clone(&interceptors),
//!     Vec::new(),
//! ));
//!
//! // One buffer per unit of work
//! let mut buffer = EventBuffer::new(registry, store, interceptors, "order-service");
//! buffer.attach_to_entity(
//!     "OrderPlaced",
//!     serde_json::json!({"orderId": "O1"}),
//!     "order-O1",
//!     chrono::Utc::now(),
//! )?;
//!
//! // After the transaction commits:
//! let released = buffer.release(&["order-O1"], &publisher).await?;
//! println!("released {} event(s)", released.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **EventRegistry** — payload types, kinds, and retry policies
//! - **EventBuffer** — per-unit-of-work staging, released after commit
//! - **Publisher** — interceptors, local subscribers, transport fan-out
//! - **SagaOrchestrator** — persisted sagas with idempotent named steps
//! - **EventScheduleService / SagaScheduleService** — compensation,
//!   archiving, partition upkeep
//! - **Locker / ReentrantCall** — distributed mutual exclusion

pub mod buffer;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod lock;
pub mod publisher;
pub mod record;
pub mod reentrant;
pub mod registry;
pub mod saga;
pub mod schedule;
pub mod store;
pub mod subscriber;

// Re-export core types
pub use buffer::EventBuffer;
pub use config::{OutboxConfig, ScheduleConfig};
pub use error::{OutboxError, Result};
pub use interceptor::{EventInterceptor, InterceptorChain, MessageInterceptor};
pub use lock::{Locker, MemoryLocker};
pub use publisher::{PublishCallback, Publisher, StoreCallback, TransportPublisher};
pub use record::{
    ArchivedEvent, ArchivedSaga, EventRecord, EventState, SagaProcess, SagaProcessState,
    SagaRecord, SagaState,
};
pub use reentrant::{ReentrantCall, ReentrantOptions};
pub use registry::{EventDescriptor, EventKind, EventRegistry, RetryPolicy};
pub use saga::{SagaContext, SagaHandler, SagaOrchestrator};
pub use schedule::{EventScheduleService, SagaScheduleService};
pub use store::{
    EventStore, MemoryEventStore, MemoryPartitions, MemorySagaStore, PartitionMaintenance,
    SagaStore,
};
pub use subscriber::{LocalSubscriber, SubscriberRegistry};
