//! Persisted record types for outbox events and saga executions

mod event;
mod saga;

pub use event::{ArchivedEvent, EventRecord, EventState};
pub use saga::{ArchivedSaga, SagaProcess, SagaProcessState, SagaRecord, SagaState};
