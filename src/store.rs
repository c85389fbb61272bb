//! Persistence traits and in-memory reference stores
//!
//! Stores carry the outbox: records are written in the caller's
//! transaction and later picked up by the compensation sweep. The
//! in-memory implementations back tests and single-process setups and
//! enforce optimistic versioning the way a relational backend would.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{OutboxError, Result};
use crate::record::{ArchivedEvent, ArchivedSaga, EventRecord, SagaRecord};

/// Event record persistence
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert or update; `version` must match the stored version on
    /// update and is bumped on success.
    async fn save(&self, record: &mut EventRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<EventRecord>>;

    /// Retryable records (init/delivering/exception) whose next try is
    /// at or before `max_next_try_time`, ordered by next try ascending,
    /// at most `limit`.
    async fn get_by_next_try_time(
        &self,
        svc_name: &str,
        max_next_try_time: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventRecord>>;

    /// Terminal records past `before`, candidates for archiving
    async fn get_by_expire_at(
        &self,
        svc_name: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventRecord>>;

    /// Move records into the archive then delete the originals.
    /// Archiving an already-archived id is a no-op, so a crash between
    /// the two halves is safe to replay.
    async fn migrate(&self, records: &[EventRecord]) -> Result<usize>;

    async fn archived(&self, id: Uuid) -> Result<Option<ArchivedEvent>>;
}

/// Saga record persistence
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn save(&self, record: &mut SagaRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<SagaRecord>>;

    async fn get_by_next_try_time(
        &self,
        svc_name: &str,
        max_next_try_time: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>>;

    async fn get_by_expire_at(
        &self,
        svc_name: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>>;

    async fn migrate(&self, records: &[SagaRecord]) -> Result<usize>;

    async fn archived(&self, id: Uuid) -> Result<Option<ArchivedSaga>>;
}

/// Time-partition upkeep for table-partitioned backends
#[async_trait]
pub trait PartitionMaintenance: Send + Sync {
    /// Ensure the monthly partition covering `month` exists for `table`.
    /// Backends report an existing partition with an error whose message
    /// contains "Duplicate partition".
    async fn add_partition(&self, table: &str, month: DateTime<Utc>) -> Result<()>;
}

/// In-memory event store
#[derive(Default)]
pub struct MemoryEventStore {
    records: RwLock<HashMap<Uuid, EventRecord>>,
    archive: RwLock<HashMap<Uuid, ArchivedEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-archived) records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn save(&self, record: &mut EventRecord) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get(&record.id) {
            Some(existing) if existing.version != record.version => {
                return Err(OutboxError::Conflict(format!(
                    "event {} version {} does not match stored {}",
                    record.id, record.version, existing.version
                )));
            }
            Some(_) => record.version += 1,
            None => {}
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EventRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn get_by_next_try_time(
        &self,
        svc_name: &str,
        max_next_try_time: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        let records = self.records.read().await;
        let mut due: Vec<EventRecord> = records
            .values()
            .filter(|r| {
                r.svc_name == svc_name && r.is_valid() && r.next_try_time <= max_next_try_time
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_try_time);
        due.truncate(limit);
        Ok(due)
    }

    async fn get_by_expire_at(
        &self,
        svc_name: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        let records = self.records.read().await;
        let mut expired: Vec<EventRecord> = records
            .values()
            .filter(|r| {
                r.svc_name == svc_name
                    && (r.is_delivered() || r.is_invalid())
                    && r.expire_at <= before
            })
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expire_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn migrate(&self, records: &[EventRecord]) -> Result<usize> {
        let mut archive = self.archive.write().await;
        for record in records {
            archive
                .entry(record.id)
                .or_insert_with(|| ArchivedEvent::from(record));
        }
        drop(archive);

        let mut live = self.records.write().await;
        let mut removed = 0;
        for record in records {
            if live.remove(&record.id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn archived(&self, id: Uuid) -> Result<Option<ArchivedEvent>> {
        Ok(self.archive.read().await.get(&id).cloned())
    }
}

/// In-memory saga store
#[derive(Default)]
pub struct MemorySagaStore {
    records: RwLock<HashMap<Uuid, SagaRecord>>,
    archive: RwLock<HashMap<Uuid, ArchivedSaga>>,
}

impl MemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SagaStore for MemorySagaStore {
    async fn save(&self, record: &mut SagaRecord) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get(&record.id) {
            Some(existing) if existing.version != record.version => {
                return Err(OutboxError::Conflict(format!(
                    "saga {} version {} does not match stored {}",
                    record.id, record.version, existing.version
                )));
            }
            Some(_) => record.version += 1,
            None => {}
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SagaRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn get_by_next_try_time(
        &self,
        svc_name: &str,
        max_next_try_time: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>> {
        let records = self.records.read().await;
        let mut due: Vec<SagaRecord> = records
            .values()
            .filter(|r| {
                r.svc_name == svc_name && r.is_valid() && r.next_try_time <= max_next_try_time
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_try_time);
        due.truncate(limit);
        Ok(due)
    }

    async fn get_by_expire_at(
        &self,
        svc_name: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>> {
        let records = self.records.read().await;
        let mut expired: Vec<SagaRecord> = records
            .values()
            .filter(|r| {
                r.svc_name == svc_name
                    && (r.is_executed() || r.is_invalid())
                    && r.expire_at <= before
            })
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expire_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn migrate(&self, records: &[SagaRecord]) -> Result<usize> {
        let mut archive = self.archive.write().await;
        for record in records {
            archive
                .entry(record.id)
                .or_insert_with(|| ArchivedSaga::from(record));
        }
        drop(archive);

        let mut live = self.records.write().await;
        let mut removed = 0;
        for record in records {
            if live.remove(&record.id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn archived(&self, id: Uuid) -> Result<Option<ArchivedSaga>> {
        Ok(self.archive.read().await.get(&id).cloned())
    }
}

/// In-memory partition registry
#[derive(Default)]
pub struct MemoryPartitions {
    existing: RwLock<std::collections::HashSet<String>>,
}

impl MemoryPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn partitions(&self) -> Vec<String> {
        let existing = self.existing.read().await;
        let mut names: Vec<String> = existing.iter().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PartitionMaintenance for MemoryPartitions {
    async fn add_partition(&self, table: &str, month: DateTime<Utc>) -> Result<()> {
        let name = format!("{}_{}", table, month.format("%Y%m"));
        let mut existing = self.existing.write().await;
        if !existing.insert(name.clone()) {
            return Err(OutboxError::Store(format!(
                "Duplicate partition name {name}"
            )));
        }
        Ok(())
    }
}
