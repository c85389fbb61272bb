//! Background duties: compensation, archiving, partition upkeep
//!
//! Each duty is a single sweep meant to be driven by the embedder's
//! timer. Sweeps are guarded twice: an in-process flag stops overlapping
//! runs inside one process, and a distributed lock stops overlapping
//! runs across the fleet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Datelike, Duration, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ScheduleConfig;
use crate::error::Result;
use crate::lock::Locker;
use crate::publisher::Publisher;
use crate::saga::SagaOrchestrator;
use crate::store::{EventStore, PartitionMaintenance, SagaStore};

const MAX_CONSECUTIVE_ARCHIVE_FAILURES: u32 = 3;

/// Event-side background duties
pub struct EventScheduleService {
    svc_name: String,
    store: Arc<dyn EventStore>,
    publisher: Arc<Publisher>,
    locker: Arc<dyn Locker>,
    partitions: Option<Arc<dyn PartitionMaintenance>>,
    config: ScheduleConfig,
    compense_lock_key: String,
    archive_lock_key: String,
    compensing: AtomicBool,
}

impl EventScheduleService {
    pub fn new(
        svc_name: impl Into<String>,
        store: Arc<dyn EventStore>,
        publisher: Arc<Publisher>,
        locker: Arc<dyn Locker>,
        partitions: Option<Arc<dyn PartitionMaintenance>>,
        config: ScheduleConfig,
    ) -> Self {
        let svc_name = svc_name.into();
        // Locks are scoped per service so fleets sharing one locker
        // only contend within their own deployment.
        let compense_lock_key = format!("{}[{}]", config.compense_lock_key, svc_name);
        let archive_lock_key = format!("{}[{}]", config.archive_lock_key, svc_name);
        Self {
            svc_name,
            store,
            publisher,
            locker,
            partitions,
            config,
            compense_lock_key,
            archive_lock_key,
            compensing: AtomicBool::new(false),
        }
    }

    /// One compensation sweep: pick up stalled records and re-drive
    /// their delivery. Returns the number of records resumed; zero when
    /// the sweep was skipped.
    pub async fn compense(&self) -> Result<usize> {
        if self.compensing.swap(true, Ordering::SeqCst) {
            debug!("compensation already running, skipping");
            return Ok(0);
        }
        let outcome = self.compense_inner().await;
        self.compensing.store(false, Ordering::SeqCst);
        outcome
    }

    async fn compense_inner(&self) -> Result<usize> {
        let token = Uuid::new_v4().to_string();
        let key = &self.compense_lock_key;
        let mut resumed = 0usize;

        loop {
            if !self
                .locker
                .acquire(key, &token, self.config.compense_lock_duration)
                .await
            {
                debug!(key = %key, "compensation lock held elsewhere, skipping cycle");
                break;
            }

            let now = Utc::now();
            let window = now + Duration::from_std(self.config.compense_interval).unwrap_or_else(|_| Duration::zero());
            let batch = self
                .store
                .get_by_next_try_time(&self.svc_name, window, self.config.compense_batch_size)
                .await;

            let records = match batch {
                Ok(records) => records,
                Err(e) => {
                    error!(error = %e, "compensation fetch failed");
                    self.locker.release(key, &token).await;
                    return Err(e);
                }
            };
            let fetched = records.len();

            // Failures stay on their own record; the sweep moves on
            stream::iter(records)
                .for_each_concurrent(self.config.compense_max_concurrency, |record| {
                    let publisher = Arc::clone(&self.publisher);
                    async move {
                        let id = record.id;
                        if let Err(e) = publisher.resume(record, window).await {
                            warn!(event_id = %id, error = %e, "compensation resume failed");
                        }
                    }
                })
                .await;

            resumed += fetched;
            self.locker.release(key, &token).await;

            if fetched < self.config.compense_batch_size {
                break;
            }
        }

        if resumed > 0 {
            info!(resumed, "event compensation cycle done");
        }
        Ok(resumed)
    }

    /// Move terminal records older than the retention window into the
    /// archive. Returns the number archived.
    pub async fn archive(&self) -> Result<usize> {
        let token = Uuid::new_v4().to_string();
        let key = &self.archive_lock_key;
        let cutoff = Utc::now() - Duration::days(self.config.archive_retention_days);
        let mut archived = 0usize;
        let mut failures = 0u32;

        loop {
            if !self
                .locker
                .acquire(key, &token, self.config.archive_lock_duration)
                .await
            {
                debug!(key = %key, "archive lock held elsewhere, skipping cycle");
                break;
            }

            let outcome = async {
                let records = self
                    .store
                    .get_by_expire_at(&self.svc_name, cutoff, self.config.archive_batch_size)
                    .await?;
                if records.is_empty() {
                    return Ok(0);
                }
                self.store.migrate(&records).await
            }
            .await;

            self.locker.release(key, &token).await;

            match outcome {
                Ok(0) => break,
                Ok(n) => {
                    archived += n;
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    error!(error = %e, failures, "event archive batch failed");
                    if failures >= MAX_CONSECUTIVE_ARCHIVE_FAILURES {
                        break;
                    }
                }
            }
        }

        if archived > 0 {
            info!(archived, "event archive cycle done");
        }
        Ok(archived)
    }

    /// Make sure this month's and next month's partitions exist
    pub async fn add_partitions(&self) -> Result<()> {
        let Some(partitions) = &self.partitions else {
            return Ok(());
        };
        if !self.config.add_partition_enabled {
            return Ok(());
        }
        for table in ["event", "archived_event"] {
            add_monthly_partitions(partitions.as_ref(), table).await;
        }
        Ok(())
    }
}

/// Saga-side background duties; mirrors the event service
pub struct SagaScheduleService {
    svc_name: String,
    store: Arc<dyn SagaStore>,
    orchestrator: Arc<SagaOrchestrator>,
    locker: Arc<dyn Locker>,
    partitions: Option<Arc<dyn PartitionMaintenance>>,
    config: ScheduleConfig,
    compense_lock_key: String,
    archive_lock_key: String,
    compensing: AtomicBool,
}

impl SagaScheduleService {
    /// Construct with `ScheduleConfig::for_sagas()` unless the lock key
    /// bases were set explicitly; the saga duties must not share keys
    /// with the event service.
    pub fn new(
        svc_name: impl Into<String>,
        store: Arc<dyn SagaStore>,
        orchestrator: Arc<SagaOrchestrator>,
        locker: Arc<dyn Locker>,
        partitions: Option<Arc<dyn PartitionMaintenance>>,
        config: ScheduleConfig,
    ) -> Self {
        let svc_name = svc_name.into();
        let compense_lock_key = format!("{}[{}]", config.compense_lock_key, svc_name);
        let archive_lock_key = format!("{}[{}]", config.archive_lock_key, svc_name);
        Self {
            svc_name,
            store,
            orchestrator,
            locker,
            partitions,
            config,
            compense_lock_key,
            archive_lock_key,
            compensing: AtomicBool::new(false),
        }
    }

    pub async fn compense(&self) -> Result<usize> {
        if self.compensing.swap(true, Ordering::SeqCst) {
            debug!("saga compensation already running, skipping");
            return Ok(0);
        }
        let outcome = self.compense_inner().await;
        self.compensing.store(false, Ordering::SeqCst);
        outcome
    }

    async fn compense_inner(&self) -> Result<usize> {
        let token = Uuid::new_v4().to_string();
        let key = &self.compense_lock_key;
        let mut resumed = 0usize;

        loop {
            if !self
                .locker
                .acquire(key, &token, self.config.compense_lock_duration)
                .await
            {
                debug!(key = %key, "saga compensation lock held elsewhere, skipping cycle");
                break;
            }

            let now = Utc::now();
            let window = now + Duration::from_std(self.config.compense_interval).unwrap_or_else(|_| Duration::zero());
            let batch = self
                .store
                .get_by_next_try_time(&self.svc_name, window, self.config.compense_batch_size)
                .await;

            let records = match batch {
                Ok(records) => records,
                Err(e) => {
                    error!(error = %e, "saga compensation fetch failed");
                    self.locker.release(key, &token).await;
                    return Err(e);
                }
            };
            let fetched = records.len();

            stream::iter(records)
                .for_each_concurrent(self.config.compense_max_concurrency, |record| {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    async move {
                        let id = record.id;
                        if let Err(e) = orchestrator.resume(record, window).await {
                            warn!(saga_id = %id, error = %e, "saga compensation resume failed");
                        }
                    }
                })
                .await;

            resumed += fetched;
            self.locker.release(key, &token).await;

            if fetched < self.config.compense_batch_size {
                break;
            }
        }

        if resumed > 0 {
            info!(resumed, "saga compensation cycle done");
        }
        Ok(resumed)
    }

    pub async fn archive(&self) -> Result<usize> {
        let token = Uuid::new_v4().to_string();
        let key = &self.archive_lock_key;
        let cutoff = Utc::now() - Duration::days(self.config.archive_retention_days);
        let mut archived = 0usize;
        let mut failures = 0u32;

        loop {
            if !self
                .locker
                .acquire(key, &token, self.config.archive_lock_duration)
                .await
            {
                debug!(key = %key, "saga archive lock held elsewhere, skipping cycle");
                break;
            }

            let outcome = async {
                let records = self
                    .store
                    .get_by_expire_at(&self.svc_name, cutoff, self.config.archive_batch_size)
                    .await?;
                if records.is_empty() {
                    return Ok(0);
                }
                self.store.migrate(&records).await
            }
            .await;

            self.locker.release(key, &token).await;

            match outcome {
                Ok(0) => break,
                Ok(n) => {
                    archived += n;
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    error!(error = %e, failures, "saga archive batch failed");
                    if failures >= MAX_CONSECUTIVE_ARCHIVE_FAILURES {
                        break;
                    }
                }
            }
        }

        if archived > 0 {
            info!(archived, "saga archive cycle done");
        }
        Ok(archived)
    }

    pub async fn add_partitions(&self) -> Result<()> {
        let Some(partitions) = &self.partitions else {
            return Ok(());
        };
        if !self.config.add_partition_enabled {
            return Ok(());
        }
        for table in ["saga", "archived_saga"] {
            add_monthly_partitions(partitions.as_ref(), table).await;
        }
        Ok(())
    }
}

/// Ensure the partitions for this month and the next exist; existing
/// partitions are reported as "Duplicate partition" and swallowed.
async fn add_monthly_partitions(partitions: &dyn PartitionMaintenance, table: &str) {
    let now = Utc::now();
    for offset in 0..2 {
        let month0 = now.month0() as i32 + offset;
        let year = now.year() + month0 / 12;
        let month = (month0 % 12) as u32 + 1;
        let Some(start) = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single() else {
            continue;
        };
        if let Err(e) = partitions.add_partition(table, start).await {
            let message = e.to_string();
            if message.contains("Duplicate partition") {
                continue;
            }
            error!(table, error = %message, "partition upkeep failed");
        }
    }
}
