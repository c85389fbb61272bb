//! Configuration surface
//!
//! Plain structs with defaults matching a small deployment. Embedders
//! build these from their own config layer.

use std::time::Duration;

/// Publisher settings
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Service name stamped on every record
    pub svc_name: String,

    /// Workers for deferred delivery and scheduled sagas
    pub worker_pool_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            svc_name: "default".to_string(),
            worker_pool_size: 4,
        }
    }
}

/// Compensation, archiving, and partition upkeep settings
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Records fetched per compensation cycle
    pub compense_batch_size: usize,

    /// Concurrent resumes within one cycle
    pub compense_max_concurrency: usize,

    /// How far ahead of `now` a record may be picked up
    pub compense_interval: Duration,

    /// Maximum hold on the compensation lock
    pub compense_lock_duration: Duration,

    /// Compensation lock key base; the schedule service appends the
    /// service name so deployments sharing a locker do not contend
    pub compense_lock_key: String,

    /// Records archived per batch
    pub archive_batch_size: usize,

    /// How long terminal records stay in the live table
    pub archive_retention_days: i64,

    /// Maximum hold on the archive lock
    pub archive_lock_duration: Duration,

    /// Archive lock key base, suffixed like the compensation key
    pub archive_lock_key: String,

    /// Whether monthly partition upkeep runs
    pub add_partition_enabled: bool,
}

impl ScheduleConfig {
    /// Defaults for the saga-side schedule service; the saga duties
    /// lock under their own keys so they never contend with the event
    /// sweeps.
    pub fn for_sagas() -> Self {
        Self {
            compense_lock_key: "saga_compense".to_string(),
            archive_lock_key: "saga_archive".to_string(),
            ..Self::default()
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            compense_batch_size: 10,
            compense_max_concurrency: 10,
            compense_interval: Duration::from_secs(60),
            compense_lock_duration: Duration::from_secs(30),
            compense_lock_key: "event_compense".to_string(),
            archive_batch_size: 100,
            archive_retention_days: 7,
            archive_lock_duration: Duration::from_secs(172_800),
            archive_lock_key: "event_archive".to_string(),
            add_partition_enabled: true,
        }
    }
}
