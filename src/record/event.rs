//! Event record and its delivery state machine
//!
//! An `EventRecord` is the persisted unit the engine delivers at least
//! once. State transitions only move forward: once a record is delivered,
//! cancelled, expired, or exhausted it never becomes retryable again.

use crate::registry::EventDescriptor;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery state of an event record
///
/// Numeric wire values (for store backends that persist integers):
/// init=0, delivering=-1, cancel=-2, expired=-3, exhausted=-4,
/// exception=-9, delivered=1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    /// Created, not yet attempted
    Init,
    /// An attempt is in flight
    Delivering,
    /// Withdrawn before delivery
    Cancel,
    /// Expiry time passed without success
    Expired,
    /// Retry budget used up
    Exhausted,
    /// Last attempt failed; eligible for retry
    Exception,
    /// Delivered successfully
    Delivered,
}

impl EventState {
    /// Numeric wire value
    pub fn value(&self) -> i32 {
        match self {
            EventState::Init => 0,
            EventState::Delivering => -1,
            EventState::Cancel => -2,
            EventState::Expired => -3,
            EventState::Exhausted => -4,
            EventState::Exception => -9,
            EventState::Delivered => 1,
        }
    }

    /// Parse a numeric wire value
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(EventState::Init),
            -1 => Some(EventState::Delivering),
            -2 => Some(EventState::Cancel),
            -3 => Some(EventState::Expired),
            -4 => Some(EventState::Exhausted),
            -9 => Some(EventState::Exception),
            1 => Some(EventState::Delivered),
            _ => None,
        }
    }
}

/// A single outbox event record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Record identity
    pub id: Uuid,

    /// Topic the record is published under
    pub event_type: String,

    /// Payload type tag (registry key)
    pub payload_type: String,

    /// Serialized payload
    pub payload: serde_json::Value,

    /// Owning service name
    pub svc_name: String,

    /// Last delivery exception, if any
    #[serde(default)]
    pub exception: Option<String>,

    /// Creation / schedule time
    pub create_at: DateTime<Utc>,

    /// Expiry time
    pub expire_at: DateTime<Utc>,

    /// Delivery state
    pub state: EventState,

    /// Maximum delivery attempts
    pub try_times: u32,

    /// Attempts made so far
    pub tried_times: u32,

    /// Last attempt time
    pub last_try_time: DateTime<Utc>,

    /// Next attempt time
    pub next_try_time: DateTime<Utc>,

    /// Explicit retry intervals in seconds; empty = tiered default
    #[serde(default)]
    pub retry_intervals: Vec<i64>,

    /// Optimistic-concurrency version, maintained by the store
    #[serde(default)]
    pub version: u64,

    /// Whether the record must be persisted (not part of the stored shape)
    #[serde(skip)]
    persist: bool,
}

impl EventRecord {
    /// Create a record for a registered payload type
    ///
    /// The first attempt is accounted for at creation: `tried_times`
    /// starts at 1 and `next_try_time` points at the first retry slot.
    pub fn new(
        descriptor: &EventDescriptor,
        payload: serde_json::Value,
        svc_name: impl Into<String>,
        schedule_at: DateTime<Utc>,
    ) -> Self {
        let mut record = Self {
            id: Uuid::new_v4(),
            event_type: descriptor.topic.clone(),
            payload_type: descriptor.payload_type.clone(),
            payload,
            svc_name: svc_name.into(),
            exception: None,
            create_at: schedule_at,
            expire_at: schedule_at + descriptor.retry.expire_after,
            state: EventState::Init,
            try_times: descriptor.retry.retry_times,
            tried_times: 1,
            last_try_time: schedule_at,
            next_try_time: schedule_at,
            retry_intervals: descriptor
                .retry
                .intervals
                .iter()
                .map(|d| d.num_seconds())
                .collect(),
            version: 0,
            persist: false,
        };
        record.next_try_time = record.calculate_next_try_time(schedule_at);
        record
    }

    /// Still eligible for delivery attempts
    pub fn is_valid(&self) -> bool {
        matches!(
            self.state,
            EventState::Init | EventState::Delivering | EventState::Exception
        )
    }

    /// Terminally out of the delivery cycle without success
    pub fn is_invalid(&self) -> bool {
        matches!(
            self.state,
            EventState::Cancel | EventState::Expired | EventState::Exhausted
        )
    }

    pub fn is_delivered(&self) -> bool {
        self.state == EventState::Delivered
    }

    /// Mark whether the record must be persisted
    pub fn mark_persist(&mut self, persist: bool) {
        self.persist = persist;
    }

    pub fn is_persist(&self) -> bool {
        self.persist
    }

    /// Guarded transition into the delivering state
    ///
    /// Returns false without entering delivery when the record is
    /// terminal, out of tries (moves to exhausted), past expiry (moves to
    /// expired), or not yet due. On success the attempt is accounted:
    /// `tried_times` advances and `next_try_time` is recomputed.
    pub fn begin_delivery(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_valid() {
            return false;
        }
        if self.tried_times >= self.try_times {
            self.state = EventState::Exhausted;
            return false;
        }
        if now > self.expire_at {
            self.state = EventState::Expired;
            return false;
        }
        if self.next_try_time > now {
            return false;
        }

        self.state = EventState::Delivering;
        self.last_try_time = now;
        self.tried_times += 1;
        self.next_try_time = self.calculate_next_try_time(now);
        true
    }

    /// Terminal success; ignored when the record is already invalid
    pub fn confirm_delivery(&mut self, _now: DateTime<Utc>) {
        if self.is_invalid() {
            return;
        }
        self.state = EventState::Delivered;
    }

    /// Withdraw before delivery; fails once delivered or invalid
    pub fn cancel_delivery(&mut self, _now: DateTime<Utc>) -> bool {
        if self.is_delivered() || self.is_invalid() {
            return false;
        }
        self.state = EventState::Cancel;
        true
    }

    /// Record a failed attempt. Only the error and the exception state
    /// are written; the attempt itself was already counted by the
    /// `begin_delivery` that entered it. No-op once delivered.
    pub fn occurred_exception(&mut self, _now: DateTime<Utc>, reason: &str) {
        if self.is_delivered() {
            return;
        }
        self.state = EventState::Exception;
        self.exception = Some(reason.to_string());
    }

    /// Next retry slot after `now`, from the explicit interval table or
    /// the tiered default (1m / 5m / 10m)
    fn calculate_next_try_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.retry_intervals.is_empty() {
            return match self.tried_times {
                0..=10 => now + Duration::minutes(1),
                11..=20 => now + Duration::minutes(5),
                _ => now + Duration::minutes(10),
            };
        }

        let index = (self.tried_times.saturating_sub(1) as usize)
            .min(self.retry_intervals.len() - 1);
        now + Duration::seconds(self.retry_intervals[index])
    }
}

/// Append-only archive snapshot of a terminal event record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload_type: String,
    pub payload: serde_json::Value,
    pub svc_name: String,
    pub exception: Option<String>,
    pub create_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub state: EventState,
    pub try_times: u32,
    pub tried_times: u32,
    pub last_try_time: DateTime<Utc>,
    pub next_try_time: DateTime<Utc>,
}

impl From<&EventRecord> for ArchivedEvent {
    fn from(record: &EventRecord) -> Self {
        Self {
            id: record.id,
            event_type: record.event_type.clone(),
            payload_type: record.payload_type.clone(),
            payload: record.payload.clone(),
            svc_name: record.svc_name.clone(),
            exception: record.exception.clone(),
            create_at: record.create_at,
            expire_at: record.expire_at,
            state: record.state,
            try_times: record.try_times,
            tried_times: record.tried_times,
            last_try_time: record.last_try_time,
            next_try_time: record.next_try_time,
        }
    }
}
