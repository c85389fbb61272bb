//! Saga record with per-step compensation tracking
//!
//! A `SagaRecord` shares the event record's forward-only state machine
//! but additionally tracks each named step (a `SagaProcess`) so that a
//! resumed execution can skip work that already completed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::RetryPolicy;

/// Execution state of a saga record
///
/// Numeric wire values: init=0, executing=-1, cancel=-2, expired=-3,
/// exhausted=-4, exception=-9, executed=1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaState {
    Init,
    Executing,
    Cancel,
    Expired,
    Exhausted,
    Exception,
    Executed,
}

impl SagaState {
    pub fn value(&self) -> i32 {
        match self {
            SagaState::Init => 0,
            SagaState::Executing => -1,
            SagaState::Cancel => -2,
            SagaState::Expired => -3,
            SagaState::Exhausted => -4,
            SagaState::Exception => -9,
            SagaState::Executed => 1,
        }
    }

    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(SagaState::Init),
            -1 => Some(SagaState::Executing),
            -2 => Some(SagaState::Cancel),
            -3 => Some(SagaState::Expired),
            -4 => Some(SagaState::Exhausted),
            -9 => Some(SagaState::Exception),
            1 => Some(SagaState::Executed),
            _ => None,
        }
    }
}

/// State of a single saga step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaProcessState {
    Init,
    Executing,
    Exception,
    Executed,
}

/// One named step inside a saga execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaProcess {
    /// Step code, unique within the saga
    pub process_code: String,

    /// Serialized step input
    #[serde(default)]
    pub param: Option<serde_json::Value>,

    /// Serialized step result, present once executed
    #[serde(default)]
    pub result: Option<serde_json::Value>,

    /// Last step exception, if any
    #[serde(default)]
    pub exception: Option<String>,

    pub state: SagaProcessState,

    pub begin_time: DateTime<Utc>,

    pub end_time: Option<DateTime<Utc>>,

    pub tried_times: u32,
}

impl SagaProcess {
    pub fn is_executed(&self) -> bool {
        self.state == SagaProcessState::Executed
    }
}

/// A persisted saga execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaRecord {
    pub id: Uuid,

    /// Saga type tag (handler registry key)
    pub saga_type: String,

    /// Serialized input parameter
    pub param: serde_json::Value,

    /// Parameter type tag
    pub param_type: String,

    /// Serialized final result, present once executed
    #[serde(default)]
    pub result: Option<serde_json::Value>,

    /// Owning service name
    pub svc_name: String,

    #[serde(default)]
    pub exception: Option<String>,

    pub create_at: DateTime<Utc>,

    pub expire_at: DateTime<Utc>,

    pub state: SagaState,

    pub try_times: u32,

    pub tried_times: u32,

    pub last_try_time: DateTime<Utc>,

    pub next_try_time: DateTime<Utc>,

    /// Explicit retry intervals in seconds; empty = tiered default
    #[serde(default)]
    pub retry_intervals: Vec<i64>,

    /// Step records in execution order
    #[serde(default)]
    pub processes: Vec<SagaProcess>,

    /// Optimistic-concurrency version, maintained by the store
    #[serde(default)]
    pub version: u64,
}

impl SagaRecord {
    pub fn new(
        saga_type: impl Into<String>,
        param_type: impl Into<String>,
        param: serde_json::Value,
        svc_name: impl Into<String>,
        retry: &RetryPolicy,
        schedule_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            saga_type: saga_type.into(),
            param,
            param_type: param_type.into(),
            result: None,
            svc_name: svc_name.into(),
            exception: None,
            create_at: schedule_at,
            expire_at: schedule_at + retry.expire_after,
            state: SagaState::Init,
            try_times: retry.retry_times,
            tried_times: 0,
            last_try_time: schedule_at,
            next_try_time: schedule_at,
            retry_intervals: retry.intervals.iter().map(|d| d.num_seconds()).collect(),
            processes: Vec::new(),
            version: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(
            self.state,
            SagaState::Init | SagaState::Executing | SagaState::Exception
        )
    }

    pub fn is_invalid(&self) -> bool {
        matches!(
            self.state,
            SagaState::Cancel | SagaState::Expired | SagaState::Exhausted
        )
    }

    pub fn is_executed(&self) -> bool {
        self.state == SagaState::Executed
    }

    /// Guarded transition into the executing state; mirrors the event
    /// record's delivery guard.
    pub fn begin_saga(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_valid() {
            return false;
        }
        if self.tried_times >= self.try_times {
            self.state = SagaState::Exhausted;
            return false;
        }
        if now > self.expire_at {
            self.state = SagaState::Expired;
            return false;
        }
        if self.next_try_time > now {
            return false;
        }

        self.state = SagaState::Executing;
        self.last_try_time = now;
        self.tried_times += 1;
        self.next_try_time = self.calculate_next_try_time(now);
        true
    }

    /// Terminal success with the final result; ignored once invalid
    pub fn end_saga(&mut self, _now: DateTime<Utc>, result: serde_json::Value) {
        if self.is_invalid() {
            return;
        }
        self.state = SagaState::Executed;
        self.result = Some(result);
    }

    pub fn cancel_saga(&mut self, _now: DateTime<Utc>) -> bool {
        if self.is_executed() || self.is_invalid() {
            return false;
        }
        self.state = SagaState::Cancel;
        true
    }

    /// Record a failed execution. Only the error and the exception
    /// state are written; `begin_saga` already counted the attempt.
    /// No-op once executed.
    pub fn occurred_exception(&mut self, _now: DateTime<Utc>, reason: &str) {
        if self.is_executed() {
            return;
        }
        self.state = SagaState::Exception;
        self.exception = Some(reason.to_string());
    }

    /// Step lookup by code
    pub fn process(&self, process_code: &str) -> Option<&SagaProcess> {
        self.processes.iter().find(|p| p.process_code == process_code)
    }

    /// Enter a step: reuse the existing record if present, otherwise
    /// append a fresh one. Returns false when the step already executed.
    pub fn begin_process(
        &mut self,
        process_code: &str,
        param: serde_json::Value,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(process) = self
            .processes
            .iter_mut()
            .find(|p| p.process_code == process_code)
        {
            if process.is_executed() {
                return false;
            }
            process.state = SagaProcessState::Executing;
            process.param = Some(param);
            process.begin_time = now;
            process.tried_times += 1;
            return true;
        }

        self.processes.push(SagaProcess {
            process_code: process_code.to_string(),
            param: Some(param),
            result: None,
            exception: None,
            state: SagaProcessState::Executing,
            begin_time: now,
            end_time: None,
            tried_times: 1,
        });
        true
    }

    /// Complete a step with its result
    pub fn end_process(
        &mut self,
        process_code: &str,
        now: DateTime<Utc>,
        result: serde_json::Value,
    ) {
        if let Some(process) = self
            .processes
            .iter_mut()
            .find(|p| p.process_code == process_code)
        {
            process.state = SagaProcessState::Executed;
            process.result = Some(result);
            process.end_time = Some(now);
        }
    }

    /// Record a step failure
    pub fn process_occurred_exception(
        &mut self,
        process_code: &str,
        now: DateTime<Utc>,
        reason: &str,
    ) {
        if let Some(process) = self
            .processes
            .iter_mut()
            .find(|p| p.process_code == process_code)
        {
            process.state = SagaProcessState::Exception;
            process.exception = Some(reason.to_string());
            process.end_time = Some(now);
        }
    }

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

/// Append-only archive snapshot of a terminal saga record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedSaga {
    pub id: Uuid,
    pub saga_type: String,
    pub param: serde_json::Value,
    pub param_type: String,
    pub result: Option<serde_json::Value>,
    pub svc_name: String,
    pub exception: Option<String>,
    pub create_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub state: SagaState,
    pub try_times: u32,
    pub tried_times: u32,
    pub last_try_time: DateTime<Utc>,
    pub next_try_time: DateTime<Utc>,
    pub processes: Vec<SagaProcess>,
}

impl From<&SagaRecord> for ArchivedSaga {
    fn from(record: &SagaRecord) -> Self {
        Self {
            id: record.id,
            saga_type: record.saga_type.clone(),
            param: record.param.clone(),
            param_type: record.param_type.clone(),
            result: record.result.clone(),
            svc_name: record.svc_name.clone(),
            exception: record.exception.clone(),
            create_at: record.create_at,
            expire_at: record.expire_at,
            state: record.state,
            try_times: record.try_times,
            tried_times: record.tried_times,
            last_try_time: record.last_try_time,
            next_try_time: record.next_try_time,
            processes: record.processes.clone(),
        }
    }
}
