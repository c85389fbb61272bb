//! Saga orchestration
//!
//! Handlers describe a whole saga as async code; the orchestrator wraps
//! each run in a persisted `SagaRecord` and each named step in a
//! `SagaProcess`, so a retried or resumed run replays from the handler's
//! top but skips steps that already finished.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::error::{OutboxError, Result};
use crate::record::SagaRecord;
use crate::registry::RetryPolicy;
use crate::store::SagaStore;

/// Upper bound on resume's internal catch-up loop
const RESUME_MAX_ITERATIONS: u32 = 65_535;

/// Scheduled sagas due within this many minutes start immediately
const IMMEDIATE_BEGIN_THRESHOLD_MINUTES: i64 = 2;

/// A complete saga, written as one async execution over named steps
#[async_trait]
pub trait SagaHandler: Send + Sync {
    /// Saga type tag this handler owns
    fn saga_type(&self) -> &str;

    /// Parameter type tag stamped on records
    fn param_type(&self) -> &str;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::saga_default()
    }

    /// Run the saga. Wrap each unit of compensable work in
    /// `ctx.run_step` so a later resume can skip it.
    async fn execute(&self, ctx: &SagaContext) -> Result<serde_json::Value>;
}

/// Execution context handed to a saga handler
///
/// Owns the live record behind a mutex; the step driver persists every
/// state change so progress survives a crash mid-saga.
pub struct SagaContext {
    store: Arc<dyn SagaStore>,
    record: Mutex<SagaRecord>,
}

impl SagaContext {
    fn new(store: Arc<dyn SagaStore>, record: SagaRecord) -> Self {
        Self {
            store,
            record: Mutex::new(record),
        }
    }

    pub async fn saga_id(&self) -> Uuid {
        self.record.lock().await.id
    }

    /// The saga's input parameter
    pub async fn param(&self) -> serde_json::Value {
        self.record.lock().await.param.clone()
    }

    pub async fn param_as<T: DeserializeOwned>(&self) -> Result<T> {
        let param = self.param().await;
        Ok(serde_json::from_value(param)?)
    }

    /// Run one named step at most once
    ///
    /// A step that already executed returns its stored result without
    /// invoking `op`. Otherwise the step is entered with its serialized
    /// input and saved, `op` runs on that input (with the record
    /// unlocked), and the outcome is saved before it is returned.
    /// Failures re-raise after being recorded.
    pub async fn run_step<P, T, F, Fut>(&self, code: &str, param: P, op: F) -> Result<T>
    where
        P: Serialize,
        T: Serialize + DeserializeOwned,
        F: FnOnce(P) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let now = Utc::now();
        let param_value = serde_json::to_value(&param)?;
        {
            let mut record = self.record.lock().await;
            if let Some(process) = record.process(code) {
                if process.is_executed() {
                    let stored = process.result.clone().unwrap_or(serde_json::Value::Null);
                    info!(saga_id = %record.id, step = code, "step already executed, skipping");
                    return Ok(serde_json::from_value(stored)?);
                }
            }
            record.begin_process(code, param_value, now);
            self.store.save(&mut record).await?;
        }

        match op(param).await {
            Ok(value) => {
                let serialized = serde_json::to_value(&value)?;
                let mut record = self.record.lock().await;
                record.end_process(code, Utc::now(), serialized);
                self.store.save(&mut record).await?;
                Ok(value)
            }
            Err(e) => {
                let mut record = self.record.lock().await;
                record.process_occurred_exception(code, Utc::now(), &e.to_string());
                self.store.save(&mut record).await?;
                warn!(saga_id = %record.id, step = code, error = %e, "saga step failed");
                Err(e)
            }
        }
    }

    /// Whether a named step already executed
    pub async fn is_step_executed(&self, code: &str) -> bool {
        self.record
            .lock()
            .await
            .process(code)
            .map(|p| p.is_executed())
            .unwrap_or(false)
    }

    /// Stored result of an executed step
    pub async fn step_result(&self, code: &str) -> Option<serde_json::Value> {
        self.record
            .lock()
            .await
            .process(code)
            .filter(|p| p.is_executed())
            .and_then(|p| p.result.clone())
    }

}

/// Saga lifecycle driver
pub struct SagaOrchestrator {
    store: Arc<dyn SagaStore>,
    handlers: HashMap<String, Arc<dyn SagaHandler>>,
    svc_name: String,
    pool: OnceCell<Arc<Semaphore>>,
    worker_pool_size: usize,
}

impl SagaOrchestrator {
    pub fn new(config: &OutboxConfig, store: Arc<dyn SagaStore>) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            svc_name: config.svc_name.clone(),
            pool: OnceCell::new(),
            worker_pool_size: config.worker_pool_size,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn SagaHandler>) {
        self.handlers.insert(handler.saga_type().to_string(), handler);
    }

    fn handler(&self, saga_type: &str) -> Result<&Arc<dyn SagaHandler>> {
        self.handlers
            .get(saga_type)
            .ok_or_else(|| OutboxError::Config(format!("no saga handler for {saga_type}")))
    }

    async fn pool(&self) -> Arc<Semaphore> {
        self.pool
            .get_or_init(|| async { Arc::new(Semaphore::new(self.worker_pool_size)) })
            .await
            .clone()
    }

    /// Run a saga to completion right now and return its result
    pub async fn execute(
        self: &Arc<Self>,
        saga_type: &str,
        param: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let handler = self.handler(saga_type)?;
        let now = Utc::now();
        let mut record = SagaRecord::new(
            saga_type,
            handler.param_type(),
            param,
            self.svc_name.clone(),
            &handler.retry_policy(),
            now,
        );
        if !record.begin_saga(now) {
            return Err(OutboxError::Guard(format!(
                "saga {} refused to begin",
                record.id
            )));
        }
        self.store.save(&mut record).await?;
        self.run(Arc::clone(handler), record).await
    }

    /// Persist a saga to run at `at`; near-term schedules start on the
    /// worker pool, the rest wait for the compensation sweep.
    pub async fn schedule(
        self: &Arc<Self>,
        saga_type: &str,
        param: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let handler = Arc::clone(self.handler(saga_type)?);
        let mut record = SagaRecord::new(
            saga_type,
            handler.param_type(),
            param,
            self.svc_name.clone(),
            &handler.retry_policy(),
            at,
        );
        self.store.save(&mut record).await?;
        let id = record.id;

        if at <= Utc::now() + Duration::minutes(IMMEDIATE_BEGIN_THRESHOLD_MINUTES) {
            let pool = self.pool().await;
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                let delay = (at - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                // Wait out the timer before taking a permit so sleeping
                // sagas cannot starve the pool.
                tokio::time::sleep(delay).await;
                let _permit = pool.acquire_owned().await;
                if let Err(e) = orchestrator.start_stored(id, Arc::clone(&handler)).await {
                    error!(saga_id = %id, error = %e, "scheduled saga failed");
                }
            });
        }
        Ok(id)
    }

    /// Stored result of an executed saga
    pub async fn result(&self, id: Uuid) -> Result<Option<serde_json::Value>> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| OutboxError::NotFound(format!("saga {id}")))?;
        Ok(record.result)
    }

    /// Catch a stalled saga up to the sweep window and re-run it
    ///
    /// Same loop-protection contract as event delivery resume: a record
    /// whose schedule stops advancing raises a guard error instead of
    /// spinning.
    pub async fn resume(
        self: &Arc<Self>,
        mut record: SagaRecord,
        min_next_try_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut executing = false;
        let mut iterations = 0u32;
        while record.next_try_time <= min_next_try_time {
            iterations += 1;
            if iterations > RESUME_MAX_ITERATIONS {
                return Err(OutboxError::Guard(format!(
                    "saga {} schedule is not advancing, suspected livelock",
                    record.id
                )));
            }
            if record.begin_saga(record.next_try_time) {
                executing = true;
            } else if record.is_invalid() || record.is_executed() {
                break;
            }
        }
        self.store.save(&mut record).await?;

        if executing {
            let handler = Arc::clone(self.handler(&record.saga_type)?);
            info!(
                saga_id = %record.id,
                saga_type = %record.saga_type,
                tried_times = record.tried_times,
                "resuming saga"
            );
            self.run(handler, record).await?;
        }
        Ok(())
    }

    /// Reload a stored saga and re-run it immediately
    pub async fn retry(self: &Arc<Self>, id: Uuid) -> Result<serde_json::Value> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| OutboxError::NotFound(format!("saga {id}")))?;
        let handler = Arc::clone(self.handler(&record.saga_type)?);

        // Bypass the schedule guard: a manual retry is always due
        let now = Utc::now().max(record.next_try_time);
        if !record.begin_saga(now) {
            return Err(OutboxError::Guard(format!(
                "saga {id} is no longer retryable ({:?})",
                record.state
            )));
        }
        self.store.save(&mut record).await?;
        self.run(handler, record).await
    }

    async fn start_stored(
        self: &Arc<Self>,
        id: Uuid,
        handler: Arc<dyn SagaHandler>,
    ) -> Result<()> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| OutboxError::NotFound(format!("saga {id}")))?;
        if !record.begin_saga(Utc::now().max(record.next_try_time)) {
            return Ok(());
        }
        self.store.save(&mut record).await?;
        self.run(handler, record).await.map(|_| ())
    }

    /// Drive the handler and settle the record
    async fn run(
        &self,
        handler: Arc<dyn SagaHandler>,
        record: SagaRecord,
    ) -> Result<serde_json::Value> {
        let saga_id = record.id;
        let ctx = SagaContext::new(Arc::clone(&self.store), record);

        match handler.execute(&ctx).await {
            Ok(result) => {
                let mut record = ctx.record.into_inner();
                record.end_saga(Utc::now(), result.clone());
                self.store.save(&mut record).await?;
                info!(saga_id = %saga_id, "saga executed");
                Ok(result)
            }
            Err(e) => {
                let mut record = ctx.record.into_inner();
                record.occurred_exception(Utc::now(), &e.to_string());
                self.store.save(&mut record).await?;
                warn!(saga_id = %saga_id, error = %e, "saga failed");
                Err(e)
            }
        }
    }

    /// Snapshot a stored saga record
    pub async fn get(&self, id: Uuid) -> Result<Option<SagaRecord>> {
        self.store.get(id).await
    }
}
