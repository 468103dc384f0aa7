use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use classroom_core::config::SchedulerConfig;
use dashmap::DashMap;
use futures_util::{future::BoxFuture, FutureExt};
use rand::Rng;
use serde_json::Value;
use tokio::{
    sync::{watch, Semaphore},
    task::JoinHandle,
};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::{
    error::Result,
    schedule::{next_after, retry_backoff},
    store::JobStore,
    types::{Job, JobFilter, JobOptions, JobRequest, NewJob},
};

/// Boxed future returned by a registered handler.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;
type HandlerFn = Arc<dyn Fn(Job) -> HandlerFuture + Send + Sync>;

struct Definition {
    handler: HandlerFn,
    options: JobOptions,
    lock_lifetime: Duration,
    /// Per-name concurrency cap.
    slots: Arc<Semaphore>,
}

/// Polls the job store, claims due jobs and runs their handlers.
///
/// Cheap to clone; clones share the registry, worker pool and poll loop.
/// Create one per process and hand clones to whoever needs to schedule.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    worker_id: String,
    definitions: DashMap<String, Arc<Definition>>,
    poll_interval: Duration,
    jitter: Duration,
    batch_size: usize,
    default_lock_lifetime: Duration,
    /// Global concurrency cap across all job names.
    slots: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: watch::Sender<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, config: &SchedulerConfig) -> Self {
        let worker_id = config.worker_id.clone().unwrap_or_else(|| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("worker-{}-{}", std::process::id(), &suffix[..8])
        });
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                worker_id,
                definitions: DashMap::new(),
                poll_interval: Duration::from_secs(config.poll_interval_secs),
                jitter: Duration::from_millis(config.jitter_ms),
                batch_size: config.batch_size.max(1),
                default_lock_lifetime: Duration::from_secs(config.default_lock_lifetime_secs),
                slots: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
                tasks: TaskTracker::new(),
                shutdown,
                poller: Mutex::new(None),
            }),
        }
    }

    /// Identity this scheduler writes to `locked_by`.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// Register `handler` for jobs named `name`.
    ///
    /// Defining a name again replaces the previous handler and options; jobs
    /// already running keep the handler they started with.
    pub fn define<F, Fut>(&self, name: &str, handler: F, options: JobOptions)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |job| handler(job).boxed());
        let lock_lifetime = options
            .lock_lifetime
            .unwrap_or(self.inner.default_lock_lifetime);
        let definition = Definition {
            handler,
            slots: Arc::new(Semaphore::new(options.concurrency.max(1))),
            options,
            lock_lifetime,
        };
        let concurrency = definition.options.concurrency;
        if self
            .inner
            .definitions
            .insert(name.to_string(), Arc::new(definition))
            .is_some()
        {
            debug!(name, "job definition replaced");
        } else {
            info!(name, concurrency, lock_lifetime = ?lock_lifetime, "job defined");
        }
    }

    /// Insert a one-shot job due at `at`.
    ///
    /// No uniqueness check: scheduling the same name and payload twice
    /// produces two jobs. Use [`Scheduler::replace`] to swap a set of jobs.
    pub fn schedule(&self, at: DateTime<Utc>, name: &str, payload: Value) -> Result<Job> {
        let job = self
            .inner
            .store
            .insert(self.new_job(name, at, payload, None), Utc::now())?;
        info!(job_id = %job.id, name, next_run_at = %job.next_run_at, "job scheduled");
        Ok(job)
    }

    /// Insert or refresh the recurring job `name`, firing on `cron_expr`
    /// (seconds field first, e.g. `"0 0 3 * * *"`).
    pub fn every(&self, cron_expr: &str, name: &str, payload: Value) -> Result<Job> {
        let now = Utc::now();
        let next = next_after(cron_expr, now)?;
        let job = self.inner.store.upsert_recurring(
            self.new_job(name, next, payload, Some(cron_expr.to_string())),
            now,
        )?;
        info!(job_id = %job.id, name, cron = cron_expr, next_run_at = %job.next_run_at, "recurring job registered");
        Ok(job)
    }

    /// Delete every unclaimed job matching `filter`. Jobs already claimed by
    /// a worker run to completion. Returns the number removed.
    pub fn cancel(&self, filter: &JobFilter) -> Result<usize> {
        let removed = self.inner.store.delete(filter, Utc::now())?;
        debug!(removed, ?filter, "jobs cancelled");
        Ok(removed)
    }

    /// Cancel `filter` and insert `requests` in one atomic store operation,
    /// so the old and new sets never coexist.
    pub fn replace(&self, filter: &JobFilter, requests: Vec<JobRequest>) -> Result<Vec<Job>> {
        let jobs = requests
            .into_iter()
            .map(|r| self.new_job(&r.name, r.at, r.payload, None))
            .collect();
        let (removed, inserted) = self.inner.store.replace(filter, jobs, Utc::now())?;
        info!(removed, inserted = inserted.len(), ?filter, "jobs replaced");
        Ok(inserted)
    }

    /// Read-only query.
    pub fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.inner.store.find(filter)
    }

    /// Spawn the poll loop. Calling `start` on a running scheduler is a no-op.
    pub fn start(&self) {
        let mut poller = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if poller.is_some() {
            warn!(worker_id = %self.inner.worker_id, "scheduler already started");
            return;
        }
        self.inner.shutdown.send_replace(false);
        let shutdown = self.inner.shutdown.subscribe();
        let this = self.clone();
        let span = info_span!("scheduler", worker.id = %self.inner.worker_id);
        *poller = Some(tokio::spawn(this.run(shutdown).instrument(span)));
    }

    /// Stop polling and wait for every in-flight job to finish.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        let poller = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = poller {
            if let Err(e) = handle.await {
                warn!("scheduler poll loop panicked: {e}");
            }
        }
        self.drain().await;
        info!(worker_id = %self.inner.worker_id, "scheduler stopped");
    }

    /// Wait until no job dispatched by this scheduler is still running.
    pub async fn drain(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// One poll pass at `now`: fetch due jobs, claim what the concurrency
    /// caps admit, and spawn their handlers. Returns how many were
    /// dispatched. Must be called from within a Tokio runtime.
    ///
    /// Jobs that don't fit under a cap are left unclaimed for a later tick.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<usize> {
        if self.inner.slots.available_permits() == 0 {
            debug!("global concurrency limit reached; deferring to next tick");
            return Ok(0);
        }
        // names at their cap are left out so they can't fill the batch
        let names: Vec<String> = self
            .inner
            .definitions
            .iter()
            .filter(|entry| entry.value().slots.available_permits() > 0)
            .map(|entry| entry.key().clone())
            .collect();
        let due = self.inner.store.due(&names, now, self.inner.batch_size)?;

        let mut dispatched = 0;
        for job in due {
            let Some(definition) = self
                .inner
                .definitions
                .get(&job.name)
                .map(|d| Arc::clone(d.value()))
            else {
                continue;
            };
            let Ok(global) = Arc::clone(&self.inner.slots).try_acquire_owned() else {
                debug!("global concurrency limit reached; deferring to next tick");
                break;
            };
            let Ok(local) = Arc::clone(&definition.slots).try_acquire_owned() else {
                trace!(name = %job.name, "per-name concurrency limit reached");
                continue;
            };

            match self
                .inner
                .store
                .claim(&job.id, &self.inner.worker_id, now)
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job.id, "job claimed by another worker");
                    continue;
                }
                Err(e) => {
                    error!(job_id = %job.id, "claim failed: {e}");
                    continue;
                }
            }

            dispatched += 1;
            let inner = Arc::clone(&self.inner);
            let span = info_span!("job", job.id = %job.id, job.name = %job.name);
            self.inner.tasks.spawn(
                async move {
                    let _permits = (global, local);
                    inner.execute(job, definition).await;
                }
                .instrument(span),
            );
        }
        Ok(dispatched)
    }

    // --- private helpers ---------------------------------------------------

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval = ?self.inner.poll_interval,
            "scheduler poll loop started"
        );
        loop {
            match self.tick_at(Utc::now()) {
                Ok(0) => trace!("no due jobs"),
                Ok(n) => debug!(dispatched = n, "poll tick"),
                Err(e) => error!("scheduler tick error: {e}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.sleep_duration_with_jitter()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler poll loop stopped");
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.inner.jitter.is_zero() {
            return self.inner.poll_interval;
        }
        let jitter_millis = u64::try_from(self.inner.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.inner.poll_interval + Duration::from_millis(random_jitter)
    }

    fn new_job(
        &self,
        name: &str,
        at: DateTime<Utc>,
        payload: Value,
        repeat_cron: Option<String>,
    ) -> NewJob {
        let (options, lock_lifetime) = match self.inner.definitions.get(name) {
            Some(def) => (def.options.clone(), def.lock_lifetime),
            None => {
                debug!(name, "scheduling job with no local definition; using defaults");
                (JobOptions::default(), self.inner.default_lock_lifetime)
            }
        };
        NewJob {
            name: name.to_string(),
            payload,
            next_run_at: at,
            repeat_cron,
            priority: options.priority,
            lock_lifetime_ms: i64::try_from(lock_lifetime.as_millis()).unwrap_or(i64::MAX),
            max_retries: options.max_retries,
        }
    }
}

impl Inner {
    async fn execute(&self, job: Job, definition: Arc<Definition>) {
        debug!("running job");
        let result = AssertUnwindSafe((definition.handler)(job.clone()))
            .catch_unwind()
            .await
            .map_err(|panic| anyhow!("handler panicked: {}", panic_message(&*panic)))
            .and_then(std::convert::identity);

        let finished = Utc::now();
        // a tick may run a job ahead of the wall clock; never advance to a
        // slot at or before the one just run
        let recurrence = job
            .repeat_cron
            .as_deref()
            .map(|expr| next_after(expr, finished.max(job.next_run_at)));

        let recorded = match (result, recurrence) {
            (_, Some(Err(e))) => {
                error!("recurring job has no next run; disabling it: {e}");
                let recorded = self
                    .store
                    .fail(&job.id, &self.worker_id, finished, &e.to_string(), None);
                if let Err(e) = self.store.set_disabled(&job.id, true) {
                    error!("failed to disable job: {e}");
                }
                recorded
            }
            (Ok(()), Some(Ok(next))) => {
                info!(next_run_at = %next, "recurring job completed");
                self.store
                    .complete(&job.id, &self.worker_id, finished, Some(next))
            }
            (Ok(()), None) => {
                info!("job completed");
                self.store.complete(&job.id, &self.worker_id, finished, None)
            }
            (Err(err), Some(Ok(next))) => {
                let reason = format!("{err:#}");
                warn!(next_run_at = %next, "recurring job failed: {reason}");
                self.store
                    .fail(&job.id, &self.worker_id, finished, &reason, Some(next))
            }
            (Err(err), None) => {
                let reason = format!("{err:#}");
                let attempt = job.fail_count + 1;
                let retry_at =
                    (attempt <= job.max_retries).then(|| finished + retry_backoff(attempt));
                match retry_at {
                    Some(at) => warn!(attempt, retry_at = %at, "job failed: {reason}"),
                    None => warn!(attempt, "job failed; left for operator: {reason}"),
                }
                self.store
                    .fail(&job.id, &self.worker_id, finished, &reason, retry_at)
            }
        };

        match recorded {
            Ok(true) => {}
            Ok(false) => warn!("lock lost before the result was recorded; result discarded"),
            Err(e) => error!("failed to record job result: {e}"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteJobStore;

    fn scheduler(jitter_ms: u64) -> Scheduler {
        let config = SchedulerConfig {
            jitter_ms,
            poll_interval_secs: 2,
            ..SchedulerConfig::default()
        };
        Scheduler::new(Arc::new(SqliteJobStore::in_memory().unwrap()), &config)
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let s = scheduler(100);
        for _ in 0..50 {
            let d = s.sleep_duration_with_jitter();
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_millis(2100));
        }
        assert_eq!(scheduler(0).sleep_duration_with_jitter(), Duration::from_secs(2));
    }

    #[test]
    fn generated_worker_ids_are_unique() {
        assert_ne!(scheduler(0).worker_id(), scheduler(0).worker_id());
    }

    #[test]
    fn panic_payloads_are_readable() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(&*boxed), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*boxed), "non-string panic payload");
    }

    #[test]
    fn new_job_uses_definition_options() {
        let s = scheduler(0);
        s.define(
            "nudge",
            |_job| async { Ok(()) },
            JobOptions::default()
                .priority(crate::types::Priority::High)
                .lock_lifetime(Duration::from_secs(30))
                .max_retries(2),
        );
        let job = s.new_job("nudge", Utc::now(), Value::Null, None);
        assert_eq!(job.priority, crate::types::Priority::High);
        assert_eq!(job.lock_lifetime_ms, 30_000);
        assert_eq!(job.max_retries, 2);

        let undefined = s.new_job("other", Utc::now(), Value::Null, None);
        assert_eq!(undefined.lock_lifetime_ms, 600_000);
        assert_eq!(undefined.max_retries, 0);
    }
}
