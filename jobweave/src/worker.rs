//! Worker loop (C4, §4.4): acquire, dispatch, heartbeat-renew, and either
//! persist a completion or reschedule with backoff.
//!
//! Grounded in `kernel/jobs/worker.rs`'s `JobWorker`: the claim-loop/
//! idle-sleep/concurrent-dispatch/heartbeat/graceful-drain shape is kept
//! verbatim, generalized from seesaw commands to this crate's
//! `Handler`/`AttemptOutcome` contract. Two outcomes are handled
//! differently, per §4.4's table: a registry-validation failure is fatal
//! and handled entirely inside [`crate::complete::complete`] (via
//! `complete_job_chain`); a handler returning its own error is this
//! module's job — reschedule with backoff (C2), never silently drop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::{backoff, jittered_sleep, LeaseConfig, RetryConfig};
use crate::complete::{AttemptOutcome, TxContext};
use crate::core::Engine;
use crate::error::{truncate_error_text, JobweaveError, StoreError};
use crate::model::Job;
use crate::observability::{job_event, DurationMetric, Event, EventType, GaugeMetric, Level, Observer};

/// Executes one job type's business logic.
///
/// Registered per type name with a [`Worker`]; the worker handles
/// acquisition, leasing, retries, and persistence around it.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, job: &Job, tx: TxContext) -> Result<AttemptOutcome, JobweaveError>;
}

/// Worker configuration (§4.2, §4.4).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Job types this worker polls and claims. A worker only ever acquires
    /// jobs of these types (§4.4: "a worker is configured with the set of
    /// type names it serves").
    pub type_names: Vec<String>,
    /// Maximum jobs this worker processes concurrently.
    pub concurrency: usize,
    pub lease: LeaseConfig,
    pub retry: RetryConfig,
    /// Fallback poll interval when no `job-scheduled` hint arrives (covers
    /// notify-fabric outages and the scheduled-in-the-future case, §5).
    pub idle_poll_interval: Duration,
    /// Jitter applied to the idle-poll wait (§4.2 `sleep(ms, {jitterMs,
    /// cancel})`), so many idle workers don't all wake on the same tick.
    pub idle_poll_jitter: Duration,
    /// How often the reaper scans for expired leases (§4.4 "lease reaper").
    pub reap_interval: Duration,
}

impl WorkerConfig {
    pub fn new(type_names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            type_names: type_names.into_iter().map(Into::into).collect(),
            concurrency: 10,
            lease: LeaseConfig::default(),
            retry: RetryConfig::default(),
            idle_poll_interval: Duration::from_secs(5),
            idle_poll_jitter: Duration::from_millis(500),
            reap_interval: Duration::from_secs(10),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// A long-running consumer of one or more job types.
pub struct Worker {
    engine: Engine,
    handlers: HashMap<String, Arc<dyn Handler>>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(engine: Engine, config: WorkerConfig) -> Self {
        Self {
            engine,
            handlers: HashMap::new(),
            config,
        }
    }

    pub fn register(mut self, type_name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(type_name.into(), handler);
        self
    }

    /// Runs the worker until `shutdown` fires, then drains in-flight jobs
    /// before returning.
    pub async fn run(self, shutdown: CancellationToken) {
        let Worker { engine, handlers, config } = self;
        let handlers = Arc::new(handlers);
        let observer = engine.observer().clone();

        tracing::info!(worker_id = %config.worker_id, types = ?config.type_names, "job worker starting");
        observer.on_event(Event::new(
            EventType::WorkerStarted,
            Level::Info,
            format!("worker {} starting ({} type(s))", config.worker_id, config.type_names.len()),
        ));

        let reaper = spawn_reaper(engine.clone(), config.reap_interval, shutdown.clone());

        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit.expect("semaphore never closed"),
            };

            match engine.store().acquire_job(&config.type_names, &config.worker_id, config.lease.lease).await {
                Ok(Some(job)) => {
                    tracing::debug!(job_id = %job.id, job_type = %job.type_name, attempt = job.attempt, "acquired job");
                    observer.on_gauge(GaugeMetric::Processing, &job.type_name, 1);
                    job_event(&observer, EventType::JobAttemptStarted, Level::Debug, "attempt started", job.id, &job.type_name);

                    let engine = engine.clone();
                    let handlers = handlers.clone();
                    let worker_id = config.worker_id.clone();
                    let lease = config.lease;
                    let retry = config.retry;
                    let observer = observer.clone();
                    let job_cancel = shutdown.child_token();

                    tasks.spawn(async move {
                        let _permit = permit;
                        process_one(engine, handlers, job, worker_id, lease, retry, observer, job_cancel).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    wait_for_work(&engine, &config, &shutdown).await;
                }
                Err(err) => {
                    drop(permit);
                    tracing::warn!(worker_id = %config.worker_id, error = %err, "failed to acquire a job");
                    observer.on_event(
                        Event::new(EventType::WorkerError, Level::Error, "failed to acquire a job").with_error(&err),
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(config.idle_poll_interval) => {}
                    }
                }
            }
        }

        observer.on_event(Event::new(
            EventType::WorkerStopped,
            Level::Info,
            format!("worker {} draining {} in-flight job(s)", config.worker_id, tasks.len()),
        ));
        while tasks.join_next().await.is_some() {}
        reaper.abort();
        tracing::info!(worker_id = %config.worker_id, "job worker stopped");
    }
}

/// Blocks until a `job-scheduled` hint for this worker's types arrives, the
/// soonest known `scheduled_at` among served types is reached, the idle poll
/// interval elapses, or shutdown fires — whichever is first (§4.4 step 1-2).
async fn wait_for_work(engine: &Engine, config: &WorkerConfig, shutdown: &CancellationToken) {
    let mut subscription = engine.notify().subscribe_job_scheduled(&config.type_names);

    let next_available = engine.store().get_next_job_available_in(&config.type_names).await.unwrap_or(None);
    let wait_for = match next_available {
        Some(delay) => delay.min(config.idle_poll_interval),
        None => config.idle_poll_interval,
    };

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = subscription.recv() => {}
        _ = jittered_sleep(wait_for, config.idle_poll_jitter, shutdown) => {}
    }
}

/// Periodically reaps expired leases, putting their jobs back to `pending`
/// and announcing both `job-scheduled` (so idle workers wake promptly) and
/// `job-ownership-lost` (for external listeners, §6.2).
fn spawn_reaper(engine: Engine, interval: Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let reaped = match engine.store().remove_expired_job_leases().await {
                Ok(reaped) => reaped,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to reap expired leases");
                    engine.observer().on_event(
                        Event::new(EventType::AdapterError, Level::Error, "failed to reap expired leases")
                            .with_error(&err),
                    );
                    continue;
                }
            };
            if reaped.is_empty() {
                continue;
            }
            tracing::debug!(count = reaped.len(), "reaped expired leases");

            let mut counts: HashMap<String, u32> = HashMap::new();
            for job in &reaped {
                *counts.entry(job.type_name.clone()).or_insert(0) += 1;
                job_event(engine.observer(), EventType::JobReaped, Level::Warn, "lease expired; job reaped", job.id, &job.type_name);
                if let Err(err) = engine.notify().notify_job_ownership_lost(job.id).await {
                    tracing::warn!(job_id = %job.id, error = %err, "ownership-lost notify failed after reap");
                    engine.observer().on_event(
                        Event::new(EventType::AdapterError, Level::Warn, "ownership-lost notify failed after reap")
                            .with_error(&err),
                    );
                }
            }
            for (type_name, count) in counts {
                if let Err(err) = engine.notify().notify_job_scheduled(&type_name, count).await {
                    tracing::warn!(type_name = %type_name, error = %err, "job-scheduled notify failed after reap");
                    engine.observer().on_event(
                        Event::new(EventType::AdapterError, Level::Warn, "job-scheduled notify failed after reap")
                            .with_error(&err),
                    );
                }
            }
        }
    })
}

/// Runs a single acquired job to its outcome: heartbeats the lease while the
/// handler runs, then either persists the completion (via C5, sharing its
/// lease-recheck and registry validation) or reschedules with backoff.
async fn process_one(
    engine: Engine,
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
    job: Job,
    worker_id: String,
    lease_cfg: LeaseConfig,
    retry_cfg: RetryConfig,
    observer: Arc<dyn Observer>,
    job_cancel: CancellationToken,
) {
    let job_id = job.id;
    let type_name = job.type_name.clone();
    let attempt_started = std::time::Instant::now();

    let heartbeat = {
        let store = engine.store().clone();
        let worker_id = worker_id.clone();
        let cancel = job_cancel.clone();
        let lease = lease_cfg.lease;
        let renew_interval = lease_cfg.renew_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew_interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = store.renew_job_lease(job_id, &worker_id, lease).await {
                            tracing::warn!(job_id = %job_id, error = %err, "lease renewal failed");
                            break;
                        }
                    }
                }
            }
        })
    };

    tracing::debug!(job_id = %job_id, job_type = %type_name, "executing job");
    let handler = handlers.get(&job.type_name).cloned();
    let attempt = match handler {
        Some(handler) => handler.handle(&job, TxContext).await,
        None => Err(JobweaveError::NotRegistered(job.type_name.clone())),
    };

    job_cancel.cancel();
    let _ = heartbeat.await;
    observer.on_duration(DurationMetric::JobAttempt, &type_name, attempt_started.elapsed());

    match attempt {
        Ok(outcome) => finalize_success(&engine, &observer, &job, &worker_id, outcome).await,
        Err(err) => reschedule_after_failure(&engine, &observer, &job, &worker_id, &retry_cfg, err).await,
    }

    observer.on_gauge(GaugeMetric::Processing, &type_name, -1);
}

async fn finalize_success(
    engine: &Engine,
    observer: &Arc<dyn Observer>,
    job: &Job,
    worker_id: &str,
    outcome: AttemptOutcome,
) {
    let job_id = job.id;
    let type_name = &job.type_name;
    let result = engine
        .complete_job_chain(job_id, worker_id, move |_tx| async move { Ok(outcome) })
        .await;

    match result {
        Ok(effect) => {
            let now = Utc::now();
            observer.on_duration(
                DurationMetric::Job,
                type_name,
                (now - job.created_at).to_std().unwrap_or_default(),
            );

            // A fatal registry-validation failure also completes the chain
            // with no output and no child (§4.4); distinguish it from a
            // genuine successful output by the absence of both.
            let registry_rejected = effect.chain_completed && effect.tail.output.is_none();
            if registry_rejected {
                tracing::warn!(job_id = %job_id, job_type = %type_name, error = ?effect.tail.last_attempt_error, "job completed with a fatal registry error");
                job_event(observer, EventType::JobFailed, Level::Warn, "job completed with a fatal registry error", job_id, type_name);
            } else {
                tracing::info!(job_id = %job_id, job_type = %type_name, "job succeeded");
                job_event(observer, EventType::JobCompleted, Level::Info, "job completed", job_id, type_name);
            }
            if effect.chain_completed {
                job_event(
                    observer,
                    EventType::ChainCompleted,
                    Level::Info,
                    "chain completed",
                    effect.tail.chain_id,
                    &effect.tail.chain_type_name,
                );
                if let Ok(Some(chain)) = engine.store().get_job_chain_by_id(effect.tail.chain_id).await {
                    observer.on_duration(
                        DurationMetric::JobChain,
                        &effect.tail.chain_type_name,
                        (now - chain.root.created_at).to_std().unwrap_or_default(),
                    );
                }
            }
        }
        Err(JobweaveError::LeaseLost { .. }) => {
            job_event(observer, EventType::LeaseLost, Level::Warn, "lease lost before completion could be persisted", job_id, type_name);
        }
        Err(err) => {
            tracing::error!(job_id = %job_id, error = %err, "failed to persist job completion");
            observer.on_event(
                Event::new(EventType::AdapterError, Level::Error, "failed to persist job completion")
                    .with_data(serde_json::json!({"job_id": job_id, "type_name": type_name}))
                    .with_error(&err),
            );
        }
    }
}

async fn reschedule_after_failure(
    engine: &Engine,
    observer: &Arc<dyn Observer>,
    job: &Job,
    worker_id: &str,
    retry_cfg: &RetryConfig,
    err: JobweaveError,
) {
    let scheduled_at = Utc::now()
        + chrono::Duration::from_std(backoff(job.attempt, retry_cfg)).unwrap_or(chrono::Duration::zero());
    let detail = truncate_error_text(&err.to_string());

    match engine.store().reschedule_job(job.id, worker_id, scheduled_at, Some(detail)).await {
        Ok(()) => {
            tracing::warn!(job_id = %job.id, job_type = %job.type_name, error = %err, "job failed; rescheduled");
            job_event(observer, EventType::JobFailed, Level::Warn, "handler failed; rescheduled", job.id, &job.type_name);
        }
        Err(StoreError::Conflict) => {
            job_event(observer, EventType::LeaseLost, Level::Warn, "lease already lost; could not reschedule", job.id, &job.type_name);
        }
        Err(backend_err) => {
            tracing::error!(job_id = %job.id, error = %backend_err, "failed to reschedule job after handler error");
            observer.on_event(
                Event::new(EventType::AdapterError, Level::Error, "failed to reschedule job after handler error")
                    .with_data(serde_json::json!({"job_id": job.id, "type_name": job.type_name}))
                    .with_error(&backend_err),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Engine, StartJobChainParams, WaitOptions};
    use crate::mem::{MemNotify, MemStore};
    use crate::registry::{JobTypeDef, TypeRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, job: &Job, _tx: TxContext) -> Result<AttemptOutcome, JobweaveError> {
            Ok(AttemptOutcome::Output(job.input.clone()))
        }
    }

    struct FlakyHandler {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Handler for FlakyHandler {
        async fn handle(&self, _job: &Job, _tx: TxContext) -> Result<AttemptOutcome, JobweaveError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(JobweaveError::HandlerFailed("transient failure".to_string()))
            } else {
                Ok(AttemptOutcome::Output(serde_json::json!({"ok": true})))
            }
        }
    }

    fn test_engine(type_name: &str) -> Engine {
        let mut registry = TypeRegistry::new();
        registry.register(JobTypeDef::new(type_name).entry());
        Engine::new(Arc::new(MemStore::new()), Arc::new(MemNotify::new()), registry)
    }

    #[tokio::test]
    async fn worker_completes_a_job_and_the_chain_resolves() {
        let engine = test_engine("greet");
        let started = engine
            .start_job_chain(
                StartJobChainParams::builder()
                    .type_name("greet")
                    .input(serde_json::json!({"name": "World"}))
                    .build(),
            )
            .await
            .unwrap();

        let worker = Worker::new(engine.clone(), WorkerConfig::new(["greet"]).with_concurrency(2))
            .register("greet", Arc::new(EchoHandler));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        let chain = engine
            .wait_for_job_chain_completion(
                started.chain.chain_id(),
                WaitOptions {
                    timeout: Duration::from_secs(5),
                    poll_interval: Duration::from_millis(20),
                    cancel: CancellationToken::new(),
                },
            )
            .await
            .unwrap();

        assert!(chain.is_completed());
        assert_eq!(chain.tail.output, Some(serde_json::json!({"name": "World"})));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn worker_reschedules_after_a_handler_error_and_succeeds_on_retry() {
        let engine = test_engine("flaky");
        let mut config = WorkerConfig::new(["flaky"]);
        config.retry = RetryConfig {
            initial: Duration::from_millis(5),
            multiplier: 2.0,
            max: Duration::from_millis(50),
        };
        config.idle_poll_interval = Duration::from_millis(20);

        let started = engine
            .start_job_chain(
                StartJobChainParams::builder()
                    .type_name("flaky")
                    .input(serde_json::json!({}))
                    .build(),
            )
            .await
            .unwrap();

        let worker = Worker::new(engine.clone(), config).register(
            "flaky",
            Arc::new(FlakyHandler {
                attempts: AtomicUsize::new(0),
            }),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        let chain = engine
            .wait_for_job_chain_completion(
                started.chain.chain_id(),
                WaitOptions {
                    timeout: Duration::from_secs(5),
                    poll_interval: Duration::from_millis(20),
                    cancel: CancellationToken::new(),
                },
            )
            .await
            .unwrap();

        assert!(chain.is_completed());
        assert!(chain.tail.attempt >= 2);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
