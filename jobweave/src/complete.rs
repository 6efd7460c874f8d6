//! Completion hook (C5, §4.5): the "commit alongside user work" primitive.
//!
//! This is what makes "user side effect + job completion" exactly-once
//! within the store's transactional boundary: the job is re-read under
//! lock, the caller's closure runs, its result is validated against the
//! registry, and only then is the completion persisted. A `LeaseLost`
//! before the closure runs means the closure never executes at all — the
//! same guarantee `seesaw::persistence::PersistentMachine` gives a command
//! handler that loses its optimistic-concurrency race before its effect runs.

use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{JobweaveError, StoreError};
use crate::model::Job;
use crate::notify_context::NotifyContext;
use crate::observability::{job_event, EventType, Level, Observer};
use crate::registry::TypeRegistry;
use crate::store::{Completion, CompletionEffect, Store};

/// Opaque handle passed to the user closure given to [`complete`].
///
/// A concrete `txContext` is adapter-specific and out of scope here (§6.1);
/// this marker exists so the closure signature has somewhere to receive it
/// once a concrete adapter wants to thread one through.
#[derive(Debug, Clone, Copy)]
pub struct TxContext;

/// What the user closure handed to [`complete`] produces: either a
/// registry-checked terminal output, or a continuation descriptor. Fatal
/// registry failures are handled by `complete` itself, not by the closure.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Output(serde_json::Value),
    Continuation { type_name: String, input: serde_json::Value },
}

/// Runs the completion hook for `job`, owned by `worker_id`.
///
/// 1. Re-reads the job; aborts with [`JobweaveError::LeaseLost`] if it is no
///    longer `running` under `worker_id` — `user_fn` is never called.
/// 2. Calls `user_fn(&TxContext)`.
/// 3. Validates the result against the registry. A fatal registry error
///    (`OUTPUT_REQUIRED`, `INVALID_OUTPUT`, a disallowed continuation
///    target) completes the job with an error record rather than
///    propagating — per §4.4, these are never rescheduled.
/// 4. Persists the completion (and any continuation) via the store.
/// 5. Queues post-commit notifications on `notify_ctx` (flushed by the
///    caller's enclosing `with_notify_context`, per C6).
/// 6. Reports the fact to `observer`: a `BlockerResolved` event for each
///    job this completion unblocked, and a `JobCreated` event if a
///    continuation child was created (§4.7).
pub async fn complete<F, Fut>(
    store: &dyn Store,
    registry: &TypeRegistry,
    notify_ctx: &NotifyContext,
    observer: &Arc<dyn Observer>,
    job: &Job,
    worker_id: &str,
    user_fn: F,
) -> Result<CompletionEffect, JobweaveError>
where
    F: FnOnce(TxContext) -> Fut,
    Fut: Future<Output = Result<AttemptOutcome, JobweaveError>>,
{
    let current = store
        .get_job_by_id(job.id)
        .await?
        .ok_or(JobweaveError::LeaseLost { job_id: job.id })?;
    if !current.is_leased_by(worker_id) {
        return Err(JobweaveError::LeaseLost { job_id: job.id });
    }

    let outcome = user_fn(TxContext).await?;

    let completion = match validate(registry, &current.type_name, outcome) {
        Ok(completion) => completion,
        Err(registry_err) if registry_err.code.is_fatal_attempt_error() => {
            Completion::Error(registry_err.to_string())
        }
        Err(registry_err) => return Err(registry_err.into()),
    };

    let effect = store
        .complete_job(job.id, worker_id, completion)
        .await
        .map_err(|err| match err {
            StoreError::Conflict => JobweaveError::LeaseLost { job_id: job.id },
            other => JobweaveError::Store(other),
        })?;

    queue_notifications(notify_ctx, current.chain_id, &effect);
    report_events(observer, &effect);
    Ok(effect)
}

fn report_events(observer: &Arc<dyn Observer>, effect: &CompletionEffect) {
    if let Some(child) = &effect.child {
        job_event(observer, EventType::JobCreated, Level::Debug, "continuation job created", child.id, &child.type_name);
    }
    for unblocked in &effect.newly_pending {
        job_event(
            observer,
            EventType::BlockerResolved,
            Level::Info,
            "blocker resolved; job unblocked",
            unblocked.id,
            &unblocked.type_name,
        );
    }
}

fn validate(
    registry: &TypeRegistry,
    type_name: &str,
    outcome: AttemptOutcome,
) -> Result<Completion, crate::registry::RegistryError> {
    match outcome {
        AttemptOutcome::Output(value) => {
            let normalized = registry.parse_output(type_name, Some(&value))?;
            Ok(Completion::Output(normalized.expect("Some input always yields Some output")))
        }
        AttemptOutcome::Continuation { type_name: target, input } => {
            let normalized_input = registry.validate_continuation(type_name, &target, &input)?;
            Ok(Completion::Continuation {
                type_name: target,
                input: normalized_input,
            })
        }
    }
}

fn queue_notifications(notify_ctx: &NotifyContext, chain_id: Uuid, effect: &CompletionEffect) {
    if effect.chain_completed {
        notify_ctx.chain_completed(chain_id);
    }
    if let Some(child) = &effect.child {
        notify_ctx.job_scheduled(child.type_name.clone(), 1);
    }
    for newly_pending in &effect.newly_pending {
        notify_ctx.job_scheduled(newly_pending.type_name.clone(), 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;
    use crate::model::JobStatus;
    use crate::observability::NoopObserver;
    use crate::registry::JobTypeDef;
    use crate::store::NewJob;
    use std::time::Duration;

    fn observer() -> Arc<dyn Observer> {
        Arc::new(NoopObserver)
    }

    fn registry() -> TypeRegistry {
        let mut r = TypeRegistry::new();
        r.register(
            JobTypeDef::new("greet").entry().output_validator(std::sync::Arc::new(|v| {
                if v.get("msg").is_some() {
                    Ok(v.clone())
                } else {
                    Err("missing msg".to_string())
                }
            })),
        );
        r.register(JobTypeDef::new("fetch").entry().no_output().continues_to(["process"]));
        r.register(JobTypeDef::new("process"));
        r
    }

    async fn acquired_job(store: &MemStore, type_name: &str, worker_id: &str) -> Job {
        let chain_id = Uuid::new_v4();
        store
            .create_job(NewJob {
                job_id: Some(chain_id),
                chain_id,
                sequence_index: 0,
                type_name: type_name.to_string(),
                chain_type_name: type_name.to_string(),
                input: serde_json::json!({}),
                scheduled_at: chrono::Utc::now(),
                status: JobStatus::Pending,
                dedup_key: None,
            })
            .await
            .unwrap();
        store
            .acquire_job(&[type_name.to_string()], worker_id, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn complete_with_valid_output_finalizes_the_chain() {
        let store = MemStore::new();
        let registry = registry();
        let notify_ctx = NotifyContext::new();
        let job = acquired_job(&store, "greet", "w1").await;

        let effect = complete(&store, &registry, &notify_ctx, &observer(), &job, "w1", |_tx| async {
            Ok(AttemptOutcome::Output(serde_json::json!({"msg": "hi"})))
        })
        .await
        .unwrap();

        assert!(effect.chain_completed);
        assert_eq!(effect.tail.output, Some(serde_json::json!({"msg": "hi"})));
    }

    #[tokio::test]
    async fn complete_aborts_without_calling_closure_when_lease_already_lost() {
        let store = MemStore::new();
        let registry = registry();
        let notify_ctx = NotifyContext::new();
        let job = acquired_job(&store, "greet", "w1").await;

        // Steal the lease out from under "w1" by reaping with a zero lease.
        store.acquire_job(&["greet".to_string()], "w2", Duration::from_secs(30)).await.ok();

        let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = called.clone();
        let result = complete(&store, &registry, &notify_ctx, &observer(), &job, "w1", move |_tx| {
            called_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            async { Ok(AttemptOutcome::Output(serde_json::json!({"msg": "hi"}))) }
        })
        .await;

        assert!(matches!(result, Err(JobweaveError::LeaseLost { .. })));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn complete_with_disallowed_continuation_target_completes_with_error() {
        let store = MemStore::new();
        let registry = registry();
        let notify_ctx = NotifyContext::new();
        let job = acquired_job(&store, "fetch", "w1").await;

        let effect = complete(&store, &registry, &notify_ctx, &observer(), &job, "w1", |_tx| async {
            Ok(AttemptOutcome::Continuation {
                type_name: "greet".to_string(),
                input: serde_json::json!({}),
            })
        })
        .await
        .unwrap();

        assert!(effect.chain_completed);
        assert!(effect.tail.last_attempt_error.is_some());
        assert_eq!(effect.tail.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn complete_with_permitted_continuation_creates_child() {
        let store = MemStore::new();
        let registry = registry();
        let notify_ctx = NotifyContext::new();
        let job = acquired_job(&store, "fetch", "w1").await;

        let effect = complete(&store, &registry, &notify_ctx, &observer(), &job, "w1", |_tx| async {
            Ok(AttemptOutcome::Continuation {
                type_name: "process".to_string(),
                input: serde_json::json!({"data": [1, 2, 3]}),
            })
        })
        .await
        .unwrap();

        assert!(!effect.chain_completed);
        assert!(effect.child.is_some());
    }
}
