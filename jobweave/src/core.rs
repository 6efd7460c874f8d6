//! Core helper — chain lifecycle (C3, §4.3): `startJobChain`,
//! `waitForJobChainCompletion` (C8, §4.8), the workerless `completeJobChain`
//! path (reusing C5), and `deleteJobChains`.
//!
//! [`Engine`] is the shared substrate `start_job_chain`/`Worker` both sit
//! on top of, the same role `seesaw::Runtime` plays for machines and
//! effects: one place holding the store, notify fabric, registry, and
//! observer, cheaply `Clone`-able (every field is an `Arc`) so it can be
//! handed to spawned tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::complete::{self, AttemptOutcome, TxContext};
use crate::error::JobweaveError;
use crate::model::{ChainView, DedupStrategy, JobStatus};
use crate::notify::Notify;
use crate::notify_context::{with_notify_context, NotifyContext};
use crate::observability::{job_event, EventType, Level, NoopObserver, Observer};
use crate::registry::TypeRegistry;
use crate::store::{NewJob, Store};

/// Reference to a chain usable as a blocker: the type name (for registry
/// policy checks) and the chain id (== its root job's id).
#[derive(Debug, Clone)]
pub struct BlockerRef {
    pub type_name: String,
    pub chain_id: Uuid,
}

impl From<&StartJobChainResult> for BlockerRef {
    fn from(result: &StartJobChainResult) -> Self {
        Self {
            type_name: result.chain.root.type_name.clone(),
            chain_id: result.chain.chain_id(),
        }
    }
}

/// A closure invoked inside `startJobChain`'s write to start one or more
/// blocker chains (§4.3 step 4). Runs against the same [`Engine`] and
/// shares the caller's [`NotifyContext`] batch, so blocker chains it starts
/// flush alongside the blocked job's own notification rather than eagerly.
pub type StartBlockersFn = Box<
    dyn for<'e> FnOnce(&'e Engine, &'e NotifyContext) -> BoxFuture<'e, Result<Vec<BlockerRef>, JobweaveError>>
        + Send,
>;

/// `startJobChain` parameters (§4.3).
#[derive(TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct StartJobChainParams {
    pub type_name: String,
    pub input: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub dedup_key: Option<String>,
    #[builder(default = DedupStrategy::Finalized)]
    #[builder(setter(!into))]
    pub dedup_strategy: DedupStrategy,
    #[builder(default, setter(strip_option))]
    pub scheduled_after: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option, !into))]
    pub start_blockers: Option<StartBlockersFn>,
}

/// Result of `startJobChain`: the created (or deduplicated) chain, and
/// whether it was a dedup hit.
#[derive(Debug, Clone)]
pub struct StartJobChainResult {
    pub chain: ChainView,
    pub deduplicated: bool,
}

/// Options for `waitForJobChainCompletion` (§4.3, §4.8).
#[derive(Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub cancel: CancellationToken,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        }
    }
}

/// The shared substrate for chain lifecycle operations and the worker loop:
/// store, notify fabric, registry, and observer, all cheaply `Clone`-able.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) notify: Arc<dyn Notify>,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) observer: Arc<dyn Observer>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, notify: Arc<dyn Notify>, registry: TypeRegistry) -> Self {
        Self {
            store,
            notify,
            registry: Arc::new(registry),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn notify(&self) -> &Arc<dyn Notify> {
        &self.notify
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn observer(&self) -> &Arc<dyn Observer> {
        &self.observer
    }

    /// `startJobChain` (§4.3): validates, deduplicates, creates the root job
    /// (and any blocker edges), and queues a `job-scheduled` hint. Wraps its
    /// own [`NotifyContext`] via C6, so a single call is always consistent:
    /// either everything commits and the hint flushes, or nothing does.
    pub async fn start_job_chain(&self, params: StartJobChainParams) -> Result<StartJobChainResult, JobweaveError> {
        with_notify_context(self.notify.as_ref(), |ctx| self.start_job_chain_in(params, &ctx)).await
    }

    /// The same operation, sharing an already-open [`NotifyContext`] batch.
    /// Used both by the public `start_job_chain` and recursively by
    /// `StartBlockersFn` closures so nested chain starts share one flush.
    pub async fn start_job_chain_in(
        &self,
        params: StartJobChainParams,
        notify_ctx: &NotifyContext,
    ) -> Result<StartJobChainResult, JobweaveError> {
        self.registry.validate_entry(&params.type_name)?;
        let normalized_input = self.registry.parse_input(&params.type_name, &params.input)?;

        if let Some(dedup_key) = &params.dedup_key {
            if let Some(chain) = self
                .store
                .find_dedup_chain(&params.type_name, dedup_key, params.dedup_strategy)
                .await?
            {
                return Ok(StartJobChainResult { chain, deduplicated: true });
            }
        }

        // Blockers are started before the blocked job's own row exists: they
        // are independent chains and don't need the blocked job's id.
        let blocker_refs = match params.start_blockers {
            Some(start_blockers) => start_blockers(self, notify_ctx).await?,
            None => Vec::new(),
        };
        // Design notes (c): zero blockers returned behaves as if the option
        // were omitted entirely.
        let status = if blocker_refs.is_empty() {
            JobStatus::Pending
        } else {
            JobStatus::Blocked
        };

        // Validate before the root job is ever written: a rejected blocker
        // target must never leave a `blocked` row with no blocker edge
        // behind (§3 invariant 3).
        if !blocker_refs.is_empty() {
            let blocker_type_names: Vec<String> = blocker_refs.iter().map(|b| b.type_name.clone()).collect();
            self.registry.validate_blockers(&params.type_name, &blocker_type_names)?;
        }

        let now = Utc::now();
        let scheduled_at = params.scheduled_after.map(|at| at.max(now)).unwrap_or(now);
        let job_id = Uuid::new_v4();

        let root = self
            .store
            .create_job(NewJob {
                job_id: Some(job_id),
                chain_id: job_id,
                sequence_index: 0,
                type_name: params.type_name.clone(),
                chain_type_name: params.type_name.clone(),
                input: normalized_input,
                scheduled_at,
                status,
                dedup_key: params.dedup_key.clone(),
            })
            .await?;

        job_event(&self.observer, EventType::JobCreated, Level::Debug, "root job created", root.id, &root.type_name);
        // Every chain's root job is, by construction, its own chain's entry point.
        job_event(&self.observer, EventType::ChainCreated, Level::Info, "chain created", root.chain_id, &root.chain_type_name);

        if !blocker_refs.is_empty() {
            let blocker_chain_ids: Vec<Uuid> = blocker_refs.iter().map(|b| b.chain_id).collect();
            self.store.add_job_blockers(root.id, &blocker_chain_ids).await?;
        } else {
            notify_ctx.job_scheduled(params.type_name.clone(), 1);
        }

        Ok(StartJobChainResult {
            chain: ChainView { tail: root.clone(), root },
            deduplicated: false,
        })
    }

    /// `waitForJobChainCompletion` (§4.3, C8). Subscribes before reading the
    /// store so a completion landing between the two can't be missed: if
    /// the initial read already shows completed, resolves immediately
    /// without ever needing the subscription.
    pub async fn wait_for_job_chain_completion(
        &self,
        chain_id: Uuid,
        opts: WaitOptions,
    ) -> Result<ChainView, JobweaveError> {
        let mut subscription = self.notify.subscribe_job_chain_completed(chain_id);

        if let Some(chain) = self.store.get_job_chain_by_id(chain_id).await? {
            if chain.is_completed() {
                return Ok(chain);
            }
        }

        let deadline = tokio::time::sleep(opts.timeout);
        tokio::pin!(deadline);

        loop {
            let poll = tokio::time::sleep(opts.poll_interval);
            tokio::select! {
                _ = subscription.wait() => {}
                _ = poll => {}
                _ = &mut deadline => return Err(JobweaveError::Timeout),
                _ = opts.cancel.cancelled() => return Err(JobweaveError::Canceled),
            }

            if let Some(chain) = self.store.get_job_chain_by_id(chain_id).await? {
                if chain.is_completed() {
                    return Ok(chain);
                }
            }
        }
    }

    /// Workerless completion path (§4.3 "completeJobChain"): the same
    /// contract as the worker's completion step, for an outside process
    /// that already owns the job's lease through its own means.
    pub async fn complete_job_chain<F, Fut>(
        &self,
        job_id: Uuid,
        worker_id: &str,
        user_fn: F,
    ) -> Result<crate::store::CompletionEffect, JobweaveError>
    where
        F: FnOnce(TxContext) -> Fut,
        Fut: Future<Output = Result<AttemptOutcome, JobweaveError>>,
    {
        let job = self
            .store
            .get_job_by_id(job_id)
            .await?
            .ok_or(JobweaveError::LeaseLost { job_id })?;

        with_notify_context(self.notify.as_ref(), |ctx| {
            complete::complete(self.store.as_ref(), self.registry.as_ref(), &ctx, &self.observer, &job, worker_id, user_fn)
        })
        .await
    }

    /// `deleteJobChains` (§4.3): bulk removes terminal chains and flips any
    /// jobs that lose their last blocker to pending.
    pub async fn delete_job_chains(&self, root_chain_ids: &[Uuid]) -> Result<(), JobweaveError> {
        let ids = root_chain_ids.to_vec();
        with_notify_context(self.notify.as_ref(), |ctx| async move {
            let newly_pending = self.store.delete_job_chains(&ids).await?;
            for job in &newly_pending {
                ctx.job_scheduled(job.type_name.clone(), 1);
            }
            Ok::<(), JobweaveError>(())
        })
        .await
    }
}
