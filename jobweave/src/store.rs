//! State store interface (L1, §6.1) — the transactional persistence
//! collaborator contract.
//!
//! This is deliberately an external-collaborator *trait*, not a concrete
//! backend: §1 puts "concrete store backends (SQL dialects, MongoDB,
//! in-memory)" out of scope. The shape follows two patterns in the wider
//! codebase at once: the row-level atomic operations (`acquire_job`,
//! `renew_job_lease`, `complete_job`, `remove_expired_job_leases`) mirror
//! the single atomic `claim_jobs` CTE in `kernel/jobs/job.rs`
//! (`FOR UPDATE SKIP LOCKED`, lease-reap folded into the same query), and
//! the `Conflict` vs `Backend` error split mirrors
//! `seesaw::persistence::MachineStore`'s optimistic-concurrency contract.
//!
//! Unlike `seesaw::persistence::MachineStore`, operations here are not
//! parameterized over an explicit transaction handle: a concrete adapter
//! (e.g. a SQL backend) is responsible for deciding how `createJob` +
//! `addJobBlockers` + the caller's own mutations join a single database
//! transaction. That decision is adapter-specific and out of scope for
//! this crate per §1; the trait only specifies which operations must be
//! atomic *with respect to each other* (the `[tx]` markers in §6.1).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{ChainView, DedupStrategy, Job, JobStatus};

/// Parameters for `createJob` (§6.1).
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Option<Uuid>,
    pub chain_id: Uuid,
    pub sequence_index: i32,
    pub type_name: String,
    pub chain_type_name: String,
    pub input: Value,
    pub scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    pub dedup_key: Option<String>,
}

/// What a handler produced when it called `complete(userFn)` (§4.5).
#[derive(Debug, Clone)]
pub enum Completion {
    /// Terminal output; the chain's tail becomes `completed`.
    Output(Value),
    /// A continuation descriptor; a new pending child job is created in the
    /// same chain at `sequence_index + 1`.
    Continuation { type_name: String, input: Value },
    /// A fatal registry-validation failure (`OUTPUT_REQUIRED`,
    /// `INVALID_OUTPUT`, a disallowed continuation/blocker target): the job
    /// is completed with no output and the detail persisted as its last
    /// attempt error, rather than rescheduled (§4.4's outcome table).
    Error(String),
}

/// Result of a successful `completeJob` call: the finalized tail, the child
/// job if a continuation was created, any jobs that newly became pending
/// because this completion resolved their blockers, and whether the chain
/// as a whole is now completed (no child created and nothing left blocked
/// on it).
#[derive(Debug, Clone)]
pub struct CompletionEffect {
    pub tail: Job,
    pub child: Option<Job>,
    pub newly_pending: Vec<Job>,
    pub chain_completed: bool,
}

/// Transactional persistence of jobs, blockers, and chains (L1).
///
/// All methods return `Err(StoreError::Conflict)` for the specific case
/// callers treat as `LEASE_LOST`: the row was not in the expected state
/// (wrong status, wrong lease owner) when the mutation was attempted.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get_job_chain_by_id(&self, chain_id: Uuid) -> Result<Option<ChainView>, StoreError>;

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn create_job(&self, spec: NewJob) -> Result<Job, StoreError>;

    async fn add_job_blockers(&self, job_id: Uuid, blocker_chain_ids: &[Uuid]) -> Result<(), StoreError>;

    /// Scans jobs blocked on `resolved_chain_id` and flips any whose
    /// remaining-blocker count reaches zero to `pending`. Returns the
    /// newly-pending jobs so their type names can be notified.
    async fn schedule_blocked_jobs(&self, resolved_chain_id: Uuid) -> Result<Vec<Job>, StoreError>;

    async fn get_job_blockers(&self, job_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Soonest `scheduled_at` among pending, unblocked jobs of the given
    /// types, expressed as a delay from now. `None` means no such job exists.
    async fn get_next_job_available_in(&self, type_names: &[String]) -> Result<Option<Duration>, StoreError>;

    /// Atomically selects the single oldest eligible pending job of the
    /// given types (tie-break: `scheduled_at`, then `created_at`, then
    /// `id`), flips it to `running`, sets lease owner/expiry, and
    /// increments `attempt`.
    async fn acquire_job(
        &self,
        type_names: &[String],
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// Extends a running job's lease. Fails with `Conflict` if the job is
    /// no longer running under `worker_id` (lost, reaped, or completed).
    async fn renew_job_lease(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> Result<(), StoreError>;

    /// Reschedules a job after a handler error: status -> pending,
    /// `scheduled_at` set, last-attempt error recorded. Fails with
    /// `Conflict` if the job is no longer running under `worker_id`.
    async fn reschedule_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        scheduled_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Finalizes an attempt: re-checks lease ownership, writes the
    /// completion (and any continuation), and resolves blockers.
    /// Fails with `Conflict` (`LEASE_LOST`) if the job is no longer
    /// running under `worker_id`.
    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        completion: Completion,
    ) -> Result<CompletionEffect, StoreError>;

    /// Atomically releases every `running` job whose lease has expired,
    /// returning summaries of what was reaped.
    async fn remove_expired_job_leases(&self) -> Result<Vec<Job>, StoreError>;

    /// Removes all jobs and blocker edges transitively rooted at the given
    /// chain ids. Callers must ensure the chains are terminal. Returns jobs
    /// that became newly pending because a deleted chain was their last
    /// unresolved blocker.
    async fn delete_job_chains(&self, root_chain_ids: &[Uuid]) -> Result<Vec<Job>, StoreError>;

    /// Dedup lookup for `startJobChain` (§4.3 step 2).
    async fn find_dedup_chain(
        &self,
        type_name: &str,
        dedup_key: &str,
        strategy: DedupStrategy,
    ) -> Result<Option<ChainView>, StoreError>;
}
