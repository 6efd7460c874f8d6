//! The durable job/chain data model (see `§3 DATA MODEL`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Lifecycle state of a single job row.
///
/// Transitions: `blocked -> pending -> running -> completed`, with `running
/// -> pending` on reap or handler failure. See `§3 Lifecycles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Blocked,
    #[default]
    Pending,
    Running,
    Completed,
}

/// A persisted, attempt-bearing unit of work.
///
/// Mirrors `kernel/jobs/job.rs`'s `Job` row shape, trimmed to the fields
/// actually needed here: no priority/overlap/misfire policies (explicit
/// Non-goals), but the same lease/attempt/dedup bones.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// Chain this job belongs to. Equal to `id` for the root (sequence 0) job.
    pub chain_id: Uuid,

    /// Position within the chain; 0 for the root/entry job.
    #[builder(default = 0)]
    pub sequence_index: i32,

    /// Registered job-type name for this specific job.
    pub type_name: String,

    /// Job-type name of the chain's root job (the chain's "public type").
    pub chain_type_name: String,

    pub input: serde_json::Value,

    #[builder(default, setter(strip_option))]
    pub output: Option<serde_json::Value>,

    #[builder(default)]
    pub status: JobStatus,

    #[builder(default = 0)]
    pub attempt: i32,

    #[builder(default = Utc::now())]
    pub scheduled_at: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub last_attempt_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub last_attempt_error: Option<String>,

    #[builder(default, setter(strip_option))]
    pub leased_by: Option<String>,

    #[builder(default, setter(strip_option))]
    pub leased_until: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub completed_by: Option<String>,

    #[builder(default, setter(strip_option))]
    pub dedup_key: Option<String>,
}

impl Job {
    /// True iff this job is the root (sequence-index 0, and thus
    /// `chain_id == id`) of its chain.
    pub fn is_root(&self) -> bool {
        self.sequence_index == 0 && self.chain_id == self.id
    }

    /// True iff the job is ready to be handed to `acquireJob`: pending and
    /// its `scheduled_at` has arrived (§3 invariant 4).
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// True iff the job's lease has expired and it is eligible for reaping.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.leased_until.map(|until| until <= now).unwrap_or(true)
    }

    /// True iff the job is currently `running` and leased by `worker_id`
    /// (§4.5 step 2: the re-read-under-lock ownership check).
    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.leased_by.as_deref() == Some(worker_id)
    }
}

/// A many-to-many edge: `blocked_job_id` cannot leave `blocked` until
/// `blocker_chain_id` completes (§3 "Blocker edge").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct BlockerEdge {
    pub blocked_job_id: Uuid,
    pub blocker_chain_id: Uuid,
}

/// Deduplication strategy for `startJobChain` (§4.3 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupStrategy {
    /// Match only against chains whose root job has completed.
    Finalized,
    /// Match against chains in any status.
    All,
}

/// A fully resolved chain: its root job and current tail job.
///
/// The tail is the non-completed job, or the last completed one once the
/// chain is finished (§3 "Chain").
#[derive(Debug, Clone)]
pub struct ChainView {
    pub root: Job,
    pub tail: Job,
}

impl ChainView {
    /// A chain is completed iff its tail is completed (§3).
    pub fn is_completed(&self) -> bool {
        self.tail.status == JobStatus::Completed
    }

    pub fn chain_id(&self) -> Uuid {
        self.root.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_root() -> Job {
        let id = Uuid::new_v4();
        Job::builder()
            .id(id)
            .chain_id(id)
            .type_name("greet")
            .chain_type_name("greet")
            .input(serde_json::json!({"name": "World"}))
            .build()
    }

    #[test]
    fn root_job_has_sequence_zero_and_self_chain_id() {
        let job = sample_root();
        assert!(job.is_root());
    }

    #[test]
    fn non_root_job_is_not_root() {
        let mut job = sample_root();
        job.sequence_index = 1;
        assert!(!job.is_root());
    }

    #[test]
    fn pending_job_scheduled_in_past_is_ready() {
        let job = sample_root();
        assert!(job.is_ready(Utc::now()));
    }

    #[test]
    fn pending_job_scheduled_in_future_is_not_ready() {
        let mut job = sample_root();
        job.scheduled_at = Utc::now() + chrono::Duration::seconds(60);
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn running_job_is_never_ready() {
        let mut job = sample_root();
        job.status = JobStatus::Running;
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn running_job_with_future_lease_has_not_expired() {
        let mut job = sample_root();
        job.status = JobStatus::Running;
        job.leased_until = Some(Utc::now() + chrono::Duration::seconds(30));
        assert!(!job.lease_expired(Utc::now()));
    }

    #[test]
    fn running_job_with_past_lease_has_expired() {
        let mut job = sample_root();
        job.status = JobStatus::Running;
        job.leased_until = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(job.lease_expired(Utc::now()));
    }

    #[test]
    fn chain_view_is_completed_tracks_tail_status() {
        let root = sample_root();
        let mut tail = root.clone();
        tail.status = JobStatus::Completed;
        let chain = ChainView { root, tail };
        assert!(chain.is_completed());
    }
}
