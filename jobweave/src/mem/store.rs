//! Reference in-memory [`Store`] implementation (§10.5).
//!
//! A single `Mutex`-guarded map stands in for the row-level locking the
//! `claim_jobs` CTE in `kernel/jobs/job.rs` gets from Postgres's
//! `FOR UPDATE SKIP LOCKED`: every mutating operation takes the lock,
//! scans, and writes back before releasing it. This is the same tradeoff
//! accepted for "the single-writer SQLite case" (§5): correctness over
//! write throughput. It is a test/demo fixture, not a production store
//! (§1, §6.3).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{ChainView, DedupStrategy, Job, JobStatus};
use crate::store::{Completion, CompletionEffect, NewJob, Store};

struct Inner {
    jobs: HashMap<Uuid, Job>,
    /// job_id -> set of blocker chain ids not yet resolved.
    blockers: HashMap<Uuid, HashSet<Uuid>>,
}

/// Process-memory reference implementation of the state store interface.
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                blockers: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mem store mutex poisoned")
    }

    /// Finds the current tail of the chain rooted at `chain_id`: the single
    /// non-completed job if one exists, else the completed job with the
    /// highest sequence index (§3 "Chain").
    fn tail_of(inner: &Inner, chain_id: Uuid) -> Option<Job> {
        let mut members: Vec<&Job> = inner.jobs.values().filter(|j| j.chain_id == chain_id).collect();
        if members.is_empty() {
            return None;
        }
        members.sort_by_key(|j| j.sequence_index);
        members
            .iter()
            .find(|j| j.status != JobStatus::Completed)
            .or_else(|| members.last())
            .map(|j| (*j).clone())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_job_chain_by_id(&self, chain_id: Uuid) -> Result<Option<ChainView>, StoreError> {
        let inner = self.lock();
        let Some(root) = inner.jobs.get(&chain_id).cloned() else {
            return Ok(None);
        };
        let tail = Self::tail_of(&inner, chain_id).unwrap_or_else(|| root.clone());
        Ok(Some(ChainView { root, tail }))
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn create_job(&self, spec: NewJob) -> Result<Job, StoreError> {
        let now = Utc::now();
        let job = Job::builder()
            .id(spec.job_id.unwrap_or_else(Uuid::new_v4))
            .chain_id(spec.chain_id)
            .sequence_index(spec.sequence_index)
            .type_name(spec.type_name)
            .chain_type_name(spec.chain_type_name)
            .input(spec.input)
            .status(spec.status)
            .scheduled_at(spec.scheduled_at)
            .created_at(now)
            .updated_at(now)
            .dedup_key(spec.dedup_key)
            .build();
        self.lock().jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn add_job_blockers(&self, job_id: Uuid, blocker_chain_ids: &[Uuid]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .blockers
            .entry(job_id)
            .or_default()
            .extend(blocker_chain_ids.iter().copied());
        Ok(())
    }

    async fn schedule_blocked_jobs(&self, resolved_chain_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let mut inner = self.lock();
        let mut newly_pending = Vec::new();
        let resolved_job_ids: Vec<Uuid> = inner
            .blockers
            .iter()
            .filter(|(_, set)| set.contains(&resolved_chain_id))
            .map(|(job_id, _)| *job_id)
            .collect();

        for job_id in resolved_job_ids {
            if let Some(set) = inner.blockers.get_mut(&job_id) {
                set.remove(&resolved_chain_id);
                if set.is_empty() {
                    inner.blockers.remove(&job_id);
                    if let Some(job) = inner.jobs.get_mut(&job_id) {
                        job.status = JobStatus::Pending;
                        job.scheduled_at = Utc::now();
                        job.updated_at = Utc::now();
                        newly_pending.push(job.clone());
                    }
                }
            }
        }
        Ok(newly_pending)
    }

    async fn get_job_blockers(&self, job_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .lock()
            .blockers
            .get(&job_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn get_next_job_available_in(&self, type_names: &[String]) -> Result<Option<Duration>, StoreError> {
        let inner = self.lock();
        let now = Utc::now();
        let soonest = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && type_names.iter().any(|t| t == &j.type_name))
            .map(|j| j.scheduled_at)
            .min();
        Ok(soonest.map(|at| {
            let delta = at - now;
            delta.to_std().unwrap_or(Duration::ZERO)
        }))
    }

    async fn acquire_job(
        &self,
        type_names: &[String],
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let candidate_id = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.scheduled_at <= now && type_names.iter().any(|t| t == &j.type_name))
            .min_by(|a, b| {
                a.scheduled_at
                    .cmp(&b.scheduled_at)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|j| j.id);

        let Some(id) = candidate_id else {
            return Ok(None);
        };
        let job = inner.jobs.get_mut(&id).expect("candidate id came from jobs map");
        job.status = JobStatus::Running;
        job.leased_by = Some(worker_id.to_string());
        job.leased_until = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
        job.attempt += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn renew_job_lease(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).ok_or(StoreError::Conflict)?;
        if job.status != JobStatus::Running || job.leased_by.as_deref() != Some(worker_id) {
            return Err(StoreError::Conflict);
        }
        job.leased_until = Some(Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn reschedule_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        scheduled_at: chrono::DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).ok_or(StoreError::Conflict)?;
        if job.status != JobStatus::Running || job.leased_by.as_deref() != Some(worker_id) {
            return Err(StoreError::Conflict);
        }
        let now = Utc::now();
        job.status = JobStatus::Pending;
        job.leased_by = None;
        job.leased_until = None;
        job.scheduled_at = scheduled_at;
        job.last_attempt_at = Some(now);
        job.last_attempt_error = error;
        job.updated_at = now;
        Ok(())
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        completion: Completion,
    ) -> Result<CompletionEffect, StoreError> {
        let mut inner = self.lock();
        {
            let job = inner.jobs.get(&job_id).ok_or(StoreError::Conflict)?;
            if job.status != JobStatus::Running || job.leased_by.as_deref() != Some(worker_id) {
                return Err(StoreError::Conflict);
            }
        }

        let now = Utc::now();
        let (chain_id, sequence_index, type_name_chain) = {
            let job = inner.jobs.get(&job_id).unwrap();
            (job.chain_id, job.sequence_index, job.chain_type_name.clone())
        };

        let mut child = None;
        match completion {
            Completion::Output(output) => {
                let job = inner.jobs.get_mut(&job_id).unwrap();
                job.status = JobStatus::Completed;
                job.output = Some(output);
                job.completed_at = Some(now);
                job.completed_by = Some(worker_id.to_string());
                job.leased_by = None;
                job.leased_until = None;
                job.updated_at = now;
            }
            Completion::Error(detail) => {
                let job = inner.jobs.get_mut(&job_id).unwrap();
                job.status = JobStatus::Completed;
                job.output = None;
                job.completed_at = Some(now);
                job.completed_by = Some(worker_id.to_string());
                job.leased_by = None;
                job.leased_until = None;
                job.last_attempt_error = Some(crate::error::truncate_error_text(&detail));
                job.updated_at = now;
            }
            Completion::Continuation { type_name, input } => {
                let job = inner.jobs.get_mut(&job_id).unwrap();
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                job.completed_by = Some(worker_id.to_string());
                job.leased_by = None;
                job.leased_until = None;
                job.updated_at = now;

                let next = Job::builder()
                    .chain_id(chain_id)
                    .sequence_index(sequence_index + 1)
                    .type_name(type_name)
                    .chain_type_name(type_name_chain)
                    .input(input)
                    .status(JobStatus::Pending)
                    .scheduled_at(now)
                    .created_at(now)
                    .updated_at(now)
                    .build();
                inner.jobs.insert(next.id, next.clone());
                child = Some(next);
            }
        }

        let tail = inner.jobs.get(&job_id).unwrap().clone();
        let chain_completed = child.is_none();

        let newly_pending = if chain_completed {
            drop(inner);
            self.schedule_blocked_jobs(chain_id).await?
        } else {
            Vec::new()
        };

        Ok(CompletionEffect {
            tail,
            child,
            newly_pending,
            chain_completed,
        })
    }

    async fn remove_expired_job_leases(&self) -> Result<Vec<Job>, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut reaped = Vec::new();
        for job in inner.jobs.values_mut() {
            if job.lease_expired(now) {
                job.status = JobStatus::Pending;
                job.leased_by = None;
                job.leased_until = None;
                job.updated_at = now;
                reaped.push(job.clone());
            }
        }
        Ok(reaped)
    }

    async fn delete_job_chains(&self, root_chain_ids: &[Uuid]) -> Result<Vec<Job>, StoreError> {
        let mut inner = self.lock();
        let roots: HashSet<Uuid> = root_chain_ids.iter().copied().collect();

        for chain_id in &roots {
            if let Some(view) = Self::tail_of(&inner, *chain_id) {
                if view.status != JobStatus::Completed {
                    return Err(StoreError::Backend(anyhow::anyhow!(
                        "chain {chain_id} is not terminal; refusing to delete"
                    )));
                }
            }
        }

        let dead_job_ids: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| roots.contains(&j.chain_id))
            .map(|j| j.id)
            .collect();
        for id in &dead_job_ids {
            inner.jobs.remove(id);
            inner.blockers.remove(id);
        }

        let mut newly_pending = Vec::new();
        let affected: Vec<Uuid> = inner
            .blockers
            .iter()
            .filter(|(_, set)| set.iter().any(|b| roots.contains(b)))
            .map(|(job_id, _)| *job_id)
            .collect();
        for job_id in affected {
            if let Some(set) = inner.blockers.get_mut(&job_id) {
                set.retain(|b| !roots.contains(b));
                if set.is_empty() {
                    inner.blockers.remove(&job_id);
                    if let Some(job) = inner.jobs.get_mut(&job_id) {
                        job.status = JobStatus::Pending;
                        job.scheduled_at = Utc::now();
                        job.updated_at = Utc::now();
                        newly_pending.push(job.clone());
                    }
                }
            }
        }

        Ok(newly_pending)
    }

    async fn find_dedup_chain(
        &self,
        type_name: &str,
        dedup_key: &str,
        strategy: DedupStrategy,
    ) -> Result<Option<ChainView>, StoreError> {
        let inner = self.lock();
        let root = inner.jobs.values().find(|j| {
            j.is_root() && j.type_name == type_name && j.dedup_key.as_deref() == Some(dedup_key)
        });
        let Some(root) = root.cloned() else {
            return Ok(None);
        };
        let tail = Self::tail_of(&inner, root.id).unwrap_or_else(|| root.clone());
        match strategy {
            DedupStrategy::All => Ok(Some(ChainView { root, tail })),
            DedupStrategy::Finalized => {
                if tail.status == JobStatus::Completed {
                    Ok(Some(ChainView { root, tail }))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job_spec(chain_id: Uuid, type_name: &str) -> NewJob {
        NewJob {
            job_id: Some(chain_id),
            chain_id,
            sequence_index: 0,
            type_name: type_name.to_string(),
            chain_type_name: type_name.to_string(),
            input: serde_json::json!({}),
            scheduled_at: Utc::now(),
            status: JobStatus::Pending,
            dedup_key: None,
        }
    }

    #[tokio::test]
    async fn acquire_job_returns_none_on_empty_store() {
        let store = MemStore::new();
        let job = store.acquire_job(&["greet".to_string()], "w1", Duration::from_secs(30)).await.unwrap();
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn acquire_job_flips_status_and_increments_attempt() {
        let store = MemStore::new();
        let chain_id = Uuid::new_v4();
        store.create_job(new_job_spec(chain_id, "greet")).await.unwrap();

        let job = store
            .acquire_job(&["greet".to_string()], "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("a job should have been acquired");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.leased_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn acquire_job_is_fifo_by_scheduled_at() {
        let store = MemStore::new();
        let later = Uuid::new_v4();
        let earlier = Uuid::new_v4();
        let mut later_spec = new_job_spec(later, "greet");
        later_spec.scheduled_at = Utc::now() + chrono::Duration::seconds(-1);
        let mut earlier_spec = new_job_spec(earlier, "greet");
        earlier_spec.scheduled_at = Utc::now() - chrono::Duration::seconds(10);
        store.create_job(later_spec).await.unwrap();
        store.create_job(earlier_spec).await.unwrap();

        let job = store
            .acquire_job(&["greet".to_string()], "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, earlier);
    }

    #[tokio::test]
    async fn renew_job_lease_fails_for_wrong_owner() {
        let store = MemStore::new();
        let chain_id = Uuid::new_v4();
        store.create_job(new_job_spec(chain_id, "greet")).await.unwrap();
        store
            .acquire_job(&["greet".to_string()], "w1", Duration::from_secs(30))
            .await
            .unwrap();

        let result = store.renew_job_lease(chain_id, "w2", Duration::from_secs(30)).await;
        assert!(matches!(result, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn complete_job_with_output_finalizes_chain() {
        let store = MemStore::new();
        let chain_id = Uuid::new_v4();
        store.create_job(new_job_spec(chain_id, "greet")).await.unwrap();
        store
            .acquire_job(&["greet".to_string()], "w1", Duration::from_secs(30))
            .await
            .unwrap();

        let effect = store
            .complete_job(chain_id, "w1", Completion::Output(serde_json::json!({"msg": "hi"})))
            .await
            .unwrap();
        assert!(effect.chain_completed);
        assert!(effect.child.is_none());
        assert_eq!(effect.tail.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn complete_job_with_continuation_creates_child_and_leaves_chain_open() {
        let store = MemStore::new();
        let chain_id = Uuid::new_v4();
        store.create_job(new_job_spec(chain_id, "fetch")).await.unwrap();
        store
            .acquire_job(&["fetch".to_string()], "w1", Duration::from_secs(30))
            .await
            .unwrap();

        let effect = store
            .complete_job(
                chain_id,
                "w1",
                Completion::Continuation {
                    type_name: "process".to_string(),
                    input: serde_json::json!({"data": [1, 2, 3]}),
                },
            )
            .await
            .unwrap();
        assert!(!effect.chain_completed);
        let child = effect.child.expect("continuation should create a child job");
        assert_eq!(child.sequence_index, 1);
        assert_eq!(child.chain_id, chain_id);
        assert_eq!(child.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn complete_job_fails_when_lease_lost() {
        let store = MemStore::new();
        let chain_id = Uuid::new_v4();
        store.create_job(new_job_spec(chain_id, "greet")).await.unwrap();

        // Never acquired: still pending, so completing as a worker is a conflict.
        let result = store.complete_job(chain_id, "w1", Completion::Output(serde_json::json!({}))).await;
        assert!(matches!(result, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn blocker_resolution_flips_job_to_pending_when_last_blocker_completes() {
        let store = MemStore::new();
        let blocker_chain = Uuid::new_v4();
        let blocked_job = Uuid::new_v4();

        let mut blocked_spec = new_job_spec(blocked_job, "b");
        blocked_spec.status = JobStatus::Blocked;
        store.create_job(blocked_spec).await.unwrap();
        store.add_job_blockers(blocked_job, &[blocker_chain]).await.unwrap();

        let newly_pending = store.schedule_blocked_jobs(blocker_chain).await.unwrap();
        assert_eq!(newly_pending.len(), 1);
        assert_eq!(newly_pending[0].id, blocked_job);
        assert_eq!(newly_pending[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn remove_expired_job_leases_reaps_stale_running_jobs() {
        let store = MemStore::new();
        let chain_id = Uuid::new_v4();
        store.create_job(new_job_spec(chain_id, "greet")).await.unwrap();
        store
            .acquire_job(&["greet".to_string()], "w1", Duration::from_millis(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = store.remove_expired_job_leases().await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].status, JobStatus::Pending);

        let job = store.get_job_by_id(chain_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.leased_by.is_none());
    }

    #[tokio::test]
    async fn delete_job_chains_refuses_non_terminal_chains() {
        let store = MemStore::new();
        let chain_id = Uuid::new_v4();
        store.create_job(new_job_spec(chain_id, "greet")).await.unwrap();

        let result = store.delete_job_chains(&[chain_id]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn find_dedup_chain_finalized_only_matches_completed() {
        let store = MemStore::new();
        let chain_id = Uuid::new_v4();
        let mut spec = new_job_spec(chain_id, "welcome");
        spec.dedup_key = Some("u:42".to_string());
        store.create_job(spec).await.unwrap();

        let miss = store
            .find_dedup_chain("welcome", "u:42", DedupStrategy::Finalized)
            .await
            .unwrap();
        assert!(miss.is_none());

        let hit = store
            .find_dedup_chain("welcome", "u:42", DedupStrategy::All)
            .await
            .unwrap();
        assert!(hit.is_some());
    }
}
