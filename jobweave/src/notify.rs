//! Notify fabric interface (L2, §6.2) — best-effort wakeups for three
//! topics, at-least-once.
//!
//! Modeled directly on `seesaw::bus::EventBus`'s guarantees ("at-most-once
//! delivery, in-memory only, no replay") but split into three named topics
//! instead of one type-erased broadcast channel, because receivers here
//! care about a specific chain id or job id, not "any event". The reference
//! `mem` adapter (§10.5) is in fact built directly on
//! `tokio::sync::broadcast`, the same primitive `EventBus` wraps.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::NotifyError;

/// A received notification hint. Receivers must treat this as a hint and
/// re-read the store; the count lets a worker avoid a thundering herd when
/// only one job was actually scheduled (§5 "Ordering guarantees").
#[derive(Debug, Clone)]
pub struct ScheduledHint {
    pub type_name: String,
    pub count: u32,
}

/// Best-effort wakeup fabric (L2).
#[async_trait]
pub trait Notify: Send + Sync + 'static {
    async fn notify_job_scheduled(&self, type_name: &str, count: u32) -> Result<(), NotifyError>;

    /// Subscribes to `job-scheduled` hints for any of `type_names`.
    fn subscribe_job_scheduled(&self, type_names: &[String]) -> ScheduledSubscription;

    async fn notify_job_chain_completed(&self, chain_id: Uuid) -> Result<(), NotifyError>;

    fn subscribe_job_chain_completed(&self, chain_id: Uuid) -> ChainCompletedSubscription;

    async fn notify_job_ownership_lost(&self, job_id: Uuid) -> Result<(), NotifyError>;

    /// Subscribes to `job-ownership-lost` hints for a single job id.
    ///
    /// The worker loop itself never needs this: it discovers lease loss
    /// synchronously from `renew_job_lease`'s return value. This exists for
    /// external consumers (the dashboard, bespoke execution hosts) per
    /// `listenJobOwnershipLost` in §6.2.
    fn subscribe_job_ownership_lost(&self, job_id: Uuid) -> JobOwnershipLostSubscription;
}

/// A live subscription to `job-scheduled` hints. Dropping it unsubscribes.
pub struct ScheduledSubscription {
    pub(crate) receiver: tokio::sync::broadcast::Receiver<ScheduledHint>,
    pub(crate) type_names: Vec<String>,
}

impl ScheduledSubscription {
    /// Waits for the next hint matching this subscription's type names.
    pub async fn recv(&mut self) -> Option<ScheduledHint> {
        loop {
            match self.receiver.recv().await {
                Ok(hint) if self.type_names.iter().any(|t| t == &hint.type_name) => return Some(hint),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A live subscription to a single chain's completion. Dropping it
/// unsubscribes.
pub struct ChainCompletedSubscription {
    pub(crate) receiver: tokio::sync::broadcast::Receiver<Uuid>,
    pub(crate) chain_id: Uuid,
}

impl ChainCompletedSubscription {
    /// Resolves once `chain_id` is observed completed.
    pub async fn wait(&mut self) {
        loop {
            match self.receiver.recv().await {
                Ok(id) if id == self.chain_id => return,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// A live subscription to a single job's ownership-lost hints. Dropping it
/// unsubscribes.
pub struct JobOwnershipLostSubscription {
    pub(crate) receiver: tokio::sync::broadcast::Receiver<Uuid>,
    pub(crate) job_id: Uuid,
}

impl JobOwnershipLostSubscription {
    /// Waits for the next ownership-lost hint for this subscription's job id.
    pub async fn recv(&mut self) -> Option<Uuid> {
        loop {
            match self.receiver.recv().await {
                Ok(id) if id == self.job_id => return Some(id),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
