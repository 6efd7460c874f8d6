//! Reference in-memory [`Notify`] implementation (§10.5).
//!
//! Built directly on `seesaw::EventBus`, the same type-erased broadcast
//! primitive used elsewhere in this codebase for its own "facts" channel. The three
//! fixed topics this trait exposes (job-scheduled, chain-completed,
//! job-ownership-lost) are emitted onto one shared bus as distinct fact
//! types and a small forwarder task per subscription downcasts and
//! re-broadcasts onto a topic-shaped channel, because callers here want a
//! receiver keyed to "this chain id" or "these type names", not "any fact"
//! (§6.2's listen-by-topic contract does not map onto `EventBus::subscribe`
//! alone). The forwarder exits once the caller drops its subscription: the
//! re-broadcast send fails when there are no more receivers, which is the
//! signal to stop.

use async_trait::async_trait;
use seesaw::EventBus;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::NotifyError;
use crate::notify::{
    ChainCompletedSubscription, JobOwnershipLostSubscription, Notify, ScheduledHint, ScheduledSubscription,
};

/// Forwarder channel capacity; hints are small and consumed promptly by
/// workers, so this only needs to absorb bursts.
const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct JobScheduledFact {
    type_name: String,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
struct ChainCompletedFact {
    chain_id: Uuid,
}

#[derive(Debug, Clone, Copy)]
struct JobOwnershipLostFact {
    job_id: Uuid,
}

/// Process-memory reference implementation of the notify fabric interface.
#[derive(Clone)]
pub struct MemNotify {
    bus: EventBus,
}

impl Default for MemNotify {
    fn default() -> Self {
        Self::new()
    }
}

impl MemNotify {
    pub fn new() -> Self {
        Self { bus: EventBus::new() }
    }
}

#[async_trait]
impl Notify for MemNotify {
    async fn notify_job_scheduled(&self, type_name: &str, count: u32) -> Result<(), NotifyError> {
        self.bus.emit(JobScheduledFact {
            type_name: type_name.to_string(),
            count,
        });
        Ok(())
    }

    fn subscribe_job_scheduled(&self, type_names: &[String]) -> ScheduledSubscription {
        let mut envelopes = self.bus.subscribe();
        let (tx, rx) = broadcast::channel(TOPIC_CAPACITY);
        let watched: Vec<String> = type_names.to_vec();

        tokio::spawn(async move {
            loop {
                match envelopes.recv().await {
                    Ok(envelope) => {
                        let Some(fact) = envelope.downcast_ref::<JobScheduledFact>() else {
                            continue;
                        };
                        if !watched.iter().any(|t| t == &fact.type_name) {
                            continue;
                        }
                        let hint = ScheduledHint {
                            type_name: fact.type_name.clone(),
                            count: fact.count,
                        };
                        if tx.send(hint).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        ScheduledSubscription {
            receiver: rx,
            type_names: type_names.to_vec(),
        }
    }

    async fn notify_job_chain_completed(&self, chain_id: Uuid) -> Result<(), NotifyError> {
        self.bus.emit(ChainCompletedFact { chain_id });
        Ok(())
    }

    fn subscribe_job_chain_completed(&self, chain_id: Uuid) -> ChainCompletedSubscription {
        let mut envelopes = self.bus.subscribe();
        let (tx, rx) = broadcast::channel(TOPIC_CAPACITY);

        tokio::spawn(async move {
            loop {
                match envelopes.recv().await {
                    Ok(envelope) => {
                        let Some(fact) = envelope.downcast_ref::<ChainCompletedFact>() else {
                            continue;
                        };
                        if fact.chain_id != chain_id {
                            continue;
                        }
                        if tx.send(fact.chain_id).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        ChainCompletedSubscription { receiver: rx, chain_id }
    }

    async fn notify_job_ownership_lost(&self, job_id: Uuid) -> Result<(), NotifyError> {
        self.bus.emit(JobOwnershipLostFact { job_id });
        Ok(())
    }

    fn subscribe_job_ownership_lost(&self, job_id: Uuid) -> JobOwnershipLostSubscription {
        let mut envelopes = self.bus.subscribe();
        let (tx, rx) = broadcast::channel(TOPIC_CAPACITY);

        tokio::spawn(async move {
            loop {
                match envelopes.recv().await {
                    Ok(envelope) => {
                        let Some(fact) = envelope.downcast_ref::<JobOwnershipLostFact>() else {
                            continue;
                        };
                        if fact.job_id != job_id {
                            continue;
                        }
                        if tx.send(fact.job_id).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        JobOwnershipLostSubscription { receiver: rx, job_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn job_scheduled_hint_reaches_matching_subscriber() {
        let notify = MemNotify::new();
        let mut sub = notify.subscribe_job_scheduled(&["greet".to_string()]);

        notify.notify_job_scheduled("greet", 1).await.unwrap();
        let hint = sub.recv().await.expect("hint expected");
        assert_eq!(hint.type_name, "greet");
        assert_eq!(hint.count, 1);
    }

    #[tokio::test]
    async fn job_scheduled_hint_ignores_unwatched_types() {
        let notify = MemNotify::new();
        let mut sub = notify.subscribe_job_scheduled(&["greet".to_string()]);

        notify.notify_job_scheduled("fetch", 1).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(outcome.is_err(), "unwatched type must not be delivered");
    }

    #[tokio::test]
    async fn chain_completed_reaches_matching_subscriber_only() {
        let notify = MemNotify::new();
        let target = Uuid::new_v4();
        let mut sub = notify.subscribe_job_chain_completed(target);

        notify.notify_job_chain_completed(Uuid::new_v4()).await.unwrap();
        notify.notify_job_chain_completed(target).await.unwrap();

        tokio::time::timeout(Duration::from_millis(200), sub.wait())
            .await
            .expect("expected the matching chain-completed notification");
    }

    #[tokio::test]
    async fn ownership_lost_reaches_matching_subscriber() {
        let notify = MemNotify::new();
        let target = Uuid::new_v4();
        let mut sub = notify.subscribe_job_ownership_lost(target);

        notify.notify_job_ownership_lost(target).await.unwrap();
        let id = tokio::time::timeout(Duration::from_millis(200), sub.recv())
            .await
            .expect("expected a notification")
            .expect("channel should still be open");
        assert_eq!(id, target);
    }
}
