//! Notify context (C6, §4.6): batched post-commit notifications.
//!
//! Per the design notes (§9 "Global mutable state"), the batch is *not*
//! ambient/thread-local state: it is an explicit `Arc<NotifyContext>`
//! threaded through the call chain established by [`with_notify_context`],
//! the way `seesaw`'s `CorrelationId` is threaded explicitly through
//! `emit_with_correlation` rather than picked up from a global. Any
//! notification recorded while the batch is open is buffered; it is only
//! sent to the notify fabric once the wrapped future resolves
//! successfully, mirroring "save before dispatch" from
//! `seesaw::persistence` (durable state always precedes the wakeup it
//! triggers).

use std::future::Future;
use std::sync::Mutex;

use uuid::Uuid;

use crate::notify::Notify;

/// A single buffered notification, queued until the enclosing operation commits.
#[derive(Debug, Clone)]
pub enum PendingNotification {
    JobScheduled { type_name: String, count: u32 },
    ChainCompleted { chain_id: Uuid },
    JobOwnershipLost { job_id: Uuid },
}

/// A task-scoped batch of notifications awaiting flush.
#[derive(Default)]
pub struct NotifyContext {
    batch: Mutex<Vec<PendingNotification>>,
}

impl NotifyContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a `job-scheduled` hint. Hints for the same type within one
    /// batch are coalesced by summing their counts, so a chain of several
    /// same-type completions in one transaction still emits a single
    /// notify call with an accurate hint count.
    pub fn job_scheduled(&self, type_name: impl Into<String>, count: u32) {
        let type_name = type_name.into();
        let mut batch = self.batch.lock().expect("notify batch mutex poisoned");
        if let Some(PendingNotification::JobScheduled { count: existing, .. }) =
            batch.iter_mut().find(|n| matches!(n, PendingNotification::JobScheduled { type_name: t, .. } if t == &type_name))
        {
            *existing += count;
        } else {
            batch.push(PendingNotification::JobScheduled { type_name, count });
        }
    }

    pub fn chain_completed(&self, chain_id: Uuid) {
        let mut batch = self.batch.lock().expect("notify batch mutex poisoned");
        batch.push(PendingNotification::ChainCompleted { chain_id });
    }

    pub fn job_ownership_lost(&self, job_id: Uuid) {
        let mut batch = self.batch.lock().expect("notify batch mutex poisoned");
        batch.push(PendingNotification::JobOwnershipLost { job_id });
    }

    /// Flushes buffered notifications to the fabric. Best-effort: a flush
    /// failure is logged and swallowed, never propagated, because the
    /// store is already durable and polling will eventually deliver (§4.6).
    pub async fn flush(&self, notify: &dyn Notify) {
        let pending = std::mem::take(&mut *self.batch.lock().expect("notify batch mutex poisoned"));
        for notification in pending {
            let result = match notification {
                PendingNotification::JobScheduled { type_name, count } => {
                    notify.notify_job_scheduled(&type_name, count).await
                }
                PendingNotification::ChainCompleted { chain_id } => {
                    notify.notify_job_chain_completed(chain_id).await
                }
                PendingNotification::JobOwnershipLost { job_id } => {
                    notify.notify_job_ownership_lost(job_id).await
                }
            };
            if let Err(err) = result {
                tracing::warn!(error = %err, "notify flush failed; polling will still deliver");
            }
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.batch.lock().expect("notify batch mutex poisoned").len()
    }
}

/// Establishes a notify batch, runs `f` with it, and flushes the batch to
/// `notify` only if `f` resolves to `Ok`. On `Err`, the batch is dropped
/// unflushed — the caller's own mutation didn't commit, so there is
/// nothing to announce.
pub async fn with_notify_context<F, Fut, T, E>(notify: &dyn Notify, f: F) -> Result<T, E>
where
    F: FnOnce(std::sync::Arc<NotifyContext>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let ctx = std::sync::Arc::new(NotifyContext::new());
    let result = f(ctx.clone()).await;
    if result.is_ok() {
        ctx.flush(notify).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemNotify;

    #[test]
    fn job_scheduled_hints_for_same_type_are_coalesced() {
        let ctx = NotifyContext::new();
        ctx.job_scheduled("greet", 1);
        ctx.job_scheduled("greet", 2);
        ctx.job_scheduled("fetch", 1);
        assert_eq!(ctx.pending_count(), 2);
    }

    #[tokio::test]
    async fn successful_operation_flushes_batch() {
        let notify = MemNotify::new();
        let mut sub = notify.subscribe_job_scheduled(&["greet".to_string()]);

        let result: Result<(), ()> = with_notify_context(&notify, |ctx| async move {
            ctx.job_scheduled("greet", 1);
            Ok(())
        })
        .await;

        assert!(result.is_ok());
        let hint = sub.recv().await.expect("expected a flushed hint");
        assert_eq!(hint.type_name, "greet");
    }

    #[tokio::test]
    async fn failed_operation_does_not_flush_batch() {
        let notify = MemNotify::new();
        let mut sub = notify.subscribe_job_scheduled(&["greet".to_string()]);

        let result: Result<(), &str> = with_notify_context(&notify, |ctx| async move {
            ctx.job_scheduled("greet", 1);
            Err("boom")
        })
        .await;

        assert!(result.is_err());
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await;
        assert!(outcome.is_err(), "no hint should have been flushed");
    }
}
