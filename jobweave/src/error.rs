//! Error taxonomy for the orchestration engine.
//!
//! Mirrors the distinction `seesaw::error` draws for command failures: a
//! small set of categories that downstream code (retry loops, logging,
//! persisted error text) can match on, rather than an opaque `anyhow::Error`
//! leaking adapter internals into the job record.

use std::fmt;

use crate::registry::RegistryError;

/// Safe, coarse-grained bucket for an error, independent of its source.
///
/// Used to decide retry eligibility and to avoid persisting adapter-internal
/// detail (connection strings, query text) into `last_attempt_error`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SafeErrorCategory {
    /// Caller or registry rejected the request; retrying would not help.
    Validation,
    /// Infrastructure hiccup (connection reset, deadlock, timeout); retry may succeed.
    Transient,
    /// Lease ownership was lost; not an error, just a state observation.
    LeaseLost,
    /// Everything else - surfaced as-is.
    Internal,
}

/// Maps a concrete error into a [`SafeErrorCategory`] without exposing its
/// internals. Store adapters implement this for their own error types so the
/// worker loop can decide whether to retry at the operation boundary.
pub trait Categorizable {
    fn categorize(&self) -> SafeErrorCategory;
}

/// Errors surfaced by the state store interface (L1).
///
/// The `Conflict` / `Backend` split follows the same reasoning as
/// `seesaw::persistence::StoreError`: a conflict is an expected, benign
/// outcome of optimistic concurrency, while a backend error is a genuine
/// infrastructure failure. Only `Backend` errors are retried by the worker
/// loop's transient-error predicate; `Conflict` is folded into `LEASE_LOST`
/// handling by callers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lease lost or row modified concurrently")]
    Conflict,
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl Categorizable for StoreError {
    fn categorize(&self) -> SafeErrorCategory {
        match self {
            StoreError::Conflict => SafeErrorCategory::LeaseLost,
            StoreError::Backend(_) => SafeErrorCategory::Transient,
        }
    }
}

/// Errors surfaced by the notify fabric interface (L2).
///
/// Notify failures are always non-fatal: the store is already durable and
/// polling will eventually observe the state, so the worker loop logs and
/// swallows these (see `§7 Notify transient errors`).
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notify backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Top-level error type for orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum JobweaveError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("lease lost for job {job_id}")]
    LeaseLost { job_id: uuid::Uuid },

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation canceled")]
    Canceled,

    #[error("job type {0:?} is not registered")]
    NotRegistered(String),

    #[error("job type {0:?} is already registered")]
    AlreadyRegistered(String),
}

impl Categorizable for JobweaveError {
    fn categorize(&self) -> SafeErrorCategory {
        match self {
            JobweaveError::Registry(_) => SafeErrorCategory::Validation,
            JobweaveError::Store(e) => e.categorize(),
            JobweaveError::LeaseLost { .. } => SafeErrorCategory::LeaseLost,
            JobweaveError::HandlerFailed(_) => SafeErrorCategory::Internal,
            JobweaveError::Timeout | JobweaveError::Canceled => SafeErrorCategory::Internal,
            JobweaveError::NotRegistered(_) | JobweaveError::AlreadyRegistered(_) => {
                SafeErrorCategory::Validation
            }
        }
    }
}

/// Truncates persisted error text to a bounded size (§7: "≤ 8 KiB").
///
/// Open question (b) in the design notes leaves the exact cap unspecified;
/// 8 KiB is adopted as the concrete default here.
pub const MAX_PERSISTED_ERROR_BYTES: usize = 8 * 1024;

pub fn truncate_error_text(text: &str) -> String {
    if text.len() <= MAX_PERSISTED_ERROR_BYTES {
        return text.to_string();
    }
    let mut end = MAX_PERSISTED_ERROR_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &text[..end])
}

impl fmt::Debug for SafeErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafeErrorCategory::Validation => "validation",
            SafeErrorCategory::Transient => "transient",
            SafeErrorCategory::LeaseLost => "lease_lost",
            SafeErrorCategory::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}
