//! # jobweave
//!
//! A durable, transactional job orchestration engine: chains of jobs linked
//! by continuations and blockers, leased workers, exponential backoff, and
//! an at-least-once notify fabric for low-latency wakeups.
//!
//! ## Core Concepts
//!
//! jobweave separates **durable state** from **wakeups**:
//! - The [`store`] interface (L1) owns jobs, chains, and blocker edges —
//!   the only source of truth.
//! - The [`notify`] interface (L2) is a best-effort hint fabric: every
//!   notification a receiver gets must be followed by a re-read of the
//!   store, never trusted on its own.
//!
//! The key principle: a job chain's state never depends on a notification
//! being delivered — notify only shortens how long a worker sleeps before
//! its next poll would have found the same thing anyway.
//!
//! ## Architecture
//!
//! ```text
//! startJobChain ──► Store::create_job ──┐
//!                                        │
//!                          post-commit   ▼
//!                          notify   NotifyContext ──► Notify::notify_job_scheduled
//!                                                           │
//!                                                           ▼
//! Worker::run ──► Store::acquire_job ◄── wakes on hint or idle poll
//!     │
//!     ├─► Handler::handle()
//!     │
//!     └─► complete_job_chain ──► Store::complete_job ──► NotifyContext ──► Notify
//! ```
//!
//! - [`registry::TypeRegistry`] (C1) is the process-wide, read-only-after-
//!   construction map of job-type name to validators and continuation/
//!   blocker policy.
//! - [`backoff`] (C2) is pure scheduling math: retry delay and jittered sleep.
//! - [`core::Engine`] (C3) is the chain-lifecycle helper: `start_job_chain`,
//!   `wait_for_job_chain_completion`, `delete_job_chains`, and the
//!   workerless `complete_job_chain`.
//! - [`worker::Worker`] (C4) is the long-running consumer: acquire, dispatch
//!   to a [`worker::Handler`], lease-renew, and either persist a completion
//!   or reschedule with backoff.
//! - [`complete::complete`] (C5) is the shared completion primitive both
//!   `Worker` and `Engine::complete_job_chain` sit on top of.
//! - [`notify_context`] (C6) batches post-commit notifications so they
//!   never race ahead of the durable state they announce.
//! - [`observability`] (C7) is a single typed event callback plus
//!   duration/gauge hooks; this crate only emits, never transports.
//!
//! [`mem`] ships a reference in-memory `Store` and `Notify` good enough to
//! drive the test suite and any caller that doesn't need real durability.
//! It is not a production backend — concrete store adapters are this
//! crate's explicit boundary.

pub mod backoff;
pub mod complete;
pub mod core;
pub mod error;
pub mod model;
pub mod notify;
pub mod notify_context;
pub mod observability;
pub mod registry;
pub mod store;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod mem;
#[cfg(not(any(test, feature = "testing")))]
mod mem;

pub use complete::{AttemptOutcome, TxContext};
pub use core::{BlockerRef, Engine, StartBlockersFn, StartJobChainParams, StartJobChainResult, WaitOptions};
pub use error::{Categorizable, JobweaveError, SafeErrorCategory};
pub use model::{BlockerEdge, ChainView, DedupStrategy, Job, JobStatus};
pub use notify::{ChainCompletedSubscription, JobOwnershipLostSubscription, Notify, ScheduledHint, ScheduledSubscription};
pub use notify_context::{NotifyContext, with_notify_context};
pub use observability::{DurationMetric, Event, EventType, GaugeMetric, Level, NoopObserver, Observer};
pub use registry::{JobTypeDef, RegistryError, RegistryErrorCode, TargetPolicy, TypeRegistry, Validator};
pub use store::{Completion, CompletionEffect, NewJob, Store};
pub use worker::{Handler, Worker, WorkerConfig};
