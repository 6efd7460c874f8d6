//! Reference in-memory adapters (§10.5): a [`Store`](crate::store::Store)
//! and a [`Notify`](crate::notify::Notify) good enough to drive the
//! integration tests in `tests/` and any caller that doesn't need real
//! durability. Not a production backend — concrete stores remain an
//! explicit Non-goal (§1).

mod notify;
mod store;

pub use notify::MemNotify;
pub use store::MemStore;
