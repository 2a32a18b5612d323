//! Cooperative task runtime
//!
//! Runs one user computation as a suspendable unit. The computation gets its
//! own thread and a [`TaskContext`]; it and the host trade control through a
//! pair of rendezvous channels, so exactly one of them runs at a time:
//!
//! - a fetch that cannot be satisfied yields `Suspended` and waits for the
//!   host to answer `Retry` or `Abandon`
//! - reaching the end of the entry point (or faulting, or panicking) yields
//!   the terminal `Halted`
//!
//! Continuations are never stack snapshots: [`ResumeState`] names an entry
//! point, its arguments and the persistent state, and any worker can start
//! it afresh.

mod context;
mod coroutine;
mod fetch;
mod outputs;
mod raw;

pub use context::*;
pub use coroutine::*;
pub use raw::*;

/// Handler that resumes continuations written by `TaskContext::spawn`
pub const CONTINUATION_HANDLER: &str = "script";

#[cfg(test)]
pub(crate) mod testing;
