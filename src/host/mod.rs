//! Worker task host
//!
//! Owns one task cycle at a time: picks the execution strategy, runs it,
//! commits what it published and forwards what it spawned. Abort and
//! streams-done notifications arrive from other threads while a cycle runs.

mod task_host;

pub use task_host::*;
