//! Strategy trait definitions
//!
//! `ExecutionStrategy` is what the host drives; `TaskCallbacks` is what a
//! running strategy may ask of the host.

use serde_json::{Map, Value};

use crate::config::RuntimeSettings;
use crate::error::Result;
use crate::store::BlockStore;
use crate::types::{AbortSignal, Reference, TaskDescriptor};

/// Runs task descriptors for one handler
pub trait ExecutionStrategy: Send + Sync {
    /// Handler name this strategy answers to
    fn handler(&self) -> &str;

    /// Run one task to completion, publishing outputs through `host`
    ///
    /// `abort` belongs to the current cycle and is only ever set by the host.
    fn run(&self, task: &TaskDescriptor, host: &dyn TaskCallbacks, abort: &AbortSignal) -> Result<()>;

    /// Validate and complete a descriptor for a child task
    ///
    /// `args` are the spawn arguments. Errors here are the caller's fault.
    fn build_task_descriptor(
        &self,
        task: &mut TaskDescriptor,
        args: &Map<String, Value>,
    ) -> Result<()>;

    /// Cooperative abort; wake anything the strategy is blocked on
    fn abort(&self) {}

    /// No more streamed input will arrive for the running task
    fn notify_streams_done(&self) {}
}

/// Host services available to a running strategy
pub trait TaskCallbacks: Sync {
    /// Record an output of the current cycle
    fn publish_ref(&self, reference: Reference);

    /// Register a child task; returns the finalized descriptor
    fn spawn_task(&self, task: TaskDescriptor, args: &Map<String, Value>) -> Result<TaskDescriptor>;

    /// Resolve from what the cycle already knows, never running anything
    fn resolve_ref(&self, reference: &Reference) -> Result<Reference>;

    /// Resolve, fusing a registered small producer if needed
    fn retrieve_ref(&self, reference: &Reference) -> Result<Reference>;

    fn package_lookup(&self, key: &str) -> Result<Value>;

    fn block_store(&self) -> &dyn BlockStore;

    fn runtime_settings(&self) -> &RuntimeSettings;
}
