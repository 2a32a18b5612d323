//! Task host implementation
//!
//! State is split in two, each behind its own lock:
//! - root state (current task, execution record, root task, cached
//!   strategy), shared with the abort/notify side channel
//! - cycle state (published refs, spawned children, reference cache,
//!   small-task index), touched only by the running cycle's callbacks
//!
//! Neither lock is held while a strategy runs. A third lock serializes
//! whole cycles, so at most one runs however many threads call in.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeSettings;
use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::store::BlockStore;
use crate::strategy::{ExecutionStrategy, StrategyRegistry, TaskCallbacks};
use crate::types::{AbortSignal, RefId, Reference, TaskDescriptor};

// ─────────────────────────────────────────────────────────────────
// Execution Record
// ─────────────────────────────────────────────────────────────────

/// The running cycle, as seen by the abort side channel
#[derive(Clone)]
pub struct ExecutionRecord {
    pub task_id: String,
    /// Distinguishes consecutive cycles of the same task id
    pub generation: u64,
    strategy: Arc<dyn ExecutionStrategy>,
    signal: AbortSignal,
}

impl ExecutionRecord {
    fn abort(&self) {
        self.signal.trigger();
        self.strategy.abort();
    }
}

#[derive(Default)]
struct RootState {
    current_task_id: Option<String>,
    current_execution_record: Option<ExecutionRecord>,
    root_task_id: Option<String>,
    root_generation: u64,
    /// Kept across cycles while the handler stays the same
    root_strategy: Option<Arc<dyn ExecutionStrategy>>,
}

#[derive(Default)]
struct CycleState {
    task_id: String,
    published_refs: Vec<Reference>,
    spawned_tasks: Vec<TaskDescriptor>,
    reference_cache: HashMap<RefId, Reference>,
    /// Output id -> position in `spawned_tasks`, small tasks only
    task_for_output_id: HashMap<RefId, usize>,
    spawn_counter: u64,
    signal: AbortSignal,
}

/// Id of the `counter`-th child spawned by `parent`
pub fn child_task_id(parent: &str, counter: u64) -> String {
    let digest = Sha256::digest(format!("{}:{}", parent, counter).as_bytes());
    hex::encode(digest)
}

// ─────────────────────────────────────────────────────────────────
// Task Host
// ─────────────────────────────────────────────────────────────────

pub struct TaskHost {
    registry: Arc<StrategyRegistry>,
    coordinator: Arc<dyn Coordinator>,
    block_store: Arc<dyn BlockStore>,
    settings: RuntimeSettings,
    packages: BTreeMap<String, Value>,
    root: Mutex<RootState>,
    cycle: Mutex<CycleState>,
    /// Held for the whole of a cycle
    running: Mutex<()>,
    next_generation: AtomicU64,
}

/// Resets host state when a cycle ends, however it ends
struct CycleGuard<'h> {
    host: &'h TaskHost,
    generation: u64,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        *self.host.cycle.lock() = CycleState::default();

        let mut root = self.host.root.lock();
        let current = root
            .current_execution_record
            .as_ref()
            .map(|record| record.generation);
        if current == Some(self.generation) {
            root.current_task_id = None;
            root.current_execution_record = None;
        }
        if root.root_generation == self.generation {
            root.root_task_id = None;
        }
    }
}

impl TaskHost {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        coordinator: Arc<dyn Coordinator>,
        block_store: Arc<dyn BlockStore>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            registry,
            coordinator,
            block_store,
            settings,
            packages: BTreeMap::new(),
            root: Mutex::new(RootState::default()),
            cycle: Mutex::new(CycleState::default()),
            running: Mutex::new(()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Values answered by `package_lookup`
    pub fn with_packages(mut self, packages: BTreeMap<String, Value>) -> Self {
        self.packages = packages;
        self
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Run one full task cycle
    ///
    /// A descriptor that cannot be run at all is rejected without contacting
    /// the coordinator; any later fault is reported through `task_failed`
    /// and returned. Concurrent callers are queued behind the running cycle.
    pub fn handle_input(&self, task: TaskDescriptor) -> Result<()> {
        task.validate_for_execution()?;

        let _running = self.running.lock();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        info!(task_id = %task.task_id, handler = %task.handler, generation, "Task cycle started");

        match self.run_cycle(&task, generation) {
            Ok(()) => {
                info!(
                    task_id = %task.task_id,
                    generation,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Task cycle committed"
                );
                Ok(())
            }
            Err(e) => {
                if e.is_caller_fault() {
                    warn!(task_id = %task.task_id, generation, "{}", e.format_for_log());
                } else {
                    error!(task_id = %task.task_id, generation, "{}", e.format_for_log());
                }
                if let Err(report) = self.coordinator.task_failed(&task.task_id, &e) {
                    error!(task_id = %task.task_id, error = %report, "Failed to report task failure");
                }
                Err(e)
            }
        }
    }

    fn run_cycle(&self, task: &TaskDescriptor, generation: u64) -> Result<()> {
        let signal = AbortSignal::new();
        let strategy = self.begin_cycle(task, generation, &signal)?;
        let _guard = CycleGuard {
            host: self,
            generation,
        };

        strategy.run(task, self, &signal)?;

        let (published, spawned) = {
            let mut cycle = self.cycle.lock();
            (
                std::mem::take(&mut cycle.published_refs),
                std::mem::take(&mut cycle.spawned_tasks),
            )
        };

        let outputs: BTreeMap<RefId, Reference> = published
            .into_iter()
            .map(|reference| (reference.id.clone(), reference))
            .collect();
        self.coordinator.commit_task(&task.task_id, outputs)?;

        if !spawned.is_empty() {
            self.coordinator.spawn_tasks(&task.task_id, spawned)?;
        }
        Ok(())
    }

    /// Pick the strategy and seed root and cycle state
    fn begin_cycle(
        &self,
        task: &TaskDescriptor,
        generation: u64,
        signal: &AbortSignal,
    ) -> Result<Arc<dyn ExecutionStrategy>> {
        let strategy = {
            let mut root = self.root.lock();
            let strategy = match &root.root_strategy {
                Some(cached) if cached.handler() == task.handler => cached.clone(),
                _ => {
                    root.root_strategy = None;
                    let fresh = self.registry.acquire(&task.handler)?;
                    debug!(handler = %task.handler, "Strategy acquired");
                    root.root_strategy = Some(fresh.clone());
                    fresh
                }
            };
            root.current_task_id = Some(task.task_id.clone());
            root.current_execution_record = Some(ExecutionRecord {
                task_id: task.task_id.clone(),
                generation,
                strategy: strategy.clone(),
                signal: signal.clone(),
            });
            root.root_task_id = Some(task.task_id.clone());
            root.root_generation = generation;
            strategy
        };

        let mut cycle = self.cycle.lock();
        *cycle = CycleState {
            task_id: task.task_id.clone(),
            reference_cache: task
                .inputs
                .iter()
                .flatten()
                .map(|(id, reference)| (id.clone(), reference.clone()))
                .collect(),
            signal: signal.clone(),
            ..CycleState::default()
        };
        Ok(strategy)
    }

    // ─────────────────────────────────────────────────────────────
    // Side channel
    // ─────────────────────────────────────────────────────────────

    /// Cooperatively abort `task_id` if it is the running task
    ///
    /// Returns whether an abort was delivered. A task that already finished
    /// is left alone.
    pub fn abort_task(&self, task_id: &str) -> bool {
        self.abort_matching(task_id, None)
    }

    /// Like `abort_task`, but only for the given cycle
    pub fn abort_task_at(&self, task_id: &str, generation: u64) -> bool {
        self.abort_matching(task_id, Some(generation))
    }

    fn abort_matching(&self, task_id: &str, generation: Option<u64>) -> bool {
        let mut root = self.root.lock();
        let matches = root.current_execution_record.as_ref().map_or(false, |record| {
            record.task_id == task_id && generation.map_or(true, |g| g == record.generation)
        });
        if !matches {
            debug!(task_id, ?generation, "Abort ignored, task not running");
            return false;
        }

        if let Some(record) = root.current_execution_record.take() {
            info!(task_id, generation = record.generation, "Aborting task");
            record.abort();
        }
        root.current_task_id = None;
        true
    }

    /// Tell the root task's strategy that no more streamed input will arrive
    pub fn notify_streams_done(&self, task_id: &str) -> bool {
        let root = self.root.lock();
        if root.root_task_id.as_deref() != Some(task_id) {
            debug!(task_id, "Streams-done ignored, not the root task");
            return false;
        }
        if let Some(strategy) = &root.root_strategy {
            debug!(task_id, handler = %strategy.handler(), "Streams done");
            strategy.notify_streams_done();
        }
        true
    }

    /// `(task_id, generation)` of the running cycle
    pub fn current_cycle(&self) -> Option<(String, u64)> {
        self.root
            .lock()
            .current_execution_record
            .as_ref()
            .map(|record| (record.task_id.clone(), record.generation))
    }

    // ─────────────────────────────────────────────────────────────
    // Fusion
    // ─────────────────────────────────────────────────────────────

    /// Run a small producer inline, through the same path as a root task
    fn run_fused(&self, producer: &TaskDescriptor) -> Result<()> {
        let signal = self.cycle.lock().signal.clone();
        let strategy = self.registry.acquire(&producer.handler)?;
        strategy.run(producer, self, &signal)
    }
}

impl TaskCallbacks for TaskHost {
    fn publish_ref(&self, reference: Reference) {
        let mut cycle = self.cycle.lock();
        debug!(task_id = %cycle.task_id, ref_id = %reference.id, kind = reference.kind_name(), "Reference published");
        cycle
            .reference_cache
            .insert(reference.id.clone(), reference.clone());
        cycle.published_refs.push(reference);
    }

    fn spawn_task(&self, mut task: TaskDescriptor, args: &Map<String, Value>) -> Result<TaskDescriptor> {
        let (parent, counter) = {
            let mut cycle = self.cycle.lock();
            let counter = cycle.spawn_counter;
            cycle.spawn_counter += 1;
            (cycle.task_id.clone(), counter)
        };

        task.task_id = child_task_id(&parent, counter);
        // Either source marks the child small; neither can clear the other
        let small = args
            .get("small_task")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        task.small_task |= small;
        task.hint_small_task |= small || task.small_task;

        let strategy = self.registry.acquire(&task.handler)?;
        strategy.build_task_descriptor(&mut task, args)?;

        let mut cycle = self.cycle.lock();
        let position = cycle.spawned_tasks.len();
        if task.hint_small_task {
            for id in &task.expected_outputs {
                cycle.task_for_output_id.insert(id.clone(), position);
            }
        }
        debug!(
            parent = %parent,
            task_id = %task.task_id,
            handler = %task.handler,
            small = task.hint_small_task,
            "Child task spawned"
        );
        cycle.spawned_tasks.push(task.clone());
        Ok(task)
    }

    fn resolve_ref(&self, reference: &Reference) -> Result<Reference> {
        if reference.is_consumable() {
            return Ok(reference.clone());
        }
        self.cycle
            .lock()
            .reference_cache
            .get(&reference.id)
            .cloned()
            .ok_or_else(|| Error::unavailable(reference.id.clone()))
    }

    fn retrieve_ref(&self, reference: &Reference) -> Result<Reference> {
        let unavailable = match self.resolve_ref(reference) {
            Err(e @ Error::ReferenceUnavailable { .. }) => e,
            other => return other,
        };

        let producer = {
            let cycle = self.cycle.lock();
            cycle
                .task_for_output_id
                .get(&reference.id)
                .map(|&position| (position, cycle.spawned_tasks[position].clone()))
        };
        let Some((position, mut producer)) = producer else {
            return Err(unavailable);
        };

        let mut inputs = BTreeMap::new();
        for (id, dependency) in &producer.dependencies {
            match self.resolve_ref(dependency) {
                Ok(resolved) => {
                    inputs.insert(id.clone(), resolved);
                }
                Err(e) => {
                    debug!(
                        ref_id = %reference.id,
                        producer = %producer.task_id,
                        dependency = %id,
                        error = %e,
                        "Small producer not runnable yet"
                    );
                    return Err(unavailable);
                }
            }
        }

        {
            let mut cycle = self.cycle.lock();
            cycle.spawned_tasks[position].inputs = Some(inputs.clone());
            for id in &producer.expected_outputs {
                cycle.task_for_output_id.remove(id);
            }
        }
        producer.inputs = Some(inputs);

        info!(ref_id = %reference.id, producer = %producer.task_id, handler = %producer.handler, "Running small producer inline");
        if let Err(e) = self.run_fused(&producer) {
            warn!(
                ref_id = %reference.id,
                producer = %producer.task_id,
                retryable = e.is_retryable(),
                "Small producer failed: {}",
                e.format_for_log()
            );
        }
        self.resolve_ref(reference)
    }

    fn package_lookup(&self, key: &str) -> Result<Value> {
        self.packages
            .get(key)
            .cloned()
            .ok_or_else(|| Error::PackageKeyMissing {
                key: key.to_string(),
            })
    }

    fn block_store(&self) -> &dyn BlockStore {
        self.block_store.as_ref()
    }

    fn runtime_settings(&self) -> &RuntimeSettings {
        &self.settings
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
impl TaskHost {
    fn cycle_is_empty(&self) -> bool {
        let cycle = self.cycle.lock();
        cycle.published_refs.is_empty()
            && cycle.spawned_tasks.is_empty()
            && cycle.reference_cache.is_empty()
            && cycle.task_for_output_id.is_empty()
            && cycle.spawn_counter == 0
    }

    fn spawned_snapshot(&self) -> Vec<TaskDescriptor> {
        self.cycle.lock().spawned_tasks.clone()
    }

    fn root_task_id(&self) -> Option<String> {
        self.root.lock().root_task_id.clone()
    }
}
