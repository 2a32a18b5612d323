//! Test doubles: a configurable strategy and an in-memory host

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tempfile::TempDir;

use super::{ExecutionStrategy, StrategyFactory, TaskCallbacks};
use crate::config::RuntimeSettings;
use crate::error::{Error, Result};
use crate::store::{BlockStore, LocalBlockStore};
use crate::types::{AbortSignal, RefId, Reference, TaskDescriptor};

pub(crate) type MockBody =
    Arc<dyn Fn(&TaskDescriptor, &dyn TaskCallbacks, &AbortSignal) -> Result<()> + Send + Sync>;

/// Counters shared by every instance a factory builds
#[derive(Default)]
pub(crate) struct MockProbe {
    pub(crate) built: AtomicUsize,
    pub(crate) runs: AtomicUsize,
    pub(crate) aborts: AtomicUsize,
    pub(crate) streams_done: AtomicUsize,
}

impl MockProbe {
    pub(crate) fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockStrategy {
    handler: String,
    body: MockBody,
    probe: Arc<MockProbe>,
}

impl MockStrategy {
    /// Publishes `"done"` under every expected output
    pub(crate) fn publish_outputs() -> MockBody {
        Arc::new(|task, host, _| {
            for id in &task.expected_outputs {
                host.publish_ref(Reference::inline(id.clone(), b"done"));
            }
            Ok(())
        })
    }

    pub(crate) fn factory(handler: &str, body: MockBody) -> (StrategyFactory, Arc<MockProbe>) {
        let probe = Arc::new(MockProbe::default());
        let handler = handler.to_string();
        let shared = probe.clone();
        let factory: StrategyFactory = Arc::new(move || {
            shared.built.fetch_add(1, Ordering::SeqCst);
            Arc::new(MockStrategy {
                handler: handler.clone(),
                body: body.clone(),
                probe: shared.clone(),
            })
        });
        (factory, probe)
    }

    pub(crate) fn counting_factory(handler: &str) -> (StrategyFactory, Arc<AtomicUsize>) {
        let probe = Arc::new(AtomicUsize::new(0));
        let counter = probe.clone();
        let (inner, _) = Self::factory(handler, Self::publish_outputs());
        let factory: StrategyFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            inner()
        });
        (factory, probe)
    }
}

impl ExecutionStrategy for MockStrategy {
    fn handler(&self) -> &str {
        &self.handler
    }

    fn run(&self, task: &TaskDescriptor, host: &dyn TaskCallbacks, abort: &AbortSignal) -> Result<()> {
        self.probe.runs.fetch_add(1, Ordering::SeqCst);
        (self.body)(task, host, abort)
    }

    fn build_task_descriptor(&self, task: &mut TaskDescriptor, args: &Map<String, Value>) -> Result<()> {
        if args.get("reject").and_then(Value::as_bool).unwrap_or(false) {
            return Err(Error::malformed("mock child rejected"));
        }
        for (key, value) in args {
            if key != "small_task" && key != "executor_name" {
                task.handler_fields.insert(key.clone(), value.clone());
            }
        }
        if task.expected_outputs.is_empty() {
            task.expected_outputs = vec![format!("{}:out", task.task_id)];
        }
        Ok(())
    }

    fn abort(&self) {
        self.probe.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_streams_done(&self) {
        self.probe.streams_done.fetch_add(1, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────
// Fake Host
// ─────────────────────────────────────────────────────────────────

/// In-memory `TaskCallbacks` with a temporary block store
///
/// Published references become resolvable at once. References registered
/// with `defer` only appear once something asks to retrieve them.
pub(crate) struct FakeHost {
    published: Mutex<Vec<Reference>>,
    spawned: Mutex<Vec<TaskDescriptor>>,
    known: Mutex<HashMap<RefId, Reference>>,
    deferred: Mutex<HashMap<RefId, Reference>>,
    retrievals: Mutex<Vec<RefId>>,
    packages: Mutex<HashMap<String, Value>>,
    store: LocalBlockStore,
    settings: RuntimeSettings,
    _dir: TempDir,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self::with_settings(RuntimeSettings {
            stream_poll_interval_ms: 2,
            ..Default::default()
        })
    }

    pub(crate) fn with_threshold(bytes: usize) -> Self {
        Self::with_settings(RuntimeSettings {
            inline_threshold_bytes: bytes,
            stream_poll_interval_ms: 2,
            ..Default::default()
        })
    }

    pub(crate) fn with_wait_timeout_ms(ms: u64) -> Self {
        Self::with_settings(RuntimeSettings {
            stream_poll_interval_ms: 2,
            stream_wait_timeout_ms: ms,
            ..Default::default()
        })
    }

    pub(crate) fn with_settings(settings: RuntimeSettings) -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            published: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            known: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            retrievals: Mutex::new(Vec::new()),
            packages: Mutex::new(HashMap::new()),
            store: LocalBlockStore::open(dir.path()).unwrap(),
            settings,
            _dir: dir,
        }
    }

    pub(crate) fn know(&self, reference: Reference) {
        self.known.lock().insert(reference.id.clone(), reference);
    }

    pub(crate) fn defer(&self, reference: Reference) {
        self.deferred.lock().insert(reference.id.clone(), reference);
    }

    pub(crate) fn append(&self, id: &str, bytes: &[u8]) {
        self.store.append(id, bytes).unwrap();
    }

    pub(crate) fn set_package(&self, key: &str, value: Value) {
        self.packages.lock().insert(key.to_string(), value);
    }

    pub(crate) fn published(&self) -> Vec<Reference> {
        self.published.lock().clone()
    }

    pub(crate) fn spawned(&self) -> Vec<TaskDescriptor> {
        self.spawned.lock().clone()
    }

    pub(crate) fn retrievals(&self) -> Vec<RefId> {
        self.retrievals.lock().clone()
    }
}

impl TaskCallbacks for FakeHost {
    fn publish_ref(&self, reference: Reference) {
        self.known.lock().insert(reference.id.clone(), reference.clone());
        self.published.lock().push(reference);
    }

    fn spawn_task(&self, mut task: TaskDescriptor, args: &Map<String, Value>) -> Result<TaskDescriptor> {
        let mut spawned = self.spawned.lock();
        task.task_id = format!("child{}", spawned.len());
        task.hint_small_task = args.get("small_task").and_then(Value::as_bool).unwrap_or(false);
        for (key, value) in args {
            if key != "small_task" {
                task.handler_fields.insert(key.clone(), value.clone());
            }
        }
        task.expected_outputs = vec![format!("{}:retval", task.task_id)];
        spawned.push(task.clone());
        Ok(task)
    }

    fn resolve_ref(&self, reference: &Reference) -> Result<Reference> {
        if reference.is_consumable() {
            return Ok(reference.clone());
        }
        self.known
            .lock()
            .get(&reference.id)
            .cloned()
            .ok_or_else(|| Error::unavailable(reference.id.clone()))
    }

    fn retrieve_ref(&self, reference: &Reference) -> Result<Reference> {
        self.retrievals.lock().push(reference.id.clone());
        if let Some(found) = self.deferred.lock().remove(&reference.id) {
            self.know(found);
        }
        self.resolve_ref(reference)
    }

    fn package_lookup(&self, key: &str) -> Result<Value> {
        self.packages
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::PackageKeyMissing { key: key.to_string() })
    }

    fn block_store(&self) -> &dyn BlockStore {
        &self.store
    }

    fn runtime_settings(&self) -> &RuntimeSettings {
        &self.settings
    }
}
