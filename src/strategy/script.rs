//! Script strategy
//!
//! Runs a compiled-in program under the cooperative runtime. A task names
//! its program through `code_ref` and, for continuations written by
//! `TaskContext::spawn`, the entry point to resume through `coro_ref`.
//!
//! Handler fields:
//! - `code_ref`: reference whose bytes are the program name
//! - `coro_ref`: optional CBOR `ResumeState`
//! - `entry_args`: arguments for `main` when there is no `coro_ref`
//! - `await_streams`: hold the cycle open until streams are reported done

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{
    publish_bytes, read_reference_bytes, ExecutionStrategy, Program, ProgramRegistry,
    ScriptChannel, TaskCallbacks, MAIN_ENTRY,
};
use crate::error::{Error, Result};
use crate::runtime::{run_to_halt, Launch, Outcome, PersistentState, Resume, ResumeState};
use crate::types::{AbortSignal, RefId, RefKind, Reference, TaskDescriptor};

// ─────────────────────────────────────────────────────────────────
// Stream Gate
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    StreamsDone,
    Aborted,
    TimedOut,
}

#[derive(Default)]
struct GateState {
    streams_done: bool,
    aborted: bool,
}

/// Where a task waits for its streamed inputs to finish
#[derive(Default)]
pub struct StreamGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl StreamGate {
    pub fn reset(&self) {
        *self.state.lock() = GateState::default();
    }

    pub fn streams_done(&self) {
        self.state.lock().streams_done = true;
        self.changed.notify_all();
    }

    pub fn abort(&self) {
        self.state.lock().aborted = true;
        self.changed.notify_all();
    }

    /// Block until streams are done, the task is aborted or `timeout` passes
    ///
    /// `signal` is polled as well, so a host-side abort is seen even if the
    /// strategy's own `abort` never runs.
    pub fn wait(&self, signal: &AbortSignal, timeout: Duration, poll: Duration) -> GateOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.aborted || signal.is_triggered() {
                return GateOutcome::Aborted;
            }
            if state.streams_done {
                return GateOutcome::StreamsDone;
            }
            let now = Instant::now();
            if now >= deadline {
                return GateOutcome::TimedOut;
            }
            self.changed.wait_for(&mut state, poll.min(deadline - now));
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Script Strategy
// ─────────────────────────────────────────────────────────────────

pub struct ScriptStrategy {
    programs: Arc<ProgramRegistry>,
    gate: StreamGate,
}

/// Where a run starts
struct StartPoint {
    program: Arc<Program>,
    entry: String,
    args: Vec<Value>,
    state: PersistentState,
}

impl ScriptStrategy {
    pub fn new(programs: Arc<ProgramRegistry>) -> Self {
        Self {
            programs,
            gate: StreamGate::default(),
        }
    }

    fn program(&self, name: &str) -> Result<Arc<Program>> {
        self.programs
            .get(name.trim())
            .ok_or_else(|| Error::UnknownProgram {
                name: name.trim().to_string(),
            })
    }

    fn program_name(host: &dyn TaskCallbacks, code_ref: &Reference) -> Result<String> {
        let bytes = read_reference_bytes(host, code_ref)?;
        String::from_utf8(bytes).map_err(|e| Error::decode(code_ref.id.clone(), e))
    }

    fn start_point(&self, task: &TaskDescriptor, host: &dyn TaskCallbacks) -> Result<StartPoint> {
        let code_ref = task
            .reference_field("code_ref")?
            .ok_or_else(|| Error::malformed(format!("script task {} has no code_ref", task.task_id)))?;
        let program = self.program(&Self::program_name(host, &code_ref)?)?;

        let (entry, args, mut state) = match task.reference_field("coro_ref")? {
            Some(coro_ref) => {
                let bytes = read_reference_bytes(host, &coro_ref)?;
                let resume: ResumeState = ciborium::from_reader(&bytes[..])
                    .map_err(|e| Error::decode(coro_ref.id.clone(), e))?;
                (resume.entry, resume.args, resume.persistent_state)
            }
            None => (
                MAIN_ENTRY.to_string(),
                entry_args(task.field("entry_args"))?,
                PersistentState::default(),
            ),
        };
        state.code_ref = Some(code_ref);

        Ok(StartPoint {
            program,
            entry,
            args,
            state,
        })
    }

    fn await_streams(&self, task: &TaskDescriptor, host: &dyn TaskCallbacks, abort: &AbortSignal) -> Result<()> {
        let settings = host.runtime_settings();
        match self.gate.wait(abort, settings.wait_timeout(), settings.poll_interval()) {
            GateOutcome::StreamsDone => Ok(()),
            GateOutcome::Aborted => Err(Error::Aborted {
                task_id: task.task_id.clone(),
            }),
            GateOutcome::TimedOut => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("task {} gave up waiting for its streams", task.task_id),
            ))),
        }
    }
}

fn entry_args(value: Option<&Value>) -> Result<Vec<Value>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(args)) => Ok(args.clone()),
        Some(_) => Err(Error::malformed("entry_args must be an array")),
    }
}

/// Id the return value is published under
fn retval_id(task: &TaskDescriptor) -> RefId {
    task.expected_outputs
        .first()
        .cloned()
        .unwrap_or_else(|| format!("{}:retval", task.task_id))
}

impl ExecutionStrategy for ScriptStrategy {
    fn handler(&self) -> &str {
        "script"
    }

    fn run(&self, task: &TaskDescriptor, host: &dyn TaskCallbacks, abort: &AbortSignal) -> Result<()> {
        self.gate.reset();

        let start = self.start_point(task, host)?;
        let entry = start.program.lookup(&start.entry).ok_or_else(|| Error::UnknownProgram {
            name: format!("{}::{}", start.program.name, start.entry),
        })?;
        info!(task_id = %task.task_id, program = %start.program.name, entry = %start.entry, "Starting computation");

        let channel = ScriptChannel::new(task, host);
        let mut abandoned: Option<RefId> = None;
        let launch = Launch {
            task_id: task.task_id.clone(),
            entry,
            args: start.args,
            state: start.state,
        };

        let halted = run_to_halt(&channel, launch, host.runtime_settings(), abort, |awaiting| {
            if abort.is_triggered() {
                return Resume::Abandon;
            }
            match host.retrieve_ref(awaiting) {
                Ok(_) => Resume::Retry,
                Err(e) => {
                    debug!(task_id = %task.task_id, ref_id = %awaiting.id, error = %e, "Reference cannot be produced here");
                    abandoned = Some(awaiting.id.clone());
                    Resume::Abandon
                }
            }
        })?;

        if abort.is_triggered() {
            return Err(Error::Aborted {
                task_id: task.task_id.clone(),
            });
        }

        let leaked = &halted.persistent_state.ref_dependencies;
        if !leaked.is_empty() {
            warn!(task_id = %task.task_id, dependencies = ?leaked, "Computation halted holding dependencies");
        }

        let value = match halted.outcome {
            Outcome::Done(value) => value,
            Outcome::Fault { message, trace } => {
                if let Some(id) = abandoned {
                    return Err(Error::unavailable(id));
                }
                return Err(Error::ComputationFault {
                    task_id: task.task_id.clone(),
                    message,
                    trace,
                });
            }
        };

        let retval = publish_bytes(host, &retval_id(task), &serde_json::to_vec(&value)?)?;
        debug!(task_id = %task.task_id, retval = %retval, reason = ?halted.reason, suspensions = halted.suspensions, "Computation done");

        if task.field("await_streams").and_then(Value::as_bool).unwrap_or(false) {
            self.await_streams(task, host, abort)?;
        }
        Ok(())
    }

    fn build_task_descriptor(&self, task: &mut TaskDescriptor, args: &Map<String, Value>) -> Result<()> {
        let reference = |name: &str| -> Result<Option<Reference>> {
            match args.get(name) {
                None | Some(Value::Null) => Ok(None),
                Some(value) => serde_json::from_value(value.clone())
                    .map(Some)
                    .map_err(|e| Error::malformed(format!("'{}' is not a reference: {}", name, e))),
            }
        };

        let code_ref = reference("code_ref")?
            .ok_or_else(|| Error::malformed("script task needs a code_ref"))?;
        if let RefKind::InlineData { .. } = code_ref.kind {
            let name = code_ref
                .inline_bytes()
                .unwrap_or_else(|| Ok(Vec::new()))?;
            self.program(&String::from_utf8_lossy(&name))?;
        }
        let coro_ref = reference("coro_ref")?;
        let args_value = args.get("entry_args").cloned();
        entry_args(args_value.as_ref())?;

        task.add_dependency(&code_ref);
        task.handler_fields
            .insert("code_ref".into(), serde_json::to_value(&code_ref)?);
        if let Some(coro_ref) = coro_ref {
            task.add_dependency(&coro_ref);
            task.handler_fields
                .insert("coro_ref".into(), serde_json::to_value(&coro_ref)?);
        }
        if let Some(value) = args_value {
            task.handler_fields.insert("entry_args".into(), value);
        }
        if let Some(value) = args.get("await_streams") {
            task.handler_fields.insert("await_streams".into(), value.clone());
        }
        if task.expected_outputs.is_empty() {
            task.expected_outputs = vec![format!("{}:retval", task.task_id)];
        }
        Ok(())
    }

    fn abort(&self) {
        self.gate.abort();
    }

    fn notify_streams_done(&self) {
        self.gate.streams_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::FakeHost;
    use serde_json::json;

    fn strategy() -> ScriptStrategy {
        ScriptStrategy::new(Arc::new(ProgramRegistry::with_builtins()))
    }

    fn script_task(program: &str, entry_args: Value) -> TaskDescriptor {
        let mut task = TaskDescriptor::new("script");
        task.task_id = "s1".into();
        task.handler_fields.insert(
            "code_ref".into(),
            serde_json::to_value(Reference::inline("code", program.as_bytes())).unwrap(),
        );
        task.handler_fields.insert("entry_args".into(), entry_args);
        task
    }

    fn retval(host: &FakeHost, id: &str) -> Value {
        let published = host.published();
        let reference = published.iter().find(|r| r.id == id).unwrap();
        serde_json::from_slice(&reference.inline_bytes().unwrap().unwrap()).unwrap()
    }

    #[test]
    fn test_sum_of_available_inputs() {
        let host = FakeHost::new();
        host.know(Reference::inline("a", b"2"));
        let task = script_task(
            "sum",
            json!([Reference::future("a"), Reference::inline("b", b"40")]),
        );

        strategy().run(&task, &host, &AbortSignal::new()).unwrap();
        assert_eq!(retval(&host, "s1:retval"), json!(42));
        assert!(host.retrievals().is_empty());
    }

    #[test]
    fn test_suspended_fetch_retrieves_and_resumes() {
        let host = FakeHost::new();
        host.defer(Reference::inline("late", b"5"));
        let task = script_task("sum", json!([Reference::future("late")]));

        strategy().run(&task, &host, &AbortSignal::new()).unwrap();
        assert_eq!(host.retrievals(), vec!["late"]);
        assert_eq!(retval(&host, "s1:retval"), json!(5));
    }

    #[test]
    fn test_unretrievable_input_is_unavailable() {
        let host = FakeHost::new();
        let task = script_task("sum", json!([Reference::future("never")]));

        let err = strategy().run(&task, &host, &AbortSignal::new()).unwrap_err();
        assert!(matches!(err, Error::ReferenceUnavailable { ref id } if id == "never"));
        assert!(host.published().is_empty());
    }

    #[test]
    fn test_program_error_is_computation_fault() {
        let host = FakeHost::new();
        let task = script_task("sum", json!([Reference::inline("x", b"\"text\"")]));

        let err = strategy().run(&task, &host, &AbortSignal::new()).unwrap_err();
        match err {
            Error::ComputationFault { task_id, message, .. } => {
                assert_eq!(task_id, "s1");
                assert!(message.contains("not a number"));
            }
            other => panic!("Expected computation fault, got {:?}", other),
        }
    }

    #[test]
    fn test_resume_from_continuation() {
        let host = FakeHost::new();
        let state = ResumeState {
            entry: "square".into(),
            args: vec![json!(7)],
            persistent_state: PersistentState::default(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&state, &mut bytes).unwrap();

        let mut task = script_task("fanout", Value::Null);
        task.expected_outputs = vec!["child:retval".into()];
        task.handler_fields.insert(
            "coro_ref".into(),
            serde_json::to_value(Reference::inline("coro", &bytes)).unwrap(),
        );

        strategy().run(&task, &host, &AbortSignal::new()).unwrap();
        assert_eq!(retval(&host, "child:retval"), json!(49));
    }

    #[test]
    fn test_scatter_spawns_continuations() {
        let host = FakeHost::new();
        let task = script_task("scatter", json!([2]));

        strategy().run(&task, &host, &AbortSignal::new()).unwrap();
        let spawned = host.spawned();
        assert_eq!(spawned.len(), 2);
        assert!(spawned.iter().all(|t| t.handler == "script" && !t.hint_small_task));
        assert_eq!(retval(&host, "s1:retval"), json!(["child0:retval", "child1:retval"]));
        // Two continuations plus the return value
        assert_eq!(host.published().len(), 3);
    }

    #[test]
    fn test_unknown_program() {
        let host = FakeHost::new();
        let err = strategy()
            .run(&script_task("nope", json!([])), &host, &AbortSignal::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownProgram { .. }));
    }

    #[test]
    fn test_build_descriptor() {
        let strategy = strategy();
        let mut task = TaskDescriptor::new("script");
        task.task_id = "c1".into();
        let args = json!({
            "code_ref": Reference::inline("code", b"fanout"),
            "coro_ref": Reference::future("p:coro1"),
        });
        strategy
            .build_task_descriptor(&mut task, args.as_object().unwrap())
            .unwrap();

        assert_eq!(task.expected_outputs, vec!["c1:retval"]);
        assert!(task.dependencies.contains_key("p:coro1"));
        assert!(!task.dependencies.contains_key("code"));

        let mut bad = TaskDescriptor::new("script");
        let args = json!({"code_ref": Reference::inline("code", b"missing")});
        let err = strategy
            .build_task_descriptor(&mut bad, args.as_object().unwrap())
            .unwrap_err();
        assert!(err.is_caller_fault());
    }

    #[test]
    fn test_await_streams_released_by_notification() {
        let host = FakeHost::new();
        let strategy = Arc::new(strategy());
        let mut task = script_task("sum", json!([]));
        task.handler_fields.insert("await_streams".into(), json!(true));

        std::thread::scope(|scope| {
            let runner = scope.spawn(|| strategy.run(&task, &host, &AbortSignal::new()));
            while host.published().is_empty() {
                std::thread::sleep(Duration::from_millis(2));
            }
            strategy.notify_streams_done();
            runner.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_gate_sees_abort_signal() {
        let gate = StreamGate::default();
        let signal = AbortSignal::new();
        signal.trigger();
        assert_eq!(
            gate.wait(&signal, Duration::from_secs(5), Duration::from_millis(1)),
            GateOutcome::Aborted
        );

        let gate = StreamGate::default();
        assert_eq!(
            gate.wait(&AbortSignal::new(), Duration::from_millis(5), Duration::from_millis(1)),
            GateOutcome::TimedOut
        );
    }
}
