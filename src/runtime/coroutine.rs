//! Suspend/resume driver
//!
//! `run_to_halt` starts a computation on a scoped thread and blocks the
//! calling (host) thread until the computation either suspends on a
//! reference or halts. The two sides rendezvous over capacity-one channels,
//! so control is handed over explicitly and never shared.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::context::{EntryPoint, HaltReason, PersistentState, TaskContext};
use crate::config::RuntimeSettings;
use crate::error::{Error, Result};
use crate::protocol::HostChannel;
use crate::types::{AbortSignal, Reference};

/// Host's answer to a suspension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// The value may exist now; repeat the request once
    Retry,
    /// Give up; the pending fetch fails with reference-unavailable
    Abandon,
}

pub(crate) enum Yield {
    Suspended {
        reason: HaltReason,
        awaiting: Reference,
    },
    Halted(Box<Halted>),
}

/// Computation side of the handover
pub(crate) struct Suspender {
    yields: mpsc::Sender<Yield>,
    resumes: mpsc::Receiver<Resume>,
}

impl Suspender {
    /// Hand control to the host and wait to be resumed
    pub(crate) fn suspend(&mut self, reason: HaltReason, awaiting: &Reference) -> Resume {
        let suspended = Yield::Suspended {
            reason,
            awaiting: awaiting.clone(),
        };
        if self.yields.blocking_send(suspended).is_err() {
            return Resume::Abandon;
        }
        self.resumes.blocking_recv().unwrap_or(Resume::Abandon)
    }

    fn halt(&self, halted: Halted) {
        if self.yields.blocking_send(Yield::Halted(Box::new(halted))).is_err() {
            warn!("Host stopped listening before the computation halted");
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Launch and Halt
// ─────────────────────────────────────────────────────────────────

/// A computation ready to start
pub struct Launch {
    pub task_id: String,
    pub entry: EntryPoint,
    pub args: Vec<Value>,
    pub state: PersistentState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done(Value),
    Fault { message: String, trace: String },
}

/// Terminal state of a computation
#[derive(Debug, Clone)]
pub struct Halted {
    pub reason: HaltReason,
    pub outcome: Outcome,
    pub persistent_state: PersistentState,
    /// Number of times the computation yielded on a reference
    pub suspensions: u32,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "computation panicked".to_string()
    }
}

/// Entry wrapper: run the entry point and record how it ended
fn start_computation(mut ctx: TaskContext<'_>, entry: EntryPoint, args: Vec<Value>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| entry(&mut ctx, args)));

    let (reason, outcome) = match result {
        Ok(Ok(value)) => (HaltReason::Done, Outcome::Done(value)),
        Ok(Err(err)) => (
            HaltReason::RuntimeException,
            Outcome::Fault {
                message: err.to_string(),
                trace: format!("{:?}", err),
            },
        ),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            (
                HaltReason::RuntimeException,
                Outcome::Fault {
                    trace: format!("panicked: {}", message),
                    message,
                },
            )
        }
    };

    let TaskContext {
        persistent_state,
        suspender,
        ..
    } = ctx;

    suspender.halt(Halted {
        reason,
        outcome,
        persistent_state,
        suspensions: 0,
    });
}

/// Run a computation until it halts
///
/// `on_suspend` runs on the calling thread each time the computation waits
/// on a reference; its answer decides whether the fetch is retried.
pub fn run_to_halt<F>(
    channel: &dyn HostChannel,
    launch: Launch,
    settings: &RuntimeSettings,
    abort: &AbortSignal,
    mut on_suspend: F,
) -> Result<Halted>
where
    F: FnMut(&Reference) -> Resume,
{
    let (yield_tx, mut yields) = mpsc::channel(1);
    let (resumes, resume_rx) = mpsc::channel(1);

    let Launch {
        task_id,
        entry,
        args,
        state,
    } = launch;

    let short_id: String = task_id.chars().take(12).collect();
    let ctx = TaskContext::new(
        task_id.clone(),
        channel,
        state,
        Suspender {
            yields: yield_tx,
            resumes: resume_rx,
        },
        abort.clone(),
        settings.clone(),
    );

    thread::scope(|scope| {
        let computation = thread::Builder::new()
            .name(format!("task-{}", short_id))
            .spawn_scoped(scope, move || start_computation(ctx, entry, args))
            .map_err(|e| Error::Internal(format!("failed to start computation thread: {}", e)))?;

        let mut suspensions = 0;
        let halted = loop {
            match yields.blocking_recv() {
                Some(Yield::Suspended { reason, awaiting }) => {
                    suspensions += 1;
                    debug!(task_id = %task_id, ref_id = %awaiting.id, ?reason, "Computation suspended");
                    let decision = on_suspend(&awaiting);
                    debug!(task_id = %task_id, ref_id = %awaiting.id, ?decision, "Resuming computation");
                    if resumes.blocking_send(decision).is_err() {
                        break None;
                    }
                }
                Some(Yield::Halted(halted)) => break Some(*halted),
                None => break None,
            }
        };

        if computation.join().is_err() {
            warn!(task_id = %task_id, "Computation thread panicked outside its entry point");
        }

        let mut halted = halted.ok_or_else(|| {
            Error::Internal(format!("computation for {} exited without halting", task_id))
        })?;
        halted.suspensions = suspensions;
        debug!(task_id = %task_id, reason = ?halted.reason, suspensions, "Computation halted");
        Ok(halted)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::ScriptedChannel;
    use serde_json::json;

    fn launch(entry: EntryPoint, args: Vec<Value>) -> Launch {
        Launch {
            task_id: "t-co".into(),
            entry,
            args,
            state: PersistentState::default(),
        }
    }

    fn add(_ctx: &mut TaskContext<'_>, args: Vec<Value>) -> anyhow::Result<Value> {
        let total: i64 = args.iter().filter_map(Value::as_i64).sum();
        Ok(json!(total))
    }

    fn fails(_ctx: &mut TaskContext<'_>, _args: Vec<Value>) -> anyhow::Result<Value> {
        anyhow::bail!("no luck")
    }

    fn panics(_ctx: &mut TaskContext<'_>, _args: Vec<Value>) -> anyhow::Result<Value> {
        panic!("kaboom")
    }

    #[test]
    fn test_normal_return_is_done() {
        let channel = ScriptedChannel::new();
        let halted = run_to_halt(
            &channel,
            launch(add, vec![json!(2), json!(5)]),
            &RuntimeSettings::default(),
            &AbortSignal::new(),
            |_| Resume::Retry,
        )
        .unwrap();

        assert_eq!(halted.reason, HaltReason::Done);
        assert_eq!(halted.outcome, Outcome::Done(json!(7)));
        assert_eq!(halted.suspensions, 0);
    }

    #[test]
    fn test_error_is_captured_with_trace() {
        let channel = ScriptedChannel::new();
        let halted = run_to_halt(
            &channel,
            launch(fails, vec![]),
            &RuntimeSettings::default(),
            &AbortSignal::new(),
            |_| Resume::Retry,
        )
        .unwrap();

        assert_eq!(halted.reason, HaltReason::RuntimeException);
        match halted.outcome {
            Outcome::Fault { message, .. } => assert_eq!(message, "no luck"),
            other => panic!("Expected fault, got {:?}", other),
        }
    }

    #[test]
    fn test_panic_is_captured() {
        let channel = ScriptedChannel::new();
        let halted = run_to_halt(
            &channel,
            launch(panics, vec![]),
            &RuntimeSettings::default(),
            &AbortSignal::new(),
            |_| Resume::Retry,
        )
        .unwrap();

        assert_eq!(halted.reason, HaltReason::RuntimeException);
        match halted.outcome {
            Outcome::Fault { message, trace } => {
                assert_eq!(message, "kaboom");
                assert!(trace.contains("panicked"));
            }
            other => panic!("Expected fault, got {:?}", other),
        }
    }
}
