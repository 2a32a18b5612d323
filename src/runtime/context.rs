//! Task-local runtime context and persistent state

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::coroutine::Suspender;
use crate::config::RuntimeSettings;
use crate::protocol::HostChannel;
use crate::types::{AbortSignal, RefId, Reference};

/// User computation entry point
pub type EntryPoint = fn(&mut TaskContext<'_>, Vec<Value>) -> anyhow::Result<Value>;

/// Why a computation stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Waiting on a reference; transient, the computation is resumed or abandoned
    ReferenceUnavailable,
    Done,
    RuntimeException,
}

// ─────────────────────────────────────────────────────────────────
// Persistent State
// ─────────────────────────────────────────────────────────────────

/// The part of a computation that survives suspension and spawning
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Outstanding references and their use counts; every count is >= 1
    #[serde(default)]
    pub ref_dependencies: BTreeMap<RefId, u32>,

    /// Code the computation runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_ref: Option<Reference>,
}

impl PersistentState {
    /// Consumable references are never tracked
    pub fn add_dependency(&mut self, reference: &Reference) {
        if !reference.is_consumable() {
            *self
                .ref_dependencies
                .entry(reference.id.clone())
                .or_insert(0) += 1;
        }
    }

    pub fn remove_dependency(&mut self, reference: &Reference) {
        if reference.is_consumable() {
            return;
        }
        match self.ref_dependencies.get_mut(&reference.id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.ref_dependencies.remove(&reference.id);
            }
            None => warn!(ref_id = %reference.id, "Dependency released more often than taken"),
        }
    }

    #[cfg(test)]
    pub fn dependency_count(&self, id: &str) -> u32 {
        self.ref_dependencies.get(id).copied().unwrap_or(0)
    }
}

/// A not-yet-started computation, as written by `save_state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub entry: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub persistent_state: PersistentState,
}

// ─────────────────────────────────────────────────────────────────
// Task Context
// ─────────────────────────────────────────────────────────────────

/// Everything one running computation owns
///
/// Created when the computation starts and dropped when it halts; nothing
/// here is shared with other computations.
pub struct TaskContext<'a> {
    pub(crate) task_id: String,
    pub(crate) channel: &'a dyn HostChannel,
    pub(crate) persistent_state: PersistentState,
    pub(crate) object_cache: HashMap<RefId, Value>,
    pub(crate) suspender: Suspender,
    pub(crate) abort: AbortSignal,
    pub(crate) settings: RuntimeSettings,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        task_id: String,
        channel: &'a dyn HostChannel,
        persistent_state: PersistentState,
        suspender: Suspender,
        abort: AbortSignal,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            task_id,
            channel,
            persistent_state,
            object_cache: HashMap::new(),
            suspender,
            abort,
            settings,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn persistent_state(&self) -> &PersistentState {
        &self.persistent_state
    }

    /// `Some(ReferenceUnavailable)` only while suspended
    /// Long-running computations should poll this between units of work
    pub fn is_aborted(&self) -> bool {
        self.abort.is_triggered()
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn add_ref_dependency(&mut self, reference: &Reference) {
        self.persistent_state.add_dependency(reference);
    }

    pub fn remove_ref_dependency(&mut self, reference: &Reference) {
        self.persistent_state.remove_dependency(reference);
    }

    /// Pin `refs` as dependencies until the guard drops
    pub fn required_refs(&mut self, refs: Vec<Reference>) -> RequiredRefs<'_, 'a> {
        for reference in &refs {
            self.persistent_state.add_dependency(reference);
        }
        RequiredRefs { ctx: self, refs }
    }
}

/// Scoped dependency registration
///
/// Dereferences to the context, so the guarded block keeps using it. The
/// registrations are released however the block exits, including by panic.
pub struct RequiredRefs<'c, 'a> {
    ctx: &'c mut TaskContext<'a>,
    refs: Vec<Reference>,
}

impl<'c, 'a> std::ops::Deref for RequiredRefs<'c, 'a> {
    type Target = TaskContext<'a>;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl<'c, 'a> std::ops::DerefMut for RequiredRefs<'c, 'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for RequiredRefs<'_, '_> {
    fn drop(&mut self) {
        for reference in &self.refs {
            self.ctx.persistent_state.remove_dependency(reference);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_registration_leaves_no_entry() {
        let mut state = PersistentState::default();
        let r = Reference::future("f1");

        state.add_dependency(&r);
        state.add_dependency(&r);
        assert_eq!(state.dependency_count("f1"), 2);

        state.remove_dependency(&r);
        assert_eq!(state.dependency_count("f1"), 1);
        state.remove_dependency(&r);
        assert!(!state.ref_dependencies.contains_key("f1"));

        // An extra release must not underflow or resurrect the entry
        state.remove_dependency(&r);
        assert!(state.ref_dependencies.is_empty());
    }

    #[test]
    fn test_consumable_refs_not_tracked() {
        let mut state = PersistentState::default();
        state.add_dependency(&Reference::inline("i", b"x"));
        state.add_dependency(&Reference::error("e", "failed"));
        assert!(state.ref_dependencies.is_empty());
    }

    #[test]
    fn test_resume_state_serialization() {
        let state = ResumeState {
            entry: "square".into(),
            args: vec![serde_json::json!(3)],
            persistent_state: PersistentState::default(),
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&state, &mut buf).unwrap();
        let parsed: ResumeState = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(parsed, state);
    }
}
