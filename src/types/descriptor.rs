//! Task descriptor definitions
//!
//! A task descriptor is one unit of work. The host receives descriptors from
//! the coordinator, strategies produce them for children through
//! `spawn_task`, and the fusion path runs them inline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{RefId, Reference};
use crate::error::{Error, Result};

/// Wire shape:
/// `{task_id, handler, inputs, dependencies, expected_outputs, hint_small_task?,
///   small_task, executor_name, ...handler fields}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Empty until the host assigns an id to a spawned child
    #[serde(default)]
    pub task_id: String,

    /// Name of the execution strategy that runs this task
    pub handler: String,

    /// Resolved input references, seeded by the host before running.
    /// `None` means not yet resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeMap<RefId, Reference>>,

    /// Declared prerequisites
    #[serde(default)]
    pub dependencies: BTreeMap<RefId, Reference>,

    /// Output ids, in order
    #[serde(default)]
    pub expected_outputs: Vec<RefId>,

    /// Producer cheap enough to be fused into its consumer
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hint_small_task: bool,

    #[serde(default)]
    pub small_task: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_name: Option<String>,

    /// Handler-specific fields (code references, literal values, ...)
    #[serde(flatten)]
    pub handler_fields: Map<String, Value>,
}

impl TaskDescriptor {
    /// A bare descriptor for `handler`, to be completed by `spawn_task`
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            task_id: String::new(),
            handler: handler.into(),
            inputs: None,
            dependencies: BTreeMap::new(),
            expected_outputs: Vec::new(),
            hint_small_task: false,
            small_task: false,
            executor_name: None,
            handler_fields: Map::new(),
        }
    }

    /// Check the fields the host needs before running a cycle
    pub fn validate_for_execution(&self) -> Result<()> {
        if self.task_id.is_empty() {
            return Err(Error::malformed("task descriptor has no task_id"));
        }
        if self.handler.is_empty() {
            return Err(Error::malformed(format!(
                "task {} has no handler",
                self.task_id
            )));
        }
        if self.inputs.is_none() {
            return Err(Error::malformed(format!(
                "task {} has no inputs",
                self.task_id
            )));
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.handler_fields.get(name)
    }

    /// Parse a handler field holding a reference
    pub fn reference_field(&self, name: &str) -> Result<Option<Reference>> {
        match self.handler_fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| Error::malformed(format!("field '{}' is not a reference: {}", name, e))),
        }
    }

    /// Record a prerequisite unless it is self-contained
    pub fn add_dependency(&mut self, reference: &Reference) {
        if !reference.is_consumable() {
            self.dependencies
                .insert(reference.id.clone(), reference.clone());
        }
    }
}
