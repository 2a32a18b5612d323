//! Coordinator wire messages
//!
//! Input lines tell the worker what to do; output lines report commits,
//! spawned children and failures. Both are JSON objects with a `type`
//! discriminator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{ProtocolVersion, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::types::{RefId, Reference, TaskDescriptor};

// ─────────────────────────────────────────────────────────────────
// Message Envelope
// ─────────────────────────────────────────────────────────────────

/// Wrapper for every message the worker emits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message ID
    pub id: Uuid,

    pub timestamp: DateTime<Utc>,

    pub version: ProtocolVersion,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    #[serde(flatten)]
    pub payload: CoordinatorMessage,
}

impl MessageEnvelope {
    pub fn new(payload: CoordinatorMessage, worker_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: PROTOCOL_VERSION,
            worker_id,
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ─────────────────────────────────────────────────────────────────
// Worker → Coordinator
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorMessage {
    /// Outputs published by a finished cycle
    CommitTask {
        task_id: String,
        outputs: BTreeMap<RefId, Reference>,
    },

    /// Children spawned during a cycle, keyed by the root task
    SpawnTasks {
        root_task_id: String,
        tasks: Vec<TaskDescriptor>,
    },

    /// A cycle that ended in a fault; nothing was committed
    TaskFailed {
        task_id: String,
        code: String,
        message: String,
        retryable: bool,
    },
}

impl CoordinatorMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            CoordinatorMessage::CommitTask { .. } => "COMMIT_TASK",
            CoordinatorMessage::SpawnTasks { .. } => "SPAWN_TASKS",
            CoordinatorMessage::TaskFailed { .. } => "TASK_FAILED",
        }
    }

    pub fn task_failed(task_id: &str, error: &Error) -> Self {
        CoordinatorMessage::TaskFailed {
            task_id: task_id.to_string(),
            code: error.code().as_str(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Coordinator → Worker
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerInput {
    /// Run one task cycle
    ExecuteTask { task: TaskDescriptor },

    /// Cooperatively abort the named task if it is still running
    ///
    /// With a `generation`, only that cycle of the task is aborted.
    AbortTask {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation: Option<u64>,
    },

    /// No more streamed input will arrive for the named root task
    StreamsDone { task_id: String },
}

impl WorkerInput {
    pub fn type_name(&self) -> &'static str {
        match self {
            WorkerInput::ExecuteTask { .. } => "EXECUTE_TASK",
            WorkerInput::AbortTask { .. } => "ABORT_TASK",
            WorkerInput::StreamsDone { .. } => "STREAMS_DONE",
        }
    }

    /// Parse one input line, checking the optional `version` field
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(line)
            .map_err(|e| Error::protocol(format!("input line is not JSON: {}", e)))?;

        let object = value
            .as_object_mut()
            .ok_or_else(|| Error::protocol("input line is not a JSON object"))?;

        if let Some(version) = object.remove("version") {
            let version: ProtocolVersion = serde_json::from_value(version)
                .map_err(|e| Error::protocol(format!("bad version field: {}", e)))?;
            if !PROTOCOL_VERSION.accepts(&version) {
                return Err(Error::protocol(format!(
                    "protocol version {} is not supported (worker speaks {})",
                    version, PROTOCOL_VERSION
                )));
            }
        }

        serde_json::from_value(value).map_err(|e| Error::protocol(e.to_string()))
    }
}
