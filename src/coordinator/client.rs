//! JSON-lines coordinator client
//!
//! Writes each coordinator message as one enveloped JSON line and flushes
//! it at once, so a supervising process sees commits as they happen.

use std::collections::BTreeMap;
use std::io::Write;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::Coordinator;
use crate::error::{Error, Result};
use crate::protocol::{CoordinatorMessage, MessageEnvelope};
use crate::types::{RefId, Reference, TaskDescriptor};

pub struct StreamCoordinator<W: Write + Send> {
    writer: Mutex<W>,
    worker_id: Option<String>,
}

impl<W: Write + Send> StreamCoordinator<W> {
    pub fn new(writer: W, worker_id: Option<String>) -> Self {
        Self {
            writer: Mutex::new(writer),
            worker_id,
        }
    }

    fn send(&self, message: CoordinatorMessage) -> Result<()> {
        let kind = message.type_name();
        let line = MessageEnvelope::new(message, self.worker_id.clone()).to_json()?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)
            .and_then(|_| writer.flush())
            .map_err(|e| Error::Coordinator(format!("failed to send {}: {}", kind, e)))?;

        debug!(message_type = kind, bytes = line.len(), "Sent to coordinator");
        Ok(())
    }
}

impl<W: Write + Send> Coordinator for StreamCoordinator<W> {
    fn commit_task(&self, task_id: &str, outputs: BTreeMap<RefId, Reference>) -> Result<()> {
        info!(task_id = %task_id, outputs = outputs.len(), "Committing task");
        self.send(CoordinatorMessage::CommitTask {
            task_id: task_id.to_string(),
            outputs,
        })
    }

    fn spawn_tasks(&self, root_task_id: &str, tasks: Vec<TaskDescriptor>) -> Result<()> {
        info!(root_task_id = %root_task_id, children = tasks.len(), "Forwarding spawned tasks");
        self.send(CoordinatorMessage::SpawnTasks {
            root_task_id: root_task_id.to_string(),
            tasks,
        })
    }

    fn task_failed(&self, task_id: &str, error: &Error) -> Result<()> {
        warn!(task_id = %task_id, code = %error.code().as_str(), error = %error, "Reporting failed task");
        self.send(CoordinatorMessage::task_failed(task_id, error))
    }
}

#[cfg(test)]
impl<W: Write + Send> StreamCoordinator<W> {
    fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}
