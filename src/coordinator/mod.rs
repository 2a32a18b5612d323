//! Coordinator communication module
//!
//! The host reports each finished cycle to the coordinator:
//! - committed outputs of the root task
//! - the batch of children spawned during the cycle
//! - a failure report when the cycle ended in a fault

mod client;

pub use client::*;

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::{RefId, Reference, TaskDescriptor};

pub trait Coordinator: Send + Sync {
    /// Publish the outputs of a completed task
    fn commit_task(&self, task_id: &str, outputs: BTreeMap<RefId, Reference>) -> Result<()>;

    /// Forward every child spawned while running `root_task_id`, as one batch
    fn spawn_tasks(&self, root_task_id: &str, tasks: Vec<TaskDescriptor>) -> Result<()>;

    /// Report a cycle that ended in a fault; nothing of it was committed
    fn task_failed(&self, task_id: &str, error: &Error) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;
    use crate::protocol::CoordinatorMessage;

    /// Keeps every message in memory
    #[derive(Default)]
    pub(crate) struct RecordingCoordinator {
        messages: Mutex<Vec<CoordinatorMessage>>,
    }

    impl RecordingCoordinator {
        pub(crate) fn messages(&self) -> Vec<CoordinatorMessage> {
            self.messages.lock().clone()
        }

        pub(crate) fn commits(&self) -> Vec<(String, BTreeMap<RefId, Reference>)> {
            self.messages()
                .into_iter()
                .filter_map(|m| match m {
                    CoordinatorMessage::CommitTask { task_id, outputs } => Some((task_id, outputs)),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn spawn_batches(&self) -> Vec<(String, Vec<TaskDescriptor>)> {
            self.messages()
                .into_iter()
                .filter_map(|m| match m {
                    CoordinatorMessage::SpawnTasks {
                        root_task_id,
                        tasks,
                    } => Some((root_task_id, tasks)),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn failures(&self) -> Vec<(String, String, bool)> {
            self.messages()
                .into_iter()
                .filter_map(|m| match m {
                    CoordinatorMessage::TaskFailed {
                        task_id,
                        code,
                        retryable,
                        ..
                    } => Some((task_id, code, retryable)),
                    _ => None,
                })
                .collect()
        }
    }

    impl Coordinator for RecordingCoordinator {
        fn commit_task(&self, task_id: &str, outputs: BTreeMap<RefId, Reference>) -> Result<()> {
            self.messages.lock().push(CoordinatorMessage::CommitTask {
                task_id: task_id.to_string(),
                outputs,
            });
            Ok(())
        }

        fn spawn_tasks(&self, root_task_id: &str, tasks: Vec<TaskDescriptor>) -> Result<()> {
            self.messages.lock().push(CoordinatorMessage::SpawnTasks {
                root_task_id: root_task_id.to_string(),
                tasks,
            });
            Ok(())
        }

        fn task_failed(&self, task_id: &str, error: &Error) -> Result<()> {
            self.messages
                .lock()
                .push(CoordinatorMessage::task_failed(task_id, error));
            Ok(())
        }
    }
}
