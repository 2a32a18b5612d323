//! Host side of the runtime channel for script tasks
//!
//! Answers each runtime request from the task host's callbacks and the local
//! block store. Output indices map to ids in order: the task's expected
//! outputs first, then one id per `allocate_output`.

use std::collections::HashMap;
use std::thread;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, trace, warn};

use super::TaskCallbacks;
use crate::error::{Error, Result};
use crate::protocol::{required_field, HostChannel, RefResponse, StreamProgress, Verb};
use crate::store::StreamStatus;
use crate::types::{RefId, RefKind, Reference, TaskDescriptor};

pub struct ScriptChannel<'h> {
    task_id: String,
    host: &'h dyn TaskCallbacks,
    outputs: Mutex<Vec<RefId>>,
    /// Blocks handed out with `blocking`, awaiting `close_ref`
    pinned: Mutex<HashMap<RefId, u32>>,
}

impl<'h> ScriptChannel<'h> {
    pub fn new(task: &TaskDescriptor, host: &'h dyn TaskCallbacks) -> Self {
        Self {
            task_id: task.task_id.clone(),
            host,
            outputs: Mutex::new(task.expected_outputs.clone()),
            pinned: Mutex::new(HashMap::new()),
        }
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned.lock().values().map(|n| *n as usize).sum()
    }

    fn output_id(&self, args: &Value, verb: Verb) -> Result<RefId> {
        let index = required_field(args, verb, "index")?
            .as_u64()
            .ok_or_else(|| Error::protocol(format!("{} index is not an integer", verb)))?;
        self.outputs
            .lock()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Error::protocol(format!("{} names unallocated output {}", verb, index)))
    }

    fn reference_arg(args: &Value, verb: Verb) -> Result<Reference> {
        serde_json::from_value(required_field(args, verb, "ref")?.clone())
            .map_err(|e| Error::protocol(format!("{} ref is malformed: {}", verb, e)))
    }

    // ─────────────────────────────────────────────────────────────
    // Reference delivery
    // ─────────────────────────────────────────────────────────────

    fn open_ref(&self, args: &Value, verb: Verb) -> Result<Value> {
        let reference = Self::reference_arg(args, verb)?;
        let resolved = match self.host.resolve_ref(&reference) {
            Ok(resolved) => resolved,
            Err(e) if matches!(e, Error::ReferenceUnavailable { .. }) => {
                return Ok(RefResponse::Unavailable.to_value())
            }
            Err(e) => return Err(e),
        };

        let response = match &resolved.kind {
            RefKind::InlineData { .. } => RefResponse::Inline {
                bytes: resolved.inline_bytes().unwrap_or_else(|| Ok(Vec::new()))?,
            },
            RefKind::Error { reason } => RefResponse::Failed {
                reason: reason.clone(),
            },
            RefKind::Future => RefResponse::Unavailable,
            RefKind::Concrete { .. } => match verb {
                Verb::OpenRefAsync => {
                    let sole_consumer = args
                        .get("sole_consumer")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    self.deliver_async(&resolved, sole_consumer)
                }
                _ => self.deliver_complete(&resolved),
            },
        };
        trace!(task_id = %self.task_id, ref_id = %reference.id, ?response, "Reference delivered");
        Ok(response.to_value())
    }

    fn deliver_complete(&self, reference: &Reference) -> RefResponse {
        match self.wait_until_done(&reference.id) {
            Some(status) if status.done => RefResponse::File {
                path: self.host.block_store().path_for(&reference.id),
                done: true,
                blocking: false,
                size: Some(status.size),
            },
            _ => RefResponse::Unavailable,
        }
    }

    /// A growing block streams only to its sole consumer; anyone else gets
    /// the finished block, pinned until released.
    fn deliver_async(&self, reference: &Reference, sole_consumer: bool) -> RefResponse {
        let store = self.host.block_store();
        let path = store.path_for(&reference.id);
        match store.stream_status(&reference.id) {
            None => RefResponse::Unavailable,
            Some(status) if status.done => RefResponse::File {
                path,
                done: true,
                blocking: false,
                size: Some(status.size),
            },
            Some(status) if sole_consumer => RefResponse::File {
                path,
                done: false,
                blocking: false,
                size: Some(status.size),
            },
            Some(_) => match self.wait_until_done(&reference.id) {
                Some(status) if status.done => {
                    *self.pinned.lock().entry(reference.id.clone()).or_insert(0) += 1;
                    RefResponse::File {
                        path,
                        done: false,
                        blocking: true,
                        size: Some(status.size),
                    }
                }
                _ => RefResponse::Unavailable,
            },
        }
    }

    fn wait_until_done(&self, id: &str) -> Option<StreamStatus> {
        let settings = self.host.runtime_settings();
        let deadline = Instant::now() + settings.wait_timeout();
        loop {
            let status = self.host.block_store().stream_status(id)?;
            if status.done || Instant::now() >= deadline {
                return Some(status);
            }
            thread::sleep(settings.poll_interval());
        }
    }

    fn wait_stream(&self, args: &Value) -> Result<Value> {
        let reference = Self::reference_arg(args, Verb::WaitStream)?;
        let seen = args.get("size").and_then(Value::as_u64).unwrap_or(0);
        let settings = self.host.runtime_settings();
        let deadline = Instant::now() + settings.wait_timeout();

        let progress = loop {
            let status = self
                .host
                .block_store()
                .stream_status(&reference.id)
                .unwrap_or(StreamStatus { size: 0, done: false });
            if status.size > seen || status.done || Instant::now() >= deadline {
                break StreamProgress {
                    size: status.size,
                    done: status.done,
                };
            }
            thread::sleep(settings.poll_interval());
        };
        Ok(serde_json::to_value(progress)?)
    }

    fn close_ref(&self, args: &Value) -> Result<Value> {
        let reference = Self::reference_arg(args, Verb::CloseRef)?;
        let mut pinned = self.pinned.lock();
        match pinned.get_mut(&reference.id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                pinned.remove(&reference.id);
            }
            None => warn!(ref_id = %reference.id, "close_ref for a block that was not pinned"),
        }
        Ok(json!({}))
    }

    // ─────────────────────────────────────────────────────────────
    // Outputs
    // ─────────────────────────────────────────────────────────────

    fn publish_string(&self, args: &Value) -> Result<Value> {
        let id = self.output_id(args, Verb::PublishString)?;
        let data = required_field(args, Verb::PublishString, "strdata")?
            .as_str()
            .ok_or_else(|| Error::protocol("publish_string strdata is not a string"))?;
        let bytes = BASE64.decode(data).map_err(|e| Error::decode(id.clone(), e))?;

        let reference = Reference::inline(id, &bytes);
        self.host.publish_ref(reference.clone());
        Ok(json!({ "ref": reference }))
    }

    fn allocate_output(&self, args: &Value) -> Result<Value> {
        let prefix = args.get("prefix").and_then(Value::as_str).unwrap_or("obj");
        let mut outputs = self.outputs.lock();
        let index = outputs.len();
        outputs.push(format!("{}:{}{}", self.task_id, prefix, index));
        Ok(json!({ "index": index }))
    }

    fn open_output(&self, args: &Value) -> Result<Value> {
        let id = self.output_id(args, Verb::OpenOutput)?;
        let (path, _file) = self.host.block_store().begin(&id)?;
        debug!(task_id = %self.task_id, output = %id, path = %path.display(), "Output opened");
        Ok(json!({ "filename": path }))
    }

    fn close_output(&self, args: &Value) -> Result<Value> {
        let id = self.output_id(args, Verb::CloseOutput)?;
        let size = self.host.block_store().finish(&id)?;
        if let Some(claimed) = args.get("size").and_then(Value::as_u64) {
            if claimed != size {
                warn!(output = %id, claimed, size, "Output size disagrees with block");
            }
        }

        let reference = Reference::concrete(id, Some(size));
        self.host.publish_ref(reference.clone());
        Ok(json!({ "ref": reference }))
    }

    // ─────────────────────────────────────────────────────────────
    // Spawning and packages
    // ─────────────────────────────────────────────────────────────

    fn spawn(&self, args: Value) -> Result<Value> {
        let mut args: Map<String, Value> = match args {
            Value::Object(map) => map,
            _ => return Err(Error::protocol("spawn arguments must be an object")),
        };
        let executor = args
            .remove("executor_name")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::protocol("spawn message lacks 'executor_name'"))?;

        let mut child = TaskDescriptor::new(executor.clone());
        child.executor_name = Some(executor);
        let child = self.host.spawn_task(child, &args)?;

        let outputs: Vec<Reference> = child
            .expected_outputs
            .iter()
            .map(|id| Reference::future(id.clone()))
            .collect();
        Ok(json!({ "task_id": child.task_id, "outputs": outputs }))
    }

    fn package_lookup(&self, args: &Value) -> Result<Value> {
        let key = required_field(args, Verb::PackageLookup, "key")?
            .as_str()
            .ok_or_else(|| Error::protocol("package_lookup key is not a string"))?;
        match self.host.package_lookup(key) {
            Ok(value) => Ok(json!({ "value": value })),
            Err(e) if e.is_key_missing() => Ok(json!({ "value": null })),
            Err(e) => Err(e),
        }
    }
}

impl HostChannel for ScriptChannel<'_> {
    fn synchronous_request(&self, verb: Verb, args: Value) -> Result<Value> {
        trace!(task_id = %self.task_id, %verb, "Runtime request");
        match verb {
            Verb::OpenRef | Verb::OpenRefAsync => self.open_ref(&args, verb),
            Verb::WaitStream => self.wait_stream(&args),
            Verb::CloseRef => self.close_ref(&args),
            Verb::PublishString => self.publish_string(&args),
            Verb::AllocateOutput => self.allocate_output(&args),
            Verb::OpenOutput => self.open_output(&args),
            Verb::CloseOutput => self.close_output(&args),
            Verb::Spawn => self.spawn(args),
            Verb::PackageLookup => self.package_lookup(&args),
        }
    }
}

impl Drop for ScriptChannel<'_> {
    fn drop(&mut self) {
        let pinned = self.pinned_count();
        if pinned > 0 {
            warn!(task_id = %self.task_id, pinned, "Task ended with pinned blocks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::FakeHost;
    use std::io::Write;

    fn channel<'h>(host: &'h FakeHost, outputs: &[&str]) -> ScriptChannel<'h> {
        let mut task = TaskDescriptor::new("script");
        task.task_id = "t".into();
        task.expected_outputs = outputs.iter().map(|s| s.to_string()).collect();
        ScriptChannel::new(&task, host)
    }

    #[test]
    fn test_open_ref_by_kind() {
        let host = FakeHost::new();
        host.know(Reference::inline("i", b"hi"));
        host.know(Reference::error("e", "producer crashed"));
        let ch = channel(&host, &[]);

        let inline = ch
            .synchronous_request(Verb::OpenRef, json!({"ref": Reference::future("i")}))
            .unwrap();
        assert_eq!(RefResponse::parse("i", inline).unwrap(), RefResponse::Inline { bytes: b"hi".to_vec() });

        let failed = ch
            .synchronous_request(Verb::OpenRef, json!({"ref": Reference::future("e")}))
            .unwrap();
        assert!(matches!(RefResponse::parse("e", failed).unwrap(), RefResponse::Failed { .. }));

        let missing = ch
            .synchronous_request(Verb::OpenRef, json!({"ref": Reference::future("m")}))
            .unwrap();
        assert!(RefResponse::parse("m", missing).unwrap().is_unavailable());
    }

    #[test]
    fn test_allocated_outputs_follow_expected() {
        let host = FakeHost::new();
        let ch = channel(&host, &["t:retval"]);

        let index = ch
            .synchronous_request(Verb::AllocateOutput, json!({"prefix": "coro"}))
            .unwrap();
        assert_eq!(index["index"], 1);

        ch.synchronous_request(
            Verb::PublishString,
            json!({"index": 1, "strdata": BASE64.encode(b"state")}),
        )
        .unwrap();
        assert_eq!(host.published()[0].id, "t:coro1");

        let err = ch
            .synchronous_request(Verb::PublishString, json!({"index": 7, "strdata": ""}))
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));
    }

    #[test]
    fn test_output_file_lifecycle() {
        let host = FakeHost::new();
        let ch = channel(&host, &["t:retval"]);

        let opened = ch
            .synchronous_request(Verb::OpenOutput, json!({"index": 0, "may_pipe": true}))
            .unwrap();
        let path = std::path::PathBuf::from(opened["filename"].as_str().unwrap());
        assert!(!host.block_store().stream_status("t:retval").unwrap().done);

        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"abc")
            .unwrap();
        let closed = ch
            .synchronous_request(Verb::CloseOutput, json!({"index": 0, "size": 3}))
            .unwrap();
        assert_eq!(closed["ref"]["size_hint"], 3);
        assert!(host.block_store().stream_status("t:retval").unwrap().done);
        assert_eq!(host.published().len(), 1);
    }

    #[test]
    fn test_async_open_of_growing_block() {
        let host = FakeHost::with_wait_timeout_ms(30);
        host.block_store().begin("grow").unwrap();
        host.know(Reference::concrete("grow", None));
        let ch = channel(&host, &[]);

        let sole = ch
            .synchronous_request(
                Verb::OpenRefAsync,
                json!({"ref": Reference::future("grow"), "sole_consumer": true}),
            )
            .unwrap();
        assert!(matches!(
            RefResponse::parse("grow", sole).unwrap(),
            RefResponse::File { done: false, blocking: false, .. }
        ));

        // Other consumers wait for the producer; it never finishes here
        let shared = ch
            .synchronous_request(
                Verb::OpenRefAsync,
                json!({"ref": Reference::future("grow"), "sole_consumer": false}),
            )
            .unwrap();
        assert!(RefResponse::parse("grow", shared).unwrap().is_unavailable());
    }

    #[test]
    fn test_shared_open_of_finished_block_needs_no_release() {
        let host = FakeHost::new();
        host.block_store().write("blk", b"data").unwrap();
        host.know(Reference::concrete("blk", Some(4)));
        let ch = channel(&host, &[]);

        let response = ch
            .synchronous_request(
                Verb::OpenRefAsync,
                json!({"ref": Reference::future("blk"), "sole_consumer": false}),
            )
            .unwrap();
        assert!(matches!(
            RefResponse::parse("blk", response).unwrap(),
            RefResponse::File { done: true, blocking: false, size: Some(4), .. }
        ));
        assert_eq!(ch.pinned_count(), 0);
    }

    #[test]
    fn test_wait_stream_reports_growth() {
        let host = FakeHost::with_wait_timeout_ms(20);
        host.block_store().begin("s").unwrap();
        host.append("s", b"12345");
        let ch = channel(&host, &[]);

        let grown = ch
            .synchronous_request(Verb::WaitStream, json!({"ref": Reference::future("s"), "size": 0}))
            .unwrap();
        assert_eq!(grown, json!({"size": 5, "done": false}));

        // No growth past what the reader has seen: returns at the deadline
        let stalled = ch
            .synchronous_request(Verb::WaitStream, json!({"ref": Reference::future("s"), "size": 5}))
            .unwrap();
        assert_eq!(stalled, json!({"size": 5, "done": false}));
    }

    #[test]
    fn test_spawn_and_package_lookup() {
        let host = FakeHost::new();
        host.set_package("scale", json!(3));
        let ch = channel(&host, &[]);

        let spawned = ch
            .synchronous_request(
                Verb::Spawn,
                json!({"executor_name": "literal", "small_task": true, "values": [1]}),
            )
            .unwrap();
        assert_eq!(spawned["outputs"][0]["kind"], "future");
        let child = &host.spawned()[0];
        assert_eq!(child.handler, "literal");
        assert_eq!(child.executor_name.as_deref(), Some("literal"));

        let found = ch
            .synchronous_request(Verb::PackageLookup, json!({"key": "scale"}))
            .unwrap();
        assert_eq!(found["value"], 3);
        let missing = ch
            .synchronous_request(Verb::PackageLookup, json!({"key": "absent"}))
            .unwrap();
        assert!(missing["value"].is_null());
    }
}
