//! Outputs, continuations and spawning

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::context::{PersistentState, ResumeState, TaskContext};
use super::CONTINUATION_HANDLER;
use crate::error::{Error, Result};
use crate::protocol::{required_field, HostChannel, Verb};
use crate::types::Reference;

/// Output slot number, as handed out by `allocate_output`
pub type OutputIndex = u64;

#[derive(Deserialize)]
struct RefAnswer {
    #[serde(rename = "ref")]
    reference: Reference,
}

fn parse_ref_answer(verb: Verb, response: Value) -> Result<Reference> {
    serde_json::from_value::<RefAnswer>(response)
        .map(|answer| answer.reference)
        .map_err(|e| Error::protocol(format!("bad {} response: {}", verb, e)))
}

// ─────────────────────────────────────────────────────────────────
// Output Files
// ─────────────────────────────────────────────────────────────────

/// An output being written to a block
///
/// `close` publishes it; dropping it unclosed leaves the block partial.
pub struct OutputFile<'a> {
    index: OutputIndex,
    path: PathBuf,
    writer: BufWriter<std::fs::File>,
    written: u64,
    channel: &'a dyn HostChannel,
    closed: bool,
}

impl<'a> OutputFile<'a> {
    /// Flush and publish as a concrete reference
    pub fn close(mut self) -> Result<Reference> {
        self.writer.flush()?;
        self.closed = true;
        let response = self.channel.synchronous_request(
            Verb::CloseOutput,
            json!({ "index": self.index, "size": self.written }),
        )?;
        parse_ref_answer(Verb::CloseOutput, response)
    }
}

impl Write for OutputFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Drop for OutputFile<'_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(index = self.index, path = %self.path.display(), "Output dropped without close");
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Context API
// ─────────────────────────────────────────────────────────────────

impl<'a> TaskContext<'a> {
    /// Allocate a new output slot
    pub fn fresh_output_index(&mut self, prefix: &str) -> Result<OutputIndex> {
        let response = self
            .channel
            .synchronous_request(Verb::AllocateOutput, json!({ "prefix": prefix }))?;
        required_field(&response, Verb::AllocateOutput, "index")?
            .as_u64()
            .ok_or_else(|| Error::protocol("allocate_output index is not an integer"))
    }

    /// Open output `index` for writing; `may_pipe` lets consumers stream it
    pub fn open_output(&mut self, index: OutputIndex, may_pipe: bool) -> Result<OutputFile<'a>> {
        let response = self.channel.synchronous_request(
            Verb::OpenOutput,
            json!({ "index": index, "may_pipe": may_pipe }),
        )?;
        let path = required_field(&response, Verb::OpenOutput, "filename")?
            .as_str()
            .map(PathBuf::from)
            .ok_or_else(|| Error::protocol("open_output filename is not a string"))?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| Error::IoWrite {
                path: path.clone(),
                source,
            })?;

        Ok(OutputFile {
            index,
            path,
            writer: BufWriter::new(file),
            written: 0,
            channel: self.channel,
            closed: false,
        })
    }

    /// Publish bytes under output `index`, inline when small enough
    pub fn publish_bytes(&mut self, index: OutputIndex, bytes: &[u8]) -> Result<Reference> {
        if bytes.len() <= self.settings.inline_threshold_bytes {
            let response = self.channel.synchronous_request(
                Verb::PublishString,
                json!({ "index": index, "strdata": BASE64.encode(bytes) }),
            )?;
            return parse_ref_answer(Verb::PublishString, response);
        }

        let mut output = self.open_output(index, false)?;
        output.write_all(bytes)?;
        output.close()
    }

    /// Serialize a continuation into a fresh output
    pub fn save_state(&mut self, state: &ResumeState) -> Result<Reference> {
        let index = self.fresh_output_index("coro")?;
        let mut bytes = Vec::new();
        ciborium::into_writer(state, &mut bytes)
            .map_err(|e| Error::Internal(format!("failed to serialize continuation: {}", e)))?;
        self.publish_bytes(index, &bytes)
    }

    /// Fork `entry(args)` as a new task
    ///
    /// Only the continuation is written; the child's logic never runs here.
    /// Returns the child's output references.
    pub fn spawn(&mut self, entry: &str, args: Vec<Value>) -> Result<Vec<Reference>> {
        self.spawn_continuation(entry, args, false)
    }

    /// Like `spawn`, but hint that the child may be fused into its consumer
    pub fn spawn_small(&mut self, entry: &str, args: Vec<Value>) -> Result<Vec<Reference>> {
        self.spawn_continuation(entry, args, true)
    }

    fn spawn_continuation(
        &mut self,
        entry: &str,
        args: Vec<Value>,
        small_task: bool,
    ) -> Result<Vec<Reference>> {
        let code_ref = self
            .persistent_state
            .code_ref
            .clone()
            .ok_or_else(|| Error::NotSupported("spawn outside a script computation".into()))?;

        let state = ResumeState {
            entry: entry.to_string(),
            args,
            persistent_state: PersistentState::default(),
        };
        let coro_ref = self.save_state(&state)?;
        debug!(task_id = %self.task_id, entry, coro_ref = %coro_ref.id, "Spawning continuation");

        let mut spawn_args = Map::new();
        spawn_args.insert("code_ref".into(), serde_json::to_value(&code_ref)?);
        spawn_args.insert("coro_ref".into(), serde_json::to_value(&coro_ref)?);
        self.do_spawn(CONTINUATION_HANDLER, small_task, spawn_args)
    }

    /// Spawn a task for another execution strategy
    pub fn spawn_exec(&mut self, executor: &str, args: Map<String, Value>) -> Result<Vec<Reference>> {
        self.do_spawn(executor, false, args)
    }

    /// Spawn a small task, a candidate for inline fusion
    pub fn sync_exec(&mut self, executor: &str, args: Map<String, Value>) -> Result<Vec<Reference>> {
        self.do_spawn(executor, true, args)
    }

    fn do_spawn(
        &mut self,
        executor: &str,
        small_task: bool,
        mut args: Map<String, Value>,
    ) -> Result<Vec<Reference>> {
        args.insert("small_task".into(), Value::from(small_task));
        args.insert("executor_name".into(), Value::from(executor));

        let response = self
            .channel
            .synchronous_request(Verb::Spawn, Value::Object(args))?;
        let outputs = required_field(&response, Verb::Spawn, "outputs")?.clone();
        serde_json::from_value(outputs)
            .map_err(|e| Error::protocol(format!("bad spawn response: {}", e)))
    }

    /// Look up a configured package value
    ///
    /// A missing key is reported as `PackageKeyMissing` so callers can fall
    /// back to a default.
    pub fn package_lookup(&mut self, key: &str) -> Result<Value> {
        let response = self
            .channel
            .synchronous_request(Verb::PackageLookup, json!({ "key": key }))?;
        match response.get("value") {
            None | Some(Value::Null) => Err(Error::PackageKeyMissing {
                key: key.to_string(),
            }),
            Some(value) => Ok(value.clone()),
        }
    }

    pub fn package_lookup_or(&mut self, key: &str, default: Value) -> Result<Value> {
        match self.package_lookup(key) {
            Err(e) if e.is_key_missing() => Ok(default),
            other => other,
        }
    }
}
