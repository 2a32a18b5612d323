//! Compiled-in programs for the script strategy
//!
//! A script task's code reference names a program; the program names its
//! entry points. Root tasks always start at `main`, continuations name the
//! entry they resume.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::runtime::{EntryPoint, RawInput, RawOptions, TaskContext};
use crate::types::Reference;

/// Entry point every root script task starts at
pub const MAIN_ENTRY: &str = "main";

/// Upper bound on children a single fan-out may create
const MAX_FANOUT: u64 = 64;

/// Package key that lowers the `collect` bound
const COLLECT_LIMIT_KEY: &str = "collect.limit";

pub struct Program {
    pub name: String,
    pub description: String,
    entries: Vec<(String, EntryPoint)>,
}

impl Program {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            entries: Vec::new(),
        }
    }

    pub fn entry(mut self, name: impl Into<String>, entry: EntryPoint) -> Self {
        self.entries.push((name.into(), entry));
        self
    }

    pub fn lookup(&self, name: &str) -> Option<EntryPoint> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, entry)| *entry)
    }

    pub fn entry_names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }
}

// ─────────────────────────────────────────────────────────────────
// Program Registry
// ─────────────────────────────────────────────────────────────────

pub struct ProgramRegistry {
    programs: RwLock<HashMap<String, Arc<Program>>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self {
            programs: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(
            Program::new("sum", "Add up the JSON numbers behind each argument reference")
                .entry(MAIN_ENTRY, sum_main),
        );
        registry.register(
            Program::new("fanout", "Square 0..n in small children and total the results")
                .entry(MAIN_ENTRY, fanout_main)
                .entry("square", square),
        );
        registry.register(
            Program::new("scatter", "Square 0..n in detached children")
                .entry(MAIN_ENTRY, scatter_main)
                .entry("square", square),
        );
        registry.register(
            Program::new("collect", "Square 0..n in one small literal task and decode the values")
                .entry(MAIN_ENTRY, collect_main),
        );
        registry.register(
            Program::new("count", "Count bytes and lines of a raw input, streaming if possible")
                .entry(MAIN_ENTRY, count_main),
        );
        registry
    }

    pub fn register(&self, program: Program) {
        debug!(program = %program.name, entries = ?program.entry_names(), "Program registered");
        self.programs
            .write()
            .insert(program.name.clone(), Arc::new(program));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Program>> {
        self.programs.read().get(name).cloned()
    }

    /// `(name, description)` pairs, sorted by name
    pub fn list(&self) -> Vec<(String, String)> {
        let mut programs: Vec<(String, String)> = self
            .programs
            .read()
            .values()
            .map(|p| (p.name.clone(), p.description.clone()))
            .collect();
        programs.sort();
        programs
    }
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Built-in Programs
// ─────────────────────────────────────────────────────────────────

fn reference_arg(value: &Value) -> anyhow::Result<Reference> {
    serde_json::from_value(value.clone()).context("argument is not a reference")
}

/// `main(ref...)`: every argument stays a dependency until it is summed
fn sum_main(ctx: &mut TaskContext<'_>, args: Vec<Value>) -> anyhow::Result<Value> {
    let references = args
        .iter()
        .map(reference_arg)
        .collect::<anyhow::Result<Vec<_>>>()?;
    for reference in &references {
        ctx.add_ref_dependency(reference);
    }

    let mut int_total: i64 = 0;
    let mut float_total: f64 = 0.0;
    let mut all_ints = true;

    for (i, reference) in references.iter().enumerate() {
        let value = ctx.deref_json::<Value>(reference);
        ctx.remove_ref_dependency(reference);
        let number = value.map_err(anyhow::Error::from).and_then(|value| {
            match (value.as_i64(), value.as_f64()) {
                (Some(n), _) => Ok((Some(n), n as f64)),
                (None, Some(x)) => Ok((None, x)),
                _ => Err(anyhow::anyhow!("{} is not a number", reference.id)),
            }
        });
        let (exact, approx) = match number {
            Ok(number) => number,
            Err(e) => {
                for rest in &references[i + 1..] {
                    ctx.remove_ref_dependency(rest);
                }
                return Err(e);
            }
        };

        match exact {
            Some(n) => int_total = int_total.checked_add(n).context("sum overflowed")?,
            None => all_ints = false,
        }
        float_total += approx;
    }

    Ok(if all_ints {
        json!(int_total)
    } else {
        json!(float_total)
    })
}

fn fanout_count(args: &[Value]) -> anyhow::Result<u64> {
    let n = args
        .first()
        .and_then(Value::as_u64)
        .context("expected a non-negative count")?;
    if n > MAX_FANOUT {
        bail!("fan-out of {} exceeds {}", n, MAX_FANOUT);
    }
    Ok(n)
}

fn fanout_main(ctx: &mut TaskContext<'_>, args: Vec<Value>) -> anyhow::Result<Value> {
    let n = fanout_count(&args)?;

    let mut results = Vec::new();
    for i in 0..n {
        let outputs = ctx.spawn_small("square", vec![json!(i)])?;
        results.extend(outputs.into_iter().next());
    }

    let mut total: i64 = 0;
    for reference in &results {
        let square: i64 = ctx.deref_json(reference)?;
        total += square;
    }
    Ok(json!(total))
}

fn scatter_main(ctx: &mut TaskContext<'_>, args: Vec<Value>) -> anyhow::Result<Value> {
    let n = fanout_count(&args)?;

    let mut ids = Vec::new();
    for i in 0..n {
        for output in ctx.spawn("square", vec![json!(i)])? {
            ids.push(output.id);
        }
    }
    Ok(json!(ids))
}

fn square(_ctx: &mut TaskContext<'_>, args: Vec<Value>) -> anyhow::Result<Value> {
    let x = args.first().and_then(Value::as_i64).context("expected an integer")?;
    Ok(json!(x.checked_mul(x).context("square overflowed")?))
}

/// `main(n)`: `{values: [0, 1, 4, ...], total: <ref id of the sum>}`
///
/// The squares come back from a small literal child in the object encoding;
/// their sum is handed on to a detached literal child.
fn collect_main(ctx: &mut TaskContext<'_>, args: Vec<Value>) -> anyhow::Result<Value> {
    let n = fanout_count(&args)?;
    let limit = ctx
        .package_lookup_or(COLLECT_LIMIT_KEY, json!(MAX_FANOUT))?
        .as_u64()
        .with_context(|| format!("package {} is not a count", COLLECT_LIMIT_KEY))?;
    if n > limit {
        bail!("collect of {} exceeds the configured limit {}", n, limit);
    }
    if n == 0 {
        return Ok(json!({ "values": [], "total": null }));
    }

    let squares: Vec<Value> = (0..n).map(|i| json!(i * i)).collect();
    let mut literal = Map::new();
    literal.insert("values".into(), Value::Array(squares));
    literal.insert("encoding".into(), json!("object"));
    let outputs = ctx.sync_exec("literal", literal)?;

    let mut values = Vec::with_capacity(outputs.len());
    {
        let mut pinned = ctx.required_refs(outputs.clone());
        debug!(
            task_id = %pinned.task_id(),
            pinned = pinned.persistent_state().ref_dependencies.len(),
            "Collecting literal outputs"
        );
        for reference in &outputs {
            if pinned.is_aborted() {
                bail!("collect aborted");
            }
            values.push(pinned.deref::<Value>(reference)?);
        }
    }

    let total: u64 = values.iter().filter_map(Value::as_u64).sum();
    let mut summary = Map::new();
    summary.insert("values".into(), json!([total]));
    let handed_on = ctx.spawn_exec("literal", summary)?;

    Ok(json!({
        "values": values,
        "total": handed_on.first().map(|reference| reference.id.clone()),
    }))
}

fn newlines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|b| **b == b'\n').count()
}

/// `main(ref, sole_consumer?)`
fn count_main(ctx: &mut TaskContext<'_>, args: Vec<Value>) -> anyhow::Result<Value> {
    let reference = reference_arg(args.first().context("expected a reference")?)?;
    let sole_consumer = args.get(1).and_then(Value::as_bool).unwrap_or(true);

    let input = ctx.open_raw(
        &reference,
        RawOptions {
            may_stream: true,
            sole_consumer,
            chunk_size: None,
        },
    )?;

    let (bytes, lines, streamed) = match input {
        RawInput::Streaming(mut stream) => {
            debug!(ref_id = %reference.id, available = stream.available(), "Counting a growing block");
            let (mut bytes, mut lines) = (0, 0);
            while let Some(chunk) = stream.read_chunk()? {
                bytes += chunk.len();
                lines += newlines(&chunk);
            }
            (bytes, lines, true)
        }
        RawInput::Complete(mut file) => {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            if file.must_release() {
                debug!(ref_id = %reference.id, path = %file.path().display(), "Releasing pinned block");
            }
            file.release()?;
            (buf.len(), newlines(&buf), false)
        }
        RawInput::Buffer(cursor) => {
            let buf = cursor.into_inner();
            (buf.len(), newlines(&buf), false)
        }
    };

    Ok(json!({ "bytes": bytes, "lines": lines, "streamed": streamed }))
}
