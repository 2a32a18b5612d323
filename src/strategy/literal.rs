//! Literal strategy
//!
//! Publishes a fixed list of values, one per expected output. Useful as a
//! data source for scripts and as the simplest spawnable child.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{publish_bytes, ExecutionStrategy, TaskCallbacks};
use crate::error::{Error, Result};
use crate::types::{AbortSignal, RefId, TaskDescriptor};

/// How a literal value is serialized into its output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Json,
    /// CBOR, the runtime's serialized-object format
    Object,
}

impl Encoding {
    fn parse(value: Option<&Value>) -> Result<Self> {
        match value {
            None | Some(Value::Null) => Ok(Encoding::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|_| Error::malformed(format!("unknown literal encoding {}", value))),
        }
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match self {
            Encoding::Json => Ok(serde_json::to_vec(value)?),
            Encoding::Object => {
                let mut bytes = Vec::new();
                ciborium::into_writer(value, &mut bytes)
                    .map_err(|e| Error::Internal(format!("failed to encode literal: {}", e)))?;
                Ok(bytes)
            }
        }
    }
}

pub struct LiteralStrategy;

impl LiteralStrategy {
    pub fn new() -> Self {
        Self
    }

    fn values(fields: &Map<String, Value>) -> Result<&Vec<Value>> {
        fields
            .get("values")
            .and_then(Value::as_array)
            .filter(|values| !values.is_empty())
            .ok_or_else(|| Error::malformed("literal task needs a non-empty 'values' array"))
    }

    /// Expected outputs, or `<task_id>:out<i>` when the descriptor names none
    fn output_ids(task: &TaskDescriptor, count: usize) -> Result<Vec<RefId>> {
        if task.expected_outputs.is_empty() {
            return Ok((0..count)
                .map(|i| format!("{}:out{}", task.task_id, i))
                .collect());
        }
        if task.expected_outputs.len() != count {
            return Err(Error::malformed(format!(
                "literal task {} has {} values for {} outputs",
                task.task_id,
                count,
                task.expected_outputs.len()
            )));
        }
        Ok(task.expected_outputs.clone())
    }
}

impl Default for LiteralStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStrategy for LiteralStrategy {
    fn handler(&self) -> &str {
        "literal"
    }

    fn run(&self, task: &TaskDescriptor, host: &dyn TaskCallbacks, abort: &AbortSignal) -> Result<()> {
        let values = Self::values(&task.handler_fields)?;
        let encoding = Encoding::parse(task.field("encoding"))?;
        let ids = Self::output_ids(task, values.len())?;

        for (id, value) in ids.iter().zip(values) {
            if abort.is_triggered() {
                return Err(Error::Aborted {
                    task_id: task.task_id.clone(),
                });
            }
            let reference = publish_bytes(host, id, &encoding.encode(value)?)?;
            debug!(task_id = %task.task_id, output = %reference, "Literal published");
        }
        Ok(())
    }

    fn build_task_descriptor(&self, task: &mut TaskDescriptor, args: &Map<String, Value>) -> Result<()> {
        let values = Self::values(args)?.clone();
        let encoding = Encoding::parse(args.get("encoding"))?;

        task.expected_outputs = Self::output_ids(task, values.len())?;
        task.handler_fields
            .insert("values".into(), Value::Array(values));
        task.handler_fields
            .insert("encoding".into(), serde_json::to_value(encoding)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::FakeHost;
    use crate::types::RefKind;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_build_names_outputs_after_task() {
        let mut task = TaskDescriptor::new("literal");
        task.task_id = "lit".into();
        LiteralStrategy::new()
            .build_task_descriptor(&mut task, &args(json!({"values": [1, "two"]})))
            .unwrap();

        assert_eq!(task.expected_outputs, vec!["lit:out0", "lit:out1"]);
        assert_eq!(task.field("encoding"), Some(&json!("json")));
    }

    #[test]
    fn test_build_rejects_missing_values() {
        let mut task = TaskDescriptor::new("literal");
        let err = LiteralStrategy::new()
            .build_task_descriptor(&mut task, &args(json!({"values": []})))
            .unwrap_err();
        assert!(err.is_caller_fault());

        let err = LiteralStrategy::new()
            .build_task_descriptor(&mut task, &args(json!({"values": [1], "encoding": "xml"})))
            .unwrap_err();
        assert!(err.is_caller_fault());
    }

    #[test]
    fn test_run_publishes_each_value() {
        let host = FakeHost::new();
        let mut task = TaskDescriptor::new("literal");
        task.task_id = "lit".into();
        task.expected_outputs = vec!["a".into(), "b".into()];
        task.handler_fields = args(json!({"values": [41, {"k": "v"}]}));

        LiteralStrategy::new()
            .run(&task, &host, &AbortSignal::new())
            .unwrap();

        let published = host.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].id, "a");
        assert_eq!(published[0].inline_bytes().unwrap().unwrap(), b"41");
        assert_eq!(
            serde_json::from_slice::<Value>(&published[1].inline_bytes().unwrap().unwrap()).unwrap(),
            json!({"k": "v"})
        );
    }

    #[test]
    fn test_object_encoding_is_cbor() {
        let host = FakeHost::new();
        let mut task = TaskDescriptor::new("literal");
        task.task_id = "lit".into();
        task.handler_fields = args(json!({"values": ["x"], "encoding": "object"}));

        LiteralStrategy::new()
            .run(&task, &host, &AbortSignal::new())
            .unwrap();

        let bytes = host.published()[0].inline_bytes().unwrap().unwrap();
        let value: Value = ciborium::from_reader(&bytes[..]).unwrap();
        assert_eq!(value, json!("x"));
        assert_eq!(host.published()[0].id, "lit:out0");
    }

    #[test]
    fn test_large_value_goes_to_block_store() {
        let host = FakeHost::with_threshold(8);
        let mut task = TaskDescriptor::new("literal");
        task.task_id = "lit".into();
        task.handler_fields = args(json!({"values": ["a long literal string"]}));

        LiteralStrategy::new()
            .run(&task, &host, &AbortSignal::new())
            .unwrap();

        let published = host.published();
        assert!(matches!(published[0].kind, RefKind::Concrete { .. }));
        assert!(host.block_store().stream_status("lit:out0").is_some());
    }

    #[test]
    fn test_aborted_before_publishing() {
        let host = FakeHost::new();
        let mut task = TaskDescriptor::new("literal");
        task.task_id = "lit".into();
        task.handler_fields = args(json!({"values": [1]}));

        let abort = AbortSignal::new();
        abort.trigger();
        let err = LiteralStrategy::new().run(&task, &host, &abort).unwrap_err();
        assert!(matches!(err, Error::Aborted { .. }));
        assert!(host.published().is_empty());
    }
}
