//! Reference fetch and decode
//!
//! `fetch_ref` is the only place a computation suspends on a reference. Each
//! fetch costs at most one suspend/resume cycle: the request is retried once
//! after the host resumes us, and a second miss is fatal.

use std::fs::File;
use std::io::{BufReader, Read};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::context::{HaltReason, TaskContext};
use super::coroutine::Resume;
use crate::error::{Error, Result};
use crate::protocol::{RefResponse, Verb};
use crate::types::{RefKind, Reference};

/// What `fetch_ref` produced
pub(crate) enum Fetched {
    /// Already decoded earlier in this computation
    Cached(Value),
    /// Fresh delivery from the host
    Delivered(RefResponse),
}

/// Serialized-object and structured-document formats share one fetch path
#[derive(Debug, Clone, Copy)]
enum Codec {
    Object,
    Json,
}

impl Codec {
    fn decode<R: Read>(self, id: &str, reader: R) -> Result<Value> {
        match self {
            Codec::Object => ciborium::from_reader(reader).map_err(|e| Error::decode(id, e)),
            Codec::Json => serde_json::from_reader(reader).map_err(|e| Error::decode(id, e)),
        }
    }
}

impl<'a> TaskContext<'a> {
    pub(crate) fn fetch_ref(
        &mut self,
        reference: &Reference,
        verb: Verb,
        extra: Map<String, Value>,
    ) -> Result<Fetched> {
        if let Some(value) = self.object_cache.get(&reference.id) {
            trace!(ref_id = %reference.id, "Object cache hit");
            return Ok(Fetched::Cached(value.clone()));
        }
        self.request_ref(reference, verb, extra)
            .map(Fetched::Delivered)
    }

    /// Fetch without consulting the object cache
    ///
    /// The dependency is held for the whole fetch, suspension included, and
    /// released on every way out.
    pub(crate) fn request_ref(
        &mut self,
        reference: &Reference,
        verb: Verb,
        extra: Map<String, Value>,
    ) -> Result<RefResponse> {
        match &reference.kind {
            RefKind::InlineData { .. } => {
                let bytes = reference
                    .inline_bytes()
                    .unwrap_or_else(|| Ok(Vec::new()))?;
                return Ok(RefResponse::Inline { bytes });
            }
            RefKind::Error { reason } => {
                return Err(Error::ErrorReference {
                    id: reference.id.clone(),
                    reason: reason.clone(),
                })
            }
            RefKind::Future | RefKind::Concrete { .. } => {}
        }

        self.persistent_state.add_dependency(reference);
        let result = self.request_with_retry(reference, verb, extra);
        self.persistent_state.remove_dependency(reference);
        result
    }

    fn request_with_retry(
        &mut self,
        reference: &Reference,
        verb: Verb,
        mut args: Map<String, Value>,
    ) -> Result<RefResponse> {
        args.insert("ref".to_string(), serde_json::to_value(reference)?);
        let args = Value::Object(args);

        let response = self.request_once(reference, verb, args.clone())?;
        if !response.is_unavailable() {
            return accept(reference, response);
        }

        if self.abort.is_triggered() {
            return Err(Error::Aborted {
                task_id: self.task_id.clone(),
            });
        }

        debug!(task_id = %self.task_id, ref_id = %reference.id, "Reference unavailable, suspending");
        let decision = self
            .suspender
            .suspend(HaltReason::ReferenceUnavailable, reference);

        if decision == Resume::Abandon {
            return Err(Error::unavailable(reference.id.clone()));
        }
        if self.abort.is_triggered() {
            return Err(Error::Aborted {
                task_id: self.task_id.clone(),
            });
        }

        match self.request_once(reference, verb, args)? {
            RefResponse::Unavailable => Err(Error::DoubleFetchFailure {
                id: reference.id.clone(),
            }),
            response => accept(reference, response),
        }
    }

    fn request_once(&self, reference: &Reference, verb: Verb, args: Value) -> Result<RefResponse> {
        let response = self.channel.synchronous_request(verb, args)?;
        RefResponse::parse(&reference.id, response)
    }

    // ─────────────────────────────────────────────────────────────
    // Decoding
    // ─────────────────────────────────────────────────────────────

    /// Decode a serialized object, caching it by reference id
    pub fn deref<T: DeserializeOwned>(&mut self, reference: &Reference) -> Result<T> {
        let value = self.materialize(reference, Codec::Object)?;
        serde_json::from_value(value).map_err(|e| Error::decode(reference.id.clone(), e))
    }

    /// Decode a JSON document, caching it by reference id
    pub fn deref_json<T: DeserializeOwned>(&mut self, reference: &Reference) -> Result<T> {
        let value = self.materialize(reference, Codec::Json)?;
        serde_json::from_value(value).map_err(|e| Error::decode(reference.id.clone(), e))
    }

    fn materialize(&mut self, reference: &Reference, codec: Codec) -> Result<Value> {
        let delivered = match self.fetch_ref(reference, Verb::OpenRef, Map::new())? {
            Fetched::Cached(value) => return Ok(value),
            Fetched::Delivered(delivered) => delivered,
        };

        let value = match delivered {
            RefResponse::Inline { bytes } => codec.decode(&reference.id, &bytes[..])?,
            RefResponse::File { path, .. } => {
                let file = File::open(&path).map_err(|source| Error::IoRead {
                    path: path.clone(),
                    source,
                })?;
                codec.decode(&reference.id, BufReader::new(file))?
            }
            other => {
                return Err(Error::Internal(format!(
                    "fetch of {} returned {:?}",
                    reference.id, other
                )))
            }
        };

        self.object_cache
            .insert(reference.id.clone(), value.clone());
        Ok(value)
    }
}

fn accept(reference: &Reference, response: RefResponse) -> Result<RefResponse> {
    match response {
        RefResponse::Failed { reason } => Err(Error::ErrorReference {
            id: reference.id.clone(),
            reason,
        }),
        response => Ok(response),
    }
}
