//! Host message channel
//!
//! A running computation talks to its host through synchronous requests:
//! a verb plus a JSON argument object, answered by a JSON object. Reference
//! delivery answers are parsed into [`RefResponse`].

use std::fmt;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Verbs
// ─────────────────────────────────────────────────────────────────

/// Requests a computation can make of its host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    OpenRef,
    OpenRefAsync,
    PublishString,
    Spawn,
    PackageLookup,
    AllocateOutput,
    OpenOutput,
    CloseOutput,
    CloseRef,
    WaitStream,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::OpenRef => "open_ref",
            Verb::OpenRefAsync => "open_ref_async",
            Verb::PublishString => "publish_string",
            Verb::Spawn => "spawn",
            Verb::PackageLookup => "package_lookup",
            Verb::AllocateOutput => "allocate_output",
            Verb::OpenOutput => "open_output",
            Verb::CloseOutput => "close_output",
            Verb::CloseRef => "close_ref",
            Verb::WaitStream => "wait_stream",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The host side of the channel
///
/// Implementations must tolerate being called from the computation's own
/// thread while the host thread is blocked waiting on it.
pub trait HostChannel: Send + Sync {
    fn synchronous_request(&self, verb: Verb, args: Value) -> Result<Value>;
}

// ─────────────────────────────────────────────────────────────────
// Reference Delivery
// ─────────────────────────────────────────────────────────────────

/// How the host answered an `open_ref` / `open_ref_async`
#[derive(Debug, Clone, PartialEq)]
pub enum RefResponse {
    /// `{"error": ...}`: not available yet
    Unavailable,

    /// `{"failed": reason}`: the reference is an error marker
    Failed { reason: String },

    /// `{"strdata": base64}`
    Inline { bytes: Vec<u8> },

    /// `{"filename": path}`, plus stream state for async opens
    File {
        path: PathBuf,
        done: bool,
        blocking: bool,
        size: Option<u64>,
    },
}

#[derive(Deserialize)]
struct WireRefResponse {
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    failed: Option<String>,
    #[serde(default)]
    strdata: Option<String>,
    #[serde(default)]
    filename: Option<PathBuf>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    blocking: Option<bool>,
    #[serde(default)]
    size: Option<u64>,
}

impl RefResponse {
    /// Parse a host answer for reference `id`
    pub fn parse(id: &str, response: Value) -> Result<Self> {
        let wire: WireRefResponse = serde_json::from_value(response)
            .map_err(|e| Error::protocol(format!("bad open_ref response for {}: {}", id, e)))?;

        if wire.error.is_some() {
            return Ok(RefResponse::Unavailable);
        }
        if let Some(reason) = wire.failed {
            return Ok(RefResponse::Failed { reason });
        }
        if let Some(data) = wire.strdata {
            let bytes = BASE64.decode(data).map_err(|e| Error::decode(id, e))?;
            return Ok(RefResponse::Inline { bytes });
        }
        match wire.filename {
            Some(path) => Ok(RefResponse::File {
                path,
                done: wire.done.unwrap_or(true),
                blocking: wire.blocking.unwrap_or(false),
                size: wire.size,
            }),
            None => Err(Error::protocol(format!(
                "open_ref response for {} carries neither strdata nor filename",
                id
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RefResponse::Unavailable => json!({"error": "unavailable"}),
            RefResponse::Failed { reason } => json!({"failed": reason}),
            RefResponse::Inline { bytes } => json!({"strdata": BASE64.encode(bytes)}),
            RefResponse::File {
                path,
                done,
                blocking,
                size,
            } => json!({
                "filename": path,
                "done": done,
                "blocking": blocking,
                "size": size,
            }),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, RefResponse::Unavailable)
    }
}

/// Answer to `wait_stream`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProgress {
    pub size: u64,
    pub done: bool,
}

/// Pull a required field out of a request or response object
pub fn required_field<'v>(value: &'v Value, verb: Verb, field: &str) -> Result<&'v Value> {
    value
        .get(field)
        .ok_or_else(|| Error::protocol(format!("{} message lacks '{}'", verb, field)))
}
