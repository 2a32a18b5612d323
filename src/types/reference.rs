//! Reference definitions
//!
//! A reference names a value that may already be available (inline data),
//! may never be (an error marker), or still has to be fetched.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reference identifier, unique within a task graph
pub type RefId = String;

/// A named value in the task graph
///
/// Serialized as `{"id": ..., "kind": ..., ...kind-specific fields}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: RefId,

    #[serde(flatten)]
    pub kind: RefKind,
}

/// Reference kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefKind {
    /// Value carried in the reference itself (base64)
    InlineData { data: String },

    /// The producer failed; the value will never exist
    Error { reason: String },

    /// Not yet produced
    Future,

    /// Produced and stored as a block
    Concrete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_hint: Option<u64>,

        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        location_hints: Vec<String>,
    },
}

impl Reference {
    pub fn inline(id: impl Into<RefId>, bytes: &[u8]) -> Self {
        Self {
            id: id.into(),
            kind: RefKind::InlineData {
                data: BASE64.encode(bytes),
            },
        }
    }

    pub fn future(id: impl Into<RefId>) -> Self {
        Self {
            id: id.into(),
            kind: RefKind::Future,
        }
    }

    pub fn concrete(id: impl Into<RefId>, size_hint: Option<u64>) -> Self {
        Self {
            id: id.into(),
            kind: RefKind::Concrete {
                size_hint,
                location_hints: Vec::new(),
            },
        }
    }

    /// Self-contained references never need a fetch.
    ///
    /// Decided from the kind alone.
    pub fn is_consumable(&self) -> bool {
        matches!(self.kind, RefKind::InlineData { .. } | RefKind::Error { .. })
    }

    /// Decoded payload of an inline reference, `None` for other kinds
    pub fn inline_bytes(&self) -> Option<Result<Vec<u8>>> {
        match &self.kind {
            RefKind::InlineData { data } => Some(
                BASE64
                    .decode(data)
                    .map_err(|e| Error::decode(self.id.clone(), e)),
            ),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            RefKind::InlineData { .. } => "inline_data",
            RefKind::Error { .. } => "error",
            RefKind::Future => "future",
            RefKind::Concrete { .. } => "concrete",
        }
    }
}

/// Error markers arrive from the coordinator; the worker never mints one
#[cfg(test)]
impl Reference {
    pub fn error(id: impl Into<RefId>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: RefKind::Error {
                reason: reason.into(),
            },
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.kind_name(), self.id)
    }
}
