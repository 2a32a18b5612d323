//! Execution strategies
//!
//! A strategy runs task descriptors for one handler name. The host keeps the
//! root task's strategy instance across consecutive cycles with the same
//! handler and asks fresh instances to validate spawned children.
//!
//! Built-in strategies:
//! - `literal`: publishes constant values
//! - `script`: runs a compiled-in program under the cooperative runtime

mod channel;
mod literal;
mod programs;
mod registry;
mod script;
mod traits;

pub use channel::*;
pub use literal::*;
pub use programs::*;
pub use registry::*;
pub use script::*;
pub use traits::*;

use std::fs;

use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{RefKind, Reference};

/// Publish `bytes` as output `id`, inline when at or below the threshold
pub fn publish_bytes(host: &dyn TaskCallbacks, id: &str, bytes: &[u8]) -> Result<Reference> {
    let reference = if bytes.len() <= host.runtime_settings().inline_threshold_bytes {
        Reference::inline(id, bytes)
    } else {
        let path = host.block_store().write(id, bytes)?;
        debug!(ref_id = id, path = %path.display(), size = bytes.len(), "Output stored as block");
        Reference::concrete(id, Some(bytes.len() as u64))
    };
    host.publish_ref(reference.clone());
    Ok(reference)
}

/// Read the full contents behind a reference the host can resolve now
pub fn read_reference_bytes(host: &dyn TaskCallbacks, reference: &Reference) -> Result<Vec<u8>> {
    let resolved = host.resolve_ref(reference)?;
    match &resolved.kind {
        RefKind::InlineData { .. } => resolved.inline_bytes().unwrap_or_else(|| Ok(Vec::new())),
        RefKind::Error { reason } => Err(Error::ErrorReference {
            id: resolved.id.clone(),
            reason: reason.clone(),
        }),
        RefKind::Concrete { .. } => {
            let store = host.block_store();
            match store.stream_status(&resolved.id) {
                Some(status) if status.done => {
                    let path = store.path_for(&resolved.id);
                    fs::read(&path).map_err(|source| Error::IoRead { path, source })
                }
                _ => Err(Error::unavailable(resolved.id.clone())),
            }
        }
        RefKind::Future => Err(Error::unavailable(resolved.id.clone())),
    }
}

#[cfg(test)]
pub(crate) mod testing;
