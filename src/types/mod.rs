//! Shared data model
//!
//! References, task descriptors and the per-cycle abort signal. Everything
//! else in the worker builds on these.

mod descriptor;
mod reference;
mod signal;

pub use descriptor::*;
pub use reference::*;
pub use signal::*;
