//! Protocol definitions
//!
//! Two wires meet in the worker:
//! - the host message channel between a running computation and its host
//!   (`channel`), request verbs plus reference delivery responses
//! - the coordinator wire (`messages`), JSON lines carrying worker input and
//!   commit/spawn/failure reports, versioned through `version`

mod channel;
mod messages;
mod version;

pub use channel::*;
pub use messages::*;
pub use version::*;
