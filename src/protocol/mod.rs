//! Bus protocol: topic grammar and wire payloads
//!
//! Everything a component needs to agree on with its peers lives here; the
//! transport layer treats payloads as opaque JSON values.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
