//! topicwire-protocol: payload envelope and entry model for the
//! conversation protocol carried over an append-only ledger.

pub mod constants;
pub mod entry;
pub mod envelope;
pub mod error;

pub use constants::*;
pub use entry::{Entry, ParsedEntry, TopicRole};
pub use envelope::{CloseMethod, Envelope, FeeTerms, Operation};
pub use error::ProtocolError;

/// Topic identifier as issued by the external ledger (opaque string,
/// e.g. "0.0.12345").
pub type TopicId = String;

/// Per-topic monotonic position marker. 0 = nothing consumed yet.
pub type Cursor = u64;
