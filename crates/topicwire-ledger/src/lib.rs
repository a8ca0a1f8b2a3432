// topicwire-ledger: the read/write interface to the external append-only
// log service, plus an in-memory implementation for tests and local demos.

pub mod client;
pub mod error;
pub mod memory;

pub use client::{FeeContext, LedgerClient};
pub use error::LedgerError;
pub use memory::MemoryLedger;
