use async_trait::async_trait;

use topicwire_protocol::{Cursor, Entry, TopicId};

use crate::error::LedgerError;

/// Fee handling attached to a single append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeeContext {
    /// The ledger natively deducts the topic's configured fee from the
    /// payer as part of accepting the write.
    Native { payer: String },
    /// The fee was already moved by a separate `transfer` call; the append
    /// itself is plain. Used by the two-step fallback (and its retries,
    /// which must not pay twice).
    Settled,
}

/// Client for the external ledger service.
///
/// The ledger is assumed reliable-eventually: reads are idempotent and may
/// return the same entries across calls, in no guaranteed order. Appends
/// surface failure synchronously to the caller.
///
/// Implementations wrap whatever transaction construction and signing the
/// concrete ledger needs; none of that leaks through this interface.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Fetch entries with `sequence_number > cursor`. MUST be safe to call
    /// repeatedly with the same cursor. Order is not guaranteed; callers
    /// sort by sequence number.
    async fn get_entries_since(
        &self,
        topic: &TopicId,
        cursor: Cursor,
    ) -> Result<Vec<Entry>, LedgerError>;

    /// Append an opaque payload, returning the assigned sequence number.
    async fn append_entry(
        &self,
        topic: &TopicId,
        payload: &str,
        fee: Option<FeeContext>,
    ) -> Result<u64, LedgerError>;

    /// Highest sequence number currently present on the topic
    /// (0 for an empty topic). Used to initialize a cursor at tip.
    async fn latest_sequence(&self, topic: &TopicId) -> Result<u64, LedgerError>;

    /// Create a new topic and return its id.
    async fn create_topic(&self, memo: &str) -> Result<TopicId, LedgerError>;

    /// Move `amount` from one account to another. The explicit-transfer fee
    /// mechanism uses this when the ledger has no native pay-and-write.
    async fn transfer(&self, from: &str, to: &str, amount: u64) -> Result<(), LedgerError>;
}
