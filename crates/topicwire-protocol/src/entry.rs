use serde::{Deserialize, Serialize};

use crate::{envelope::Envelope, error::ProtocolError};

/// The role a monitored topic plays for this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicRole {
    /// Receives connection requests addressed to this node.
    Inbound,
    /// Carries this node's handshake confirmations (and is polled by
    /// requesters waiting for them).
    Outbound,
    /// A dedicated, possibly fee-gated, conversation channel.
    Connection,
}

impl std::fmt::Display for TopicRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Connection => "connection",
        };
        f.write_str(name)
    }
}

/// One raw record read from a ledger topic. Immutable once read.
///
/// `sequence_number` is monotonic per topic and is the only ordering key;
/// it is not unique across topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub sequence_number: u64,
    /// Raw payload bytes as a UTF-8 string (the ledger stores opaque data;
    /// this protocol puts JSON in it).
    pub payload: String,
    /// Ledger-attested sender account, when the ledger exposes one.
    pub sender: Option<String>,
    /// Ledger consensus timestamp, unix milliseconds.
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// An entry whose payload has been decoded exactly once.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub sequence_number: u64,
    pub sender: Option<String>,
    pub timestamp_ms: u64,
    pub envelope: Envelope,
}

impl ParsedEntry {
    /// Decode a raw entry. A failure here means the entry is skipped by the
    /// poller (logged, cursor still advances), never retried.
    pub fn from_entry(entry: &Entry) -> Result<Self, ProtocolError> {
        let envelope = Envelope::decode(&entry.payload)?;
        Ok(Self {
            sequence_number: entry.sequence_number,
            sender: entry.sender.clone(),
            timestamp_ms: entry.timestamp_ms,
            envelope,
        })
    }
}
