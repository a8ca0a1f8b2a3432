use thiserror::Error;

use topicwire_ledger::LedgerError;
use topicwire_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Requester-side confirmation wait exhausted its attempt budget.
    #[error("connection request timed out after {attempts} attempts ({waited_ms}ms)")]
    ConnectionTimeout { attempts: u32, waited_ms: u64 },

    /// A handshake for the same (requester, responder, context) tuple is
    /// already awaiting confirmation.
    #[error("connection request already in flight: {requester} -> {responder}")]
    HandshakeInProgress {
        requester: String,
        responder: String,
    },

    /// Caller error: a pending response already exists for this id.
    #[error("correlation id already registered: {0}")]
    DuplicateCorrelation(String),

    #[error("no response for correlation id {id} within {timeout_ms}ms")]
    ResponseTimeout { id: String, timeout_ms: u64 },

    /// The pending response was removed without being resolved
    /// (explicit cancel, or correlator shutdown).
    #[error("response wait cancelled for correlation id {0}")]
    ResponseCancelled(String),

    #[error("no connection registered for topic {0}")]
    UnknownConnection(String),

    #[error("connection on topic {0} is not active")]
    NotActive(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
