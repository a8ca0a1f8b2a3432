use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("append rejected by ledger: {0}")]
    AppendRejected(String),

    #[error("insufficient balance: account {account} has {available}, needs {required}")]
    InsufficientBalance {
        account: String,
        available: u64,
        required: u64,
    },
}
