use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol id: {0}")]
    UnsupportedProtocol(String),

    #[error("payload decode error: {0}")]
    PayloadDecode(String),

    #[error("payload encode error: {0}")]
    PayloadEncode(String),

    #[error("payload too large: {size} bytes exceeds {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
}
