//! Protocol-wide constants.

/// Protocol identifier carried in every envelope's `p` field.
pub const PROTOCOL_ID: &str = "conn-v1";

/// Default interval between poll cycles for a monitored topic.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Upper bound on a single ledger read. A poll cycle must never block
/// past this; a slow fetch is treated as a transient failure.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

/// How long a processed message id is remembered before it may be
/// legitimately reprocessed.
pub const DEDUP_TTL_MS: u64 = 24 * 60 * 60 * 1_000;

/// Interval between dedup cache sweeps.
pub const DEDUP_SWEEP_INTERVAL_MS: u64 = 60 * 60 * 1_000;

/// Requester-side confirmation wait: attempts x delay bounds the total
/// time spent polling the outbound topic for `connection_created`.
pub const CONFIRMATION_MAX_ATTEMPTS: u32 = 30;
pub const CONFIRMATION_DELAY_MS: u64 = 2_000;

/// Default per-message fee charged on a fee-gated connection topic,
/// in the ledger's smallest denomination.
pub const DEFAULT_FEE_AMOUNT: u64 = 1_000_000;

/// Maximum accepted payload size for a single entry, in bytes.
/// Oversized payloads are rejected before the append is attempted.
pub const MAX_PAYLOAD_SIZE: usize = 1_024 * 1_024;
