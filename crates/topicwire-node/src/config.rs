use std::time::Duration;

use clap::Parser;

use topicwire_protocol::{
    TopicId, CONFIRMATION_DELAY_MS, CONFIRMATION_MAX_ATTEMPTS, DEDUP_SWEEP_INTERVAL_MS,
    DEDUP_TTL_MS, DEFAULT_FEE_AMOUNT, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS,
};

use crate::connection::ConnectionSettings;
use crate::fees::FeeMechanism;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "topicwire-node",
    about = "Topic monitor, connection lifecycle and response correlation daemon"
)]
pub struct Config {
    /// This node's ledger account id.
    #[arg(long, env = "TW_ACCOUNT", default_value = "0.0.2")]
    pub account: String,

    /// Topic receiving connection requests addressed to this node.
    /// If absent, the node runs requester-only and accepts nothing.
    #[arg(long, env = "TW_INBOUND_TOPIC")]
    pub inbound_topic: Option<TopicId>,

    /// Topic this node announces handshake confirmations on.
    #[arg(long, env = "TW_OUTBOUND_TOPIC")]
    pub outbound_topic: Option<TopicId>,

    /// Application context (persona) this node serves. Part of the
    /// connection identity: one channel per (requester, responder, context).
    #[arg(long, env = "TW_CONTEXT", default_value = "default")]
    pub context: String,

    /// Milliseconds between poll cycles per monitored topic.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Upper bound on a single ledger read, milliseconds.
    #[arg(long, default_value_t = DEFAULT_FETCH_TIMEOUT_MS)]
    pub fetch_timeout_ms: u64,

    /// Per-message fee on connection topics this node creates, in the
    /// ledger's smallest denomination. 0 disables fee gating.
    #[arg(long, env = "TW_FEE_AMOUNT", default_value_t = DEFAULT_FEE_AMOUNT)]
    pub fee_amount: u64,

    /// Fee collector account. Defaults to this node's own account.
    #[arg(long, env = "TW_FEE_COLLECTOR")]
    pub fee_collector: Option<String>,

    /// How per-message fees are moved.
    #[arg(long, value_enum, default_value = "ledger-native")]
    pub fee_mechanism: FeeMechanism,

    /// Requester-side confirmation wait: number of outbound-topic scans.
    #[arg(long, default_value_t = CONFIRMATION_MAX_ATTEMPTS)]
    pub confirmation_attempts: u32,

    /// Delay between confirmation scans, milliseconds.
    #[arg(long, default_value_t = CONFIRMATION_DELAY_MS)]
    pub confirmation_delay_ms: u64,

    /// How long processed message ids are remembered, milliseconds.
    #[arg(long, default_value_t = DEDUP_TTL_MS)]
    pub dedup_ttl_ms: u64,

    /// Interval between dedup cache sweeps, milliseconds.
    #[arg(long, default_value_t = DEDUP_SWEEP_INTERVAL_MS)]
    pub dedup_sweep_interval_ms: u64,

    /// Default wait for a correlated response, milliseconds.
    #[arg(long, default_value_t = 30_000)]
    pub response_timeout_ms: u64,

    /// Run the built-in two-party demo over the in-memory ledger and exit.
    #[arg(long)]
    pub demo: bool,
}

impl Config {
    pub fn connection_settings(&self) -> ConnectionSettings {
        let mut settings = ConnectionSettings::new(self.account.as_str());
        settings.fee_amount = (self.fee_amount > 0).then_some(self.fee_amount);
        settings.fee_collector = self.fee_collector.clone();
        settings.fee_mechanism = self.fee_mechanism;
        settings.confirmation_attempts = self.confirmation_attempts;
        settings.confirmation_delay = Duration::from_millis(self.confirmation_delay_ms);
        settings
    }
}
