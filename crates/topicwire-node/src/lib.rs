//! topicwire-node: topic polling, message deduplication, connection
//! lifecycle, and request/response correlation over an external
//! append-only ledger.

pub mod config;
pub mod connection;
pub mod correlate;
pub mod dedup;
pub mod error;
pub mod fees;
pub mod node;
pub mod poller;

pub use config::Config;
pub use connection::{Connection, ConnectionLifecycleManager, ConnectionSettings, ConnectionState};
pub use correlate::{ResponseCorrelator, ResponseFuture};
pub use dedup::Deduplicator;
pub use error::NodeError;
pub use fees::{FeeConfig, FeeMechanism};
pub use node::{InboundMessage, Node, NodeHandle, ResponderHook};
pub use poller::{LogPoller, TopicEvent};
