//! Node wiring: one event loop consuming classified entries from the
//! poller and driving the dedup cache, connection lifecycle manager,
//! response correlator, and the application delivery channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use topicwire_ledger::LedgerClient;
use topicwire_protocol::{
    envelope::new_correlation_id, CloseMethod, Operation, TopicId, TopicRole,
};

use crate::config::Config;
use crate::connection::{Connection, ConnectionLifecycleManager};
use crate::correlate::ResponseCorrelator;
use crate::dedup::Deduplicator;
use crate::error::NodeError;
use crate::poller::{LogPoller, TopicEvent};

/// Application seam: invoked with unsolicited prompts on connection
/// topics. Returning `Some` appends a correlated reply. What produces the
/// reply (a model, a script, a human) is outside this subsystem.
#[async_trait]
pub trait ResponderHook: Send + Sync {
    async fn respond(&self, topic: &TopicId, prompt: &str) -> Option<String>;
}

/// An unsolicited conversational entry handed to the application.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: TopicId,
    pub sender: Option<String>,
    pub data: String,
    /// Present when the sender expects a correlated reply.
    pub response_id: Option<String>,
}

pub struct Node {
    config: Config,
    poller: Arc<LogPoller>,
    dedup: Deduplicator,
    manager: Arc<ConnectionLifecycleManager>,
    correlator: ResponseCorrelator,
    hook: Option<Arc<dyn ResponderHook>>,

    event_tx: mpsc::Sender<TopicEvent>,
    event_rx: mpsc::Receiver<TopicEvent>,
    app_tx: mpsc::Sender<InboundMessage>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Node {
    /// Build a node over the given ledger client. Returns the node plus
    /// the receiver for unsolicited inbound messages.
    pub fn new(
        config: Config,
        ledger: Arc<dyn LedgerClient>,
        hook: Option<Arc<dyn ResponderHook>>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let poller = Arc::new(LogPoller::with_intervals(
            Arc::clone(&ledger),
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_millis(config.fetch_timeout_ms),
        ));
        let dedup = Deduplicator::with_ttl(config.dedup_ttl_ms);
        let manager = Arc::new(ConnectionLifecycleManager::new(
            Arc::clone(&ledger),
            Arc::clone(&poller),
            config.connection_settings(),
        ));
        let correlator = ResponseCorrelator::new();

        let (event_tx, event_rx) = mpsc::channel(256);
        let (app_tx, app_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let node = Self {
            config,
            poller,
            dedup,
            manager,
            correlator,
            hook,
            event_tx,
            event_rx,
            app_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        };
        (node, app_rx)
    }

    /// Cloneable control-surface for callers outside the event loop.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            context: self.config.context.clone(),
            manager: Arc::clone(&self.manager),
            correlator: self.correlator.clone(),
            poller: Arc::clone(&self.poller),
            event_tx: self.event_tx.clone(),
            shutdown: Arc::clone(&self.shutdown_tx),
            response_timeout: Duration::from_millis(self.config.response_timeout_ms),
        }
    }

    /// Run until shutdown. Starts inbound-topic monitoring and the dedup
    /// sweeper, then drains classified entries.
    pub async fn run(mut self) -> anyhow::Result<()> {
        if let Some(inbound) = self.config.inbound_topic.clone() {
            self.poller
                .start_monitoring(&inbound, TopicRole::Inbound, self.event_tx.clone())
                .await?;
        } else {
            tracing::warn!("No inbound topic configured; node will not accept connections");
        }
        let sweeper = self
            .dedup
            .start_sweeper_every(Duration::from_millis(self.config.dedup_sweep_interval_ms));

        tracing::info!("Node {} running (context {})", self.config.account, self.config.context);
        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }
                _ = self.shutdown_rx.changed() => {
                    break;
                }
            }
        }

        tracing::info!("Node {} shutting down", self.config.account);
        self.poller.stop_all().await;
        sweeper.abort();
        Ok(())
    }

    // ========================================================================
    // Event classification
    // ========================================================================

    async fn handle_event(&self, event: TopicEvent) {
        match (&event.role, &event.entry.envelope.operation) {
            (TopicRole::Inbound, Operation::ConnectionRequest { requester }) => {
                self.handle_connection_request(&event, requester.clone()).await;
            }
            (TopicRole::Connection, Operation::Message { .. }) => {
                self.handle_message(&event).await;
            }
            (TopicRole::Connection, Operation::CloseConnection { .. }) => {
                self.manager.observe(&event).await;
            }
            (role, op) => {
                tracing::debug!(
                    "Ignoring {op} entry on {} (role={role})",
                    event.topic,
                );
            }
        }
    }

    async fn handle_connection_request(&self, event: &TopicEvent, requester: String) {
        // The ledger resurfaces entries; the cursor usually shields us, but
        // the cache is the at-most-once guarantee across restarts of a
        // poll loop within the TTL window.
        let key = entry_key(&event.topic, event.entry.sequence_number);
        if !self.dedup.check_and_remember(&key) {
            tracing::debug!("Connection request {key} already processed");
            return;
        }
        let Some(outbound) = self.config.outbound_topic.clone() else {
            tracing::warn!("Dropping connection_request from {requester}: no outbound topic");
            return;
        };
        if let Err(e) = self
            .manager
            .accept_request(
                &outbound,
                &self.config.context,
                &requester,
                event.entry.sequence_number,
                self.event_tx.clone(),
            )
            .await
        {
            tracing::error!("Failed to accept connection from {requester}: {e}");
        }
    }

    async fn handle_message(&self, event: &TopicEvent) {
        self.manager.observe(event).await;

        let Operation::Message {
            correlation_id,
            response_id,
            data,
        } = &event.entry.envelope.operation
        else {
            return;
        };

        // A correlated response first tries to resolve a pending wait.
        if let Some(cid) = correlation_id {
            if self.correlator.resolve(cid, data.clone()) {
                self.dedup.remember(cid);
                return;
            }
            if self.dedup.has(cid) {
                // Duplicate of an already-resolved response.
                return;
            }
        }

        // Our own writes come back off the shared topic; never hand them
        // to the application or answer our own prompt.
        if event.entry.sender.as_deref() == Some(self.config.account.as_str()) {
            return;
        }

        let key = entry_key(&event.topic, event.entry.sequence_number);
        if !self.dedup.check_and_remember(&key) {
            return;
        }

        let inbound = InboundMessage {
            topic: event.topic.clone(),
            sender: event.entry.sender.clone(),
            data: data.clone(),
            response_id: response_id.clone(),
        };
        if self.app_tx.send(inbound).await.is_err() {
            tracing::debug!("Application channel closed, dropping inbound message");
        }

        if let (Some(hook), Some(rid)) = (&self.hook, response_id) {
            // One reply per response id, even if the prompt is re-observed
            // at a different sequence later.
            if !self.dedup.check_and_remember(&format!("reply:{rid}")) {
                return;
            }
            if let Some(reply) = hook.respond(&event.topic, data).await {
                if let Err(e) = self
                    .manager
                    .send_message(&event.topic, reply, Some(rid.clone()), None, None)
                    .await
                {
                    tracing::error!("Failed to send reply on {}: {e}", event.topic);
                }
            }
        }
    }
}

// ============================================================================
// NodeHandle
// ============================================================================

/// Control surface usable concurrently with the running event loop.
#[derive(Clone)]
pub struct NodeHandle {
    context: String,
    manager: Arc<ConnectionLifecycleManager>,
    correlator: ResponseCorrelator,
    poller: Arc<LogPoller>,
    event_tx: mpsc::Sender<TopicEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    response_timeout: Duration,
}

impl NodeHandle {
    /// Open (or reuse) a connection to a responder. Blocks for at most the
    /// configured confirmation budget.
    pub async fn connect(
        &self,
        responder: &str,
        responder_inbound: &TopicId,
        responder_outbound: &TopicId,
    ) -> Result<TopicId, NodeError> {
        self.manager
            .initiate(
                responder,
                responder_inbound,
                responder_outbound,
                &self.context,
                self.event_tx.clone(),
            )
            .await
    }

    /// Send a request expecting a correlated response, and wait for it.
    pub async fn send_request(&self, topic: &TopicId, data: String) -> Result<String, NodeError> {
        self.send_request_with_timeout(topic, data, self.response_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        topic: &TopicId,
        data: String,
        timeout: Duration,
    ) -> Result<String, NodeError> {
        let rid = new_correlation_id();
        let rx = self.correlator.register(&rid, timeout)?;
        if let Err(e) = self
            .manager
            .send_message(topic, data, None, Some(rid.clone()), None)
            .await
        {
            self.correlator.cancel(&rid);
            return Err(e);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(NodeError::ResponseCancelled(rid)),
        }
    }

    /// Fire-and-forget message with no response expected.
    pub async fn send_oneway(&self, topic: &TopicId, data: String) -> Result<u64, NodeError> {
        self.manager.send_message(topic, data, None, None, None).await
    }

    pub async fn close(&self, topic: &TopicId, reason: &str) -> Result<(), NodeError> {
        self.manager
            .close(topic, reason, CloseMethod::RequesterRequest)
            .await
    }

    /// Abandon a pending response wait.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.correlator.cancel(correlation_id)
    }

    pub fn get_connection(&self, topic: &TopicId) -> Option<Connection> {
        self.manager.get_connection(topic)
    }

    pub fn is_active(&self, topic: &TopicId) -> bool {
        self.manager.is_active(topic)
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.manager.connections()
    }

    pub fn is_monitoring(&self, topic: &TopicId) -> bool {
        self.poller.is_monitoring(topic)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

fn entry_key(topic: &TopicId, sequence: u64) -> String {
    format!("{topic}#{sequence}")
}
