//! Connection handshake state machine and registry.
//!
//! A connection is born from a `connection_request` observed on an inbound
//! topic, answered with a `connection_created` announce carrying a
//! dedicated topic, and lives as a fee-gated bidirectional channel until
//! either side closes it. The registry is owned and injected, never
//! process-global, so tests can run several managers side by side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use topicwire_ledger::{FeeContext, LedgerClient};
use topicwire_protocol::{
    envelope::now_ms, CloseMethod, Envelope, FeeTerms, Operation, ParsedEntry, TopicId,
    TopicRole, CONFIRMATION_DELAY_MS, CONFIRMATION_MAX_ATTEMPTS, DEFAULT_FETCH_TIMEOUT_MS,
};

use crate::error::NodeError;
use crate::fees::{FeeConfig, FeeMechanism};
use crate::poller::{LogPoller, TopicEvent};

// ============================================================================
// Connection record
// ============================================================================

/// Handshake progress. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Requested,
    Confirmed,
    Active,
    Closed,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        next > self
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Requested => "requested",
            Self::Confirmed => "confirmed",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    /// The dedicated conversation topic.
    pub topic: TopicId,
    pub requester: String,
    pub responder: String,
    /// Application context the connection belongs to (one responder may
    /// serve several personas/contexts).
    pub context: String,
    pub state: ConnectionState,
    /// Fee terms, fixed at activation. `None` = the channel is free.
    pub fee: Option<FeeConfig>,
    /// Sequence number of the `connection_request` entry this connection
    /// answers; echoed in the announce so the requester can match it.
    pub request_seq: u64,
    pub last_activity_ms: u64,
}

impl Connection {
    fn advance(&mut self, next: ConnectionState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    fn tuple(&self) -> (String, String, String) {
        (
            self.requester.clone(),
            self.responder.clone(),
            self.context.clone(),
        )
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct ConnectionSettings {
    /// This node's ledger account id.
    pub account: String,
    /// Per-message fee attached to connections this node responds to.
    /// `None` disables fee gating on newly created channels.
    pub fee_amount: Option<u64>,
    /// Fee collector account. Defaults to this node's own account.
    pub fee_collector: Option<String>,
    pub fee_mechanism: FeeMechanism,
    /// Requester-side confirmation wait budget: attempts x delay.
    pub confirmation_attempts: u32,
    pub confirmation_delay: Duration,
}

impl ConnectionSettings {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            fee_amount: None,
            fee_collector: None,
            fee_mechanism: FeeMechanism::LedgerNative,
            confirmation_attempts: CONFIRMATION_MAX_ATTEMPTS,
            confirmation_delay: Duration::from_millis(CONFIRMATION_DELAY_MS),
        }
    }
}

#[derive(Default)]
struct Registry {
    by_topic: HashMap<TopicId, Connection>,
    by_tuple: HashMap<(String, String, String), TopicId>,
    /// Requester-side handshakes currently awaiting confirmation.
    in_flight: std::collections::HashSet<(String, String, String)>,
}

pub struct ConnectionLifecycleManager {
    ledger: Arc<dyn LedgerClient>,
    poller: Arc<LogPoller>,
    settings: ConnectionSettings,
    registry: Mutex<Registry>,
}

impl ConnectionLifecycleManager {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        poller: Arc<LogPoller>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            ledger,
            poller,
            settings,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn account(&self) -> &str {
        &self.settings.account
    }

    // ========================================================================
    // Responder side
    // ========================================================================

    /// Accept a `connection_request` observed at `request_seq` on this
    /// node's inbound topic: create the dedicated topic, fix its fee terms,
    /// announce it on `outbound_topic`, and start monitoring it.
    ///
    /// Singleton rule: if a non-closed connection already exists for
    /// (requester, us, context), its topic is returned and no new channel
    /// is created. A retried handshake must never fork the conversation.
    pub async fn accept_request(
        &self,
        outbound_topic: &TopicId,
        context: &str,
        requester: &str,
        request_seq: u64,
        listener: mpsc::Sender<TopicEvent>,
    ) -> Result<TopicId, NodeError> {
        let tuple = (
            requester.to_string(),
            self.settings.account.clone(),
            context.to_string(),
        );
        {
            let mut reg = self.registry.lock().expect("registry poisoned");
            if let Some(topic) = reg.by_tuple.get(&tuple).cloned() {
                if let Some(conn) = reg.by_topic.get_mut(&topic) {
                    if conn.state != ConnectionState::Closed {
                        conn.last_activity_ms = now_ms();
                        tracing::debug!(
                            "Ignoring repeated connection_request from {requester}: \
                             reusing topic {topic}",
                        );
                        return Ok(topic);
                    }
                }
            }
        }

        let topic = self
            .ledger
            .create_topic(&format!("conn:{}:{}", requester, self.settings.account))
            .await?;

        // Fee terms are attached exactly once, here. Both parties start
        // exempt so handshake and welcome traffic is free; operators may
        // revoke that later.
        let fee = self.settings.fee_amount.map(|amount| {
            let collector = self
                .settings
                .fee_collector
                .clone()
                .unwrap_or_else(|| self.settings.account.clone());
            FeeConfig::new(
                amount,
                collector,
                self.settings.fee_mechanism,
                [requester.to_string(), self.settings.account.clone()],
            )
        });

        let announce = Envelope::new(Operation::ConnectionCreated {
            connection_id: request_seq,
            connection_topic: topic.clone(),
            requester: requester.to_string(),
            responder: self.settings.account.clone(),
            fee: fee.as_ref().map(|f| FeeTerms {
                amount: f.amount,
                collector: f.collector.clone(),
            }),
        })
        .encode()?;

        // Registered as Requested until the announce is out: a record must
        // never look Active while the requester has no way to learn of it.
        let conn = Connection {
            topic: topic.clone(),
            requester: requester.to_string(),
            responder: self.settings.account.clone(),
            context: context.to_string(),
            state: ConnectionState::Requested,
            fee,
            request_seq,
            last_activity_ms: now_ms(),
        };
        {
            let mut reg = self.registry.lock().expect("registry poisoned");
            reg.by_tuple.insert(tuple.clone(), topic.clone());
            reg.by_topic.insert(topic.clone(), conn);
        }

        if let Err(e) = self
            .ledger
            .append_entry(outbound_topic, &announce, None)
            .await
        {
            // Roll the handshake back: a retried connection_request must
            // re-run the accept path, not land on a half-built record.
            let mut reg = self.registry.lock().expect("registry poisoned");
            reg.by_topic.remove(&topic);
            reg.by_tuple.remove(&tuple);
            tracing::warn!(
                "Announce append failed for {requester}, discarding handshake state: {e}",
            );
            return Err(e.into());
        }

        {
            let mut reg = self.registry.lock().expect("registry poisoned");
            if let Some(conn) = reg.by_topic.get_mut(&topic) {
                conn.advance(ConnectionState::Active);
            }
        }
        self.poller
            .start_monitoring(&topic, TopicRole::Connection, listener)
            .await?;

        tracing::info!(
            "Accepted connection from {requester} (request seq {request_seq}) on topic {topic}",
        );
        Ok(topic)
    }

    // ========================================================================
    // Requester side
    // ========================================================================

    /// Send a `connection_request` to a responder's inbound topic, then
    /// poll their outbound topic for the matching `connection_created`
    /// announce. The wait is bounded: attempts x delay, after which the
    /// attempt fails with a timeout and is not retried automatically.
    pub async fn initiate(
        &self,
        responder: &str,
        responder_inbound: &TopicId,
        responder_outbound: &TopicId,
        context: &str,
        listener: mpsc::Sender<TopicEvent>,
    ) -> Result<TopicId, NodeError> {
        let tuple = (
            self.settings.account.clone(),
            responder.to_string(),
            context.to_string(),
        );
        {
            let mut reg = self.registry.lock().expect("registry poisoned");
            if let Some(topic) = reg.by_tuple.get(&tuple).cloned() {
                if reg
                    .by_topic
                    .get(&topic)
                    .is_some_and(|c| c.state != ConnectionState::Closed)
                {
                    tracing::debug!("Connection to {responder} already open on {topic}");
                    return Ok(topic);
                }
            }
            if !reg.in_flight.insert(tuple.clone()) {
                return Err(NodeError::HandshakeInProgress {
                    requester: self.settings.account.clone(),
                    responder: responder.to_string(),
                });
            }
        }

        let result = self
            .initiate_inner(responder, responder_inbound, responder_outbound, context)
            .await;
        {
            let mut reg = self.registry.lock().expect("registry poisoned");
            reg.in_flight.remove(&tuple);
        }

        let topic = result?;
        self.poller
            .start_monitoring(&topic, TopicRole::Connection, listener)
            .await?;
        Ok(topic)
    }

    async fn initiate_inner(
        &self,
        responder: &str,
        responder_inbound: &TopicId,
        responder_outbound: &TopicId,
        context: &str,
    ) -> Result<TopicId, NodeError> {
        // Capture the outbound tip before requesting, so the scan below
        // only ever looks at announces that can possibly answer us.
        let mut scan_from = self.ledger.latest_sequence(responder_outbound).await?;

        let request = Envelope::new(Operation::ConnectionRequest {
            requester: self.settings.account.clone(),
        })
        .encode()?;
        let request_seq = self
            .ledger
            .append_entry(responder_inbound, &request, None)
            .await?;
        tracing::info!(
            "Connection request to {responder} appended at {responder_inbound}@{request_seq}",
        );

        let fetch_timeout = Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS);
        let attempts = self.settings.confirmation_attempts;
        for attempt in 1..=attempts {
            let fetched = tokio::time::timeout(
                fetch_timeout,
                self.ledger.get_entries_since(responder_outbound, scan_from),
            )
            .await;
            let entries = match fetched {
                Err(_) => {
                    tracing::warn!("Confirmation fetch timed out (attempt {attempt}/{attempts})");
                    Vec::new()
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Confirmation fetch failed (attempt {attempt}/{attempts}): {e}"
                    );
                    Vec::new()
                }
                Ok(Ok(entries)) => entries,
            };

            for entry in &entries {
                scan_from = scan_from.max(entry.sequence_number);
                let Ok(parsed) = ParsedEntry::from_entry(entry) else {
                    continue;
                };
                if let Operation::ConnectionCreated {
                    connection_id,
                    connection_topic,
                    requester,
                    fee,
                    ..
                } = &parsed.envelope.operation
                {
                    if *connection_id == request_seq && requester == &self.settings.account {
                        let topic = connection_topic.clone();
                        self.record_confirmed(
                            responder,
                            context,
                            &topic,
                            request_seq,
                            fee.clone(),
                        );
                        tracing::info!(
                            "Connection to {responder} confirmed on topic {topic} \
                             (attempt {attempt})",
                        );
                        return Ok(topic);
                    }
                }
            }

            tokio::time::sleep(self.settings.confirmation_delay).await;
        }

        Err(NodeError::ConnectionTimeout {
            attempts,
            waited_ms: attempts as u64 * self.settings.confirmation_delay.as_millis() as u64,
        })
    }

    /// Requester-side bookkeeping once the announce is seen. The requester
    /// only learns after the responder already activated the channel, so
    /// CONFIRMED is passed through and the record lands ACTIVE.
    fn record_confirmed(
        &self,
        responder: &str,
        context: &str,
        topic: &TopicId,
        request_seq: u64,
        fee: Option<FeeTerms>,
    ) {
        // The responder owns the fee terms and advertised them in the
        // announce; the requester mirrors them verbatim, along with the
        // default exemption it was granted at activation.
        let fee = fee.map(|terms| {
            FeeConfig::new(
                terms.amount,
                terms.collector,
                self.settings.fee_mechanism,
                [self.settings.account.clone(), responder.to_string()],
            )
        });
        let conn = Connection {
            topic: topic.clone(),
            requester: self.settings.account.clone(),
            responder: responder.to_string(),
            context: context.to_string(),
            state: ConnectionState::Active,
            fee,
            request_seq,
            last_activity_ms: now_ms(),
        };
        let mut reg = self.registry.lock().expect("registry poisoned");
        reg.by_tuple.insert(conn.tuple(), topic.clone());
        reg.by_topic.insert(topic.clone(), conn);
    }

    // ========================================================================
    // Active-channel traffic
    // ========================================================================

    /// Append a `message` envelope on an active connection topic, settling
    /// the per-message fee first when the sender is not exempt.
    pub async fn send_message(
        &self,
        topic: &TopicId,
        data: String,
        correlation_id: Option<String>,
        response_id: Option<String>,
        memo: Option<String>,
    ) -> Result<u64, NodeError> {
        let fee = {
            let reg = self.registry.lock().expect("registry poisoned");
            let conn = reg
                .by_topic
                .get(topic)
                .ok_or_else(|| NodeError::UnknownConnection(topic.clone()))?;
            if conn.state != ConnectionState::Active {
                return Err(NodeError::NotActive(topic.clone()));
            }
            conn.fee.clone()
        };

        let fee_ctx = match &fee {
            Some(fee) => fee.settle(self.ledger.as_ref(), &self.settings.account).await?,
            None => None,
        };

        let mut envelope = Envelope::new(Operation::Message {
            correlation_id,
            response_id,
            data,
        });
        if let Some(memo) = memo {
            envelope = envelope.with_memo(memo);
        }
        let payload = envelope.encode()?;

        let seq = match self.ledger.append_entry(topic, &payload, fee_ctx.clone()).await {
            Ok(seq) => seq,
            Err(e) => {
                if fee_ctx == Some(FeeContext::Settled) {
                    // Two-step fallback gap: the fee moved but the write
                    // did not land. No automatic refund or retry; the
                    // operator reconciles from this record.
                    tracing::error!(
                        "FEE PAID BUT MESSAGE WRITE FAILED on topic {topic}: {e}. \
                         Fee transfer is not rolled back.",
                    );
                }
                return Err(e.into());
            }
        };

        self.touch(topic);
        Ok(seq)
    }

    /// Close an active connection: append the `close_connection` marker,
    /// mark the record closed, and tear down the topic's poll loop.
    pub async fn close(
        &self,
        topic: &TopicId,
        reason: &str,
        method: CloseMethod,
    ) -> Result<(), NodeError> {
        {
            let reg = self.registry.lock().expect("registry poisoned");
            let conn = reg
                .by_topic
                .get(topic)
                .ok_or_else(|| NodeError::UnknownConnection(topic.clone()))?;
            if conn.state == ConnectionState::Closed {
                return Ok(());
            }
        }

        let payload = Envelope::new(Operation::CloseConnection {
            reason: reason.to_string(),
            close_method: method,
        })
        .encode()?;
        self.ledger.append_entry(topic, &payload, None).await?;

        self.mark_closed(topic);
        self.poller.stop_monitoring(topic).await;
        tracing::info!("Closed connection on topic {topic}: {reason}");
        Ok(())
    }

    /// Drive state from a classified entry on a connection topic: a close
    /// marker from the other side tears the channel down, conversational
    /// traffic refreshes the activity clock.
    pub async fn observe(&self, event: &TopicEvent) {
        if event.role != TopicRole::Connection {
            return;
        }
        match &event.entry.envelope.operation {
            Operation::CloseConnection { reason, .. } => {
                if self.mark_closed(&event.topic) {
                    tracing::info!(
                        "Connection on {} closed by counterparty: {reason}",
                        event.topic,
                    );
                    self.poller.stop_monitoring(&event.topic).await;
                }
            }
            Operation::Message { .. } => self.touch(&event.topic),
            _ => {}
        }
    }

    // ========================================================================
    // Registry queries
    // ========================================================================

    pub fn get_connection(&self, topic: &TopicId) -> Option<Connection> {
        self.registry
            .lock()
            .expect("registry poisoned")
            .by_topic
            .get(topic)
            .cloned()
    }

    pub fn is_active(&self, topic: &TopicId) -> bool {
        self.registry
            .lock()
            .expect("registry poisoned")
            .by_topic
            .get(topic)
            .is_some_and(|c| c.state == ConnectionState::Active)
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.registry
            .lock()
            .expect("registry poisoned")
            .by_topic
            .values()
            .cloned()
            .collect()
    }

    /// Operator hook: revoke a fee exemption granted at activation.
    pub fn revoke_fee_exemption(&self, topic: &TopicId, account: &str) -> bool {
        let mut reg = self.registry.lock().expect("registry poisoned");
        reg.by_topic
            .get_mut(topic)
            .and_then(|c| c.fee.as_mut())
            .is_some_and(|fee| fee.revoke_exemption(account))
    }

    fn touch(&self, topic: &TopicId) {
        let mut reg = self.registry.lock().expect("registry poisoned");
        if let Some(conn) = reg.by_topic.get_mut(topic) {
            conn.last_activity_ms = now_ms();
        }
    }

    fn mark_closed(&self, topic: &TopicId) -> bool {
        let mut reg = self.registry.lock().expect("registry poisoned");
        reg.by_topic
            .get_mut(topic)
            .is_some_and(|c| c.advance(ConnectionState::Closed))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
