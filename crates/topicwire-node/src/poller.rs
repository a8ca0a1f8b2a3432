//! Per-topic polling loops over the ledger's pull-only read interface.
//!
//! The ledger offers no push, no server-side cursor, no exactly-once
//! delivery; each monitored topic gets its own cancellable task that
//! fetches on a fixed interval, filters to strictly-new entries, sorts
//! by sequence number, and fans classified entries out to listeners.
//! Ordering and at-most-once guarantees are built here, client-side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use topicwire_ledger::LedgerClient;
use topicwire_protocol::{
    Cursor, Operation, ParsedEntry, TopicId, TopicRole, DEFAULT_FETCH_TIMEOUT_MS,
    DEFAULT_POLL_INTERVAL_MS,
};

use crate::error::NodeError;

/// One classified, strictly-new entry delivered to listeners.
#[derive(Debug, Clone)]
pub struct TopicEvent {
    pub topic: TopicId,
    pub role: TopicRole,
    pub entry: ParsedEntry,
}

struct TopicHandle {
    role: TopicRole,
    cursor: Arc<AtomicU64>,
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

pub struct LogPoller {
    ledger: Arc<dyn LedgerClient>,
    poll_interval: Duration,
    fetch_timeout: Duration,
    topics: Mutex<HashMap<TopicId, TopicHandle>>,
    any_tx: broadcast::Sender<TopicEvent>,
}

impl LogPoller {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self::with_intervals(
            ledger,
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
        )
    }

    pub fn with_intervals(
        ledger: Arc<dyn LedgerClient>,
        poll_interval: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        let (any_tx, _) = broadcast::channel(256);
        Self {
            ledger,
            poll_interval,
            fetch_timeout,
            topics: Mutex::new(HashMap::new()),
            any_tx,
        }
    }

    /// Global event stream: every entry delivered on any monitored topic.
    pub fn subscribe_any(&self) -> broadcast::Receiver<TopicEvent> {
        self.any_tx.subscribe()
    }

    /// Begin monitoring a topic. Idempotent: a second call for an
    /// already-monitored topic is a no-op.
    ///
    /// The cursor is initialized at the topic's current tip, so entries
    /// appended before monitoring started are never replayed as new.
    pub async fn start_monitoring(
        &self,
        topic: &TopicId,
        role: TopicRole,
        listener: mpsc::Sender<TopicEvent>,
    ) -> Result<(), NodeError> {
        {
            let topics = self.topics.lock().expect("topic map poisoned");
            if topics.contains_key(topic) {
                tracing::debug!("Already monitoring topic {topic}, ignoring");
                return Ok(());
            }
        }

        let tip = self.ledger.latest_sequence(topic).await?;
        let cursor = Arc::new(AtomicU64::new(tip));
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut topics = self.topics.lock().expect("topic map poisoned");
        // Re-check: a concurrent start for the same topic may have won
        // while we were reading the tip.
        if topics.contains_key(topic) {
            return Ok(());
        }

        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.ledger),
            topic.clone(),
            role,
            Arc::clone(&cursor),
            listener,
            self.any_tx.clone(),
            self.poll_interval,
            self.fetch_timeout,
            stop_rx,
        ));
        topics.insert(
            topic.clone(),
            TopicHandle {
                role,
                cursor,
                stop: stop_tx,
                task,
            },
        );
        tracing::info!("Monitoring topic {topic} (role={role}) from sequence {tip}");
        Ok(())
    }

    /// Cancel a topic's poll loop and release its state. Idempotent.
    /// Waits for the loop task to wind down before returning, so no late
    /// poll can fire after this resolves.
    pub async fn stop_monitoring(&self, topic: &TopicId) {
        let handle = {
            let mut topics = self.topics.lock().expect("topic map poisoned");
            topics.remove(topic)
        };
        let Some(handle) = handle else { return };
        let _ = handle.stop.send(true);
        let _ = handle.task.await;
        tracing::info!("Stopped monitoring topic {topic}");
    }

    /// Stop every poll loop (node shutdown).
    pub async fn stop_all(&self) {
        let handles: Vec<(TopicId, TopicHandle)> = {
            let mut topics = self.topics.lock().expect("topic map poisoned");
            topics.drain().collect()
        };
        for (topic, handle) in handles {
            let _ = handle.stop.send(true);
            let _ = handle.task.await;
            tracing::debug!("Stopped monitoring topic {topic}");
        }
    }

    pub fn is_monitoring(&self, topic: &TopicId) -> bool {
        self.topics
            .lock()
            .expect("topic map poisoned")
            .contains_key(topic)
    }

    pub fn role_of(&self, topic: &TopicId) -> Option<TopicRole> {
        self.topics
            .lock()
            .expect("topic map poisoned")
            .get(topic)
            .map(|h| h.role)
    }

    /// Current cursor for a monitored topic.
    pub fn cursor(&self, topic: &TopicId) -> Option<Cursor> {
        self.topics
            .lock()
            .expect("topic map poisoned")
            .get(topic)
            .map(|h| h.cursor.load(Ordering::SeqCst))
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    ledger: Arc<dyn LedgerClient>,
    topic: TopicId,
    role: TopicRole,
    cursor: Arc<AtomicU64>,
    listener: mpsc::Sender<TopicEvent>,
    any_tx: broadcast::Sender<TopicEvent>,
    poll_interval: Duration,
    fetch_timeout: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {
                poll_cycle(
                    ledger.as_ref(),
                    &topic,
                    role,
                    &cursor,
                    &listener,
                    &any_tx,
                    fetch_timeout,
                )
                .await;
            }
        }
    }
}

/// One fetch-filter-sort-deliver cycle.
///
/// Failure semantics: a read error or timeout is logged and the loop
/// retries next interval. The cursor advances to the highest sequence
/// fetched regardless of downstream processing outcome; an unparseable
/// entry is skipped, never retried, and never stalls the topic.
async fn poll_cycle(
    ledger: &dyn LedgerClient,
    topic: &TopicId,
    role: TopicRole,
    cursor: &AtomicU64,
    listener: &mpsc::Sender<TopicEvent>,
    any_tx: &broadcast::Sender<TopicEvent>,
    fetch_timeout: Duration,
) {
    let since = cursor.load(Ordering::SeqCst);
    let fetched = match tokio::time::timeout(fetch_timeout, ledger.get_entries_since(topic, since))
        .await
    {
        Err(_) => {
            tracing::warn!("Fetch timed out for topic {topic} (cursor {since})");
            return;
        }
        Ok(Err(e)) => {
            tracing::warn!("Fetch failed for topic {topic} (cursor {since}): {e}");
            return;
        }
        Ok(Ok(entries)) => entries,
    };

    // The ledger may resurface old entries and promises no order.
    let mut fresh: Vec<_> = fetched
        .into_iter()
        .filter(|e| e.sequence_number > since)
        .collect();
    if fresh.is_empty() {
        return;
    }
    fresh.sort_by_key(|e| e.sequence_number);
    let max_seq = fresh
        .last()
        .map(|e| e.sequence_number)
        .unwrap_or(since);

    let mut parsed = Vec::with_capacity(fresh.len());
    for entry in &fresh {
        match ParsedEntry::from_entry(entry) {
            Ok(p) => parsed.push(p),
            Err(e) => {
                tracing::warn!(
                    "Skipping unparseable entry {}@{}: {e}",
                    topic,
                    entry.sequence_number,
                );
            }
        }
    }

    if role == TopicRole::Inbound {
        collapse_connection_requests(topic, &mut parsed);
    }

    for entry in parsed {
        let event = TopicEvent {
            topic: topic.clone(),
            role,
            entry,
        };
        // No global subscribers is fine.
        let _ = any_tx.send(event.clone());
        if listener.send(event).await.is_err() {
            tracing::debug!("Listener for topic {topic} dropped, discarding event");
        }
    }

    // Fire-and-forget advancement: never rewound, never held back by a
    // downstream failure.
    cursor.fetch_max(max_seq, Ordering::SeqCst);
}

/// Inbound collapse rule: when one poll batch carries several
/// `connection_request` entries, only the highest-sequence one survives.
/// A retried handshake supersedes its earlier attempts; delivering all of
/// them would amplify duplicate connections.
fn collapse_connection_requests(topic: &TopicId, parsed: &mut Vec<ParsedEntry>) {
    let newest = parsed
        .iter()
        .filter(|p| matches!(p.envelope.operation, Operation::ConnectionRequest { .. }))
        .map(|p| p.sequence_number)
        .max();
    let Some(newest) = newest else { return };

    let before = parsed.len();
    parsed.retain(|p| {
        !matches!(p.envelope.operation, Operation::ConnectionRequest { .. })
            || p.sequence_number == newest
    });
    let dropped = before - parsed.len();
    if dropped > 0 {
        tracing::debug!(
            "Collapsed {dropped} superseded connection_request entries on {topic} \
             (kept sequence {newest})",
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use topicwire_ledger::MemoryLedger;
    use topicwire_protocol::Envelope;

    const FAST_POLL: Duration = Duration::from_millis(10);
    const RECV_WAIT: Duration = Duration::from_millis(500);

    fn poller(ledger: &MemoryLedger) -> LogPoller {
        LogPoller::with_intervals(
            Arc::new(ledger.clone()),
            FAST_POLL,
            Duration::from_millis(1_000),
        )
    }

    fn request_payload(requester: &str) -> String {
        Envelope::new(Operation::ConnectionRequest {
            requester: requester.into(),
        })
        .encode()
        .unwrap()
    }

    fn message_payload(data: &str) -> String {
        Envelope::new(Operation::Message {
            correlation_id: None,
            response_id: None,
            data: data.into(),
        })
        .encode()
        .unwrap()
    }

    async fn recv(rx: &mut mpsc::Receiver<TopicEvent>) -> TopicEvent {
        tokio::time::timeout(RECV_WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn historical_entries_are_not_replayed() {
        let ledger = MemoryLedger::new();
        let topic = ledger.create_topic_sync("t");
        ledger.append_raw(&topic, &message_payload("old"), None);

        let poller = poller(&ledger);
        let (tx, mut rx) = mpsc::channel(16);
        poller
            .start_monitoring(&topic, TopicRole::Connection, tx)
            .await
            .unwrap();

        ledger.append_raw(&topic, &message_payload("new"), None);
        let event = recv(&mut rx).await;
        assert_eq!(event.entry.sequence_number, 2);
        match event.entry.envelope.operation {
            Operation::Message { ref data, .. } => assert_eq!(data, "new"),
            ref other => panic!("unexpected operation {other}"),
        }
        poller.stop_monitoring(&topic).await;
    }

    #[tokio::test]
    async fn entries_arrive_in_ascending_order() {
        let ledger = MemoryLedger::new();
        let topic = ledger.create_topic_sync("t");
        let poller = poller(&ledger);
        let (tx, mut rx) = mpsc::channel(16);
        poller
            .start_monitoring(&topic, TopicRole::Connection, tx)
            .await
            .unwrap();

        for data in ["a", "b", "c"] {
            ledger.append_raw(&topic, &message_payload(data), None);
        }
        let seqs = [
            recv(&mut rx).await.entry.sequence_number,
            recv(&mut rx).await.entry.sequence_number,
            recv(&mut rx).await.entry.sequence_number,
        ];
        assert_eq!(seqs, [1, 2, 3]);
        assert_eq!(poller.cursor(&topic), Some(3));
        poller.stop_monitoring(&topic).await;
    }

    #[tokio::test]
    async fn inbound_collapse_keeps_highest_sequence_request() {
        let ledger = MemoryLedger::new();
        let topic = ledger.create_topic_sync("in");
        let poller = poller(&ledger);
        let (tx, mut rx) = mpsc::channel(16);
        poller
            .start_monitoring(&topic, TopicRole::Inbound, tx)
            .await
            .unwrap();

        // Retried handshake: two requests from the same party in one batch.
        ledger.append_raw(&topic, &request_payload("0.0.1001"), None);
        ledger.append_raw(&topic, &request_payload("0.0.1001"), None);

        let event = recv(&mut rx).await;
        assert_eq!(event.entry.sequence_number, 2);
        // Nothing else delivered; cursor covers both.
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());
        assert_eq!(poller.cursor(&topic), Some(2));
        poller.stop_monitoring(&topic).await;
    }

    #[tokio::test]
    async fn unparseable_entry_is_skipped_and_cursor_advances() {
        let ledger = MemoryLedger::new();
        let topic = ledger.create_topic_sync("t");
        let poller = poller(&ledger);
        let (tx, mut rx) = mpsc::channel(16);
        poller
            .start_monitoring(&topic, TopicRole::Connection, tx)
            .await
            .unwrap();

        ledger.append_raw(&topic, "definitely not json", None);
        ledger.append_raw(&topic, &message_payload("good"), None);

        let event = recv(&mut rx).await;
        assert_eq!(event.entry.sequence_number, 2);
        assert_eq!(poller.cursor(&topic), Some(2));
        poller.stop_monitoring(&topic).await;
    }

    #[tokio::test]
    async fn transient_read_failures_do_not_kill_the_loop() {
        let ledger = MemoryLedger::new();
        let topic = ledger.create_topic_sync("flaky");
        let poller = poller(&ledger);
        let (tx, mut rx) = mpsc::channel(16);
        poller
            .start_monitoring(&topic, TopicRole::Connection, tx)
            .await
            .unwrap();

        ledger.fail_next_reads(3);
        ledger.append_raw(&topic, &message_payload("through"), None);
        let event = recv(&mut rx).await;
        assert_eq!(event.entry.sequence_number, 1);
        poller.stop_monitoring(&topic).await;
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_releases_state() {
        let ledger = MemoryLedger::new();
        let topic = ledger.create_topic_sync("t");
        let poller = poller(&ledger);
        let (tx, _rx) = mpsc::channel(16);
        poller
            .start_monitoring(&topic, TopicRole::Inbound, tx.clone())
            .await
            .unwrap();
        poller
            .start_monitoring(&topic, TopicRole::Inbound, tx)
            .await
            .unwrap();
        assert!(poller.is_monitoring(&topic));
        assert_eq!(poller.role_of(&topic), Some(TopicRole::Inbound));

        poller.stop_monitoring(&topic).await;
        assert!(!poller.is_monitoring(&topic));
        assert_eq!(poller.cursor(&topic), None);
        // Stopping again is a no-op.
        poller.stop_monitoring(&topic).await;
    }

    #[tokio::test]
    async fn any_stream_sees_every_topic() {
        let ledger = MemoryLedger::new();
        let t1 = ledger.create_topic_sync("a");
        let t2 = ledger.create_topic_sync("b");
        let poller = poller(&ledger);
        let mut any_rx = poller.subscribe_any();
        let (tx, _rx) = mpsc::channel(64);
        poller
            .start_monitoring(&t1, TopicRole::Connection, tx.clone())
            .await
            .unwrap();
        poller
            .start_monitoring(&t2, TopicRole::Connection, tx)
            .await
            .unwrap();

        ledger.append_raw(&t1, &message_payload("one"), None);
        ledger.append_raw(&t2, &message_payload("two"), None);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(RECV_WAIT, any_rx.recv())
                .await
                .expect("timed out")
                .expect("lagged");
            seen.insert(event.topic.clone());
        }
        assert!(seen.contains(&t1) && seen.contains(&t2));
        poller.stop_all().await;
    }
}
