//! In-memory ledger used by tests, and by the local demo as a stand-in for
//! a real network. Faithful to the quirks the poller must survive: reads
//! return full unordered history, and the same entries resurface across
//! calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use topicwire_protocol::{Cursor, Entry, TopicId};

use crate::client::{FeeContext, LedgerClient};
use crate::error::LedgerError;

#[derive(Debug, Clone)]
struct NativeFee {
    amount: u64,
    collector: String,
}

#[derive(Default)]
struct State {
    topics: HashMap<TopicId, Vec<Entry>>,
    balances: HashMap<String, u64>,
    /// Native per-message fee schedule, keyed by topic.
    fees: HashMap<TopicId, NativeFee>,
    next_topic: u64,
}

/// Shared in-memory ledger. Clones share state; `with_operator` produces a
/// handle whose appends are attributed to (and paid by) a specific account,
/// so one test can play both sides of a conversation.
#[derive(Clone)]
pub struct MemoryLedger {
    state: Arc<Mutex<State>>,
    operator: Option<String>,
    /// When non-zero, the next N reads fail with a transient I/O error.
    fail_reads: Arc<AtomicU32>,
    /// When non-zero, the next N appends are rejected.
    fail_appends: Arc<AtomicU32>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            operator: None,
            fail_reads: Arc::new(AtomicU32::new(0)),
            fail_appends: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A handle over the same ledger whose appends come from `account`.
    pub fn with_operator(&self, account: impl Into<String>) -> Self {
        Self {
            state: Arc::clone(&self.state),
            operator: Some(account.into()),
            fail_reads: Arc::clone(&self.fail_reads),
            fail_appends: Arc::clone(&self.fail_appends),
        }
    }

    /// Seed an account balance.
    pub fn credit(&self, account: &str, amount: u64) {
        let mut st = self.state.lock().expect("ledger state poisoned");
        *st.balances.entry(account.to_string()).or_insert(0) += amount;
    }

    pub fn balance(&self, account: &str) -> u64 {
        let st = self.state.lock().expect("ledger state poisoned");
        st.balances.get(account).copied().unwrap_or(0)
    }

    /// Attach a native per-message fee schedule to a topic.
    pub fn set_topic_fee(&self, topic: &TopicId, amount: u64, collector: &str) {
        let mut st = self.state.lock().expect("ledger state poisoned");
        st.fees.insert(
            topic.clone(),
            NativeFee {
                amount,
                collector: collector.to_string(),
            },
        );
    }

    /// Make the next `n` reads fail with a transient error.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` appends be rejected.
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Create a topic synchronously (test convenience).
    pub fn create_topic_sync(&self, _memo: &str) -> TopicId {
        let mut st = self.state.lock().expect("ledger state poisoned");
        st.next_topic += 1;
        let id = format!("0.0.{}", 9000 + st.next_topic);
        st.topics.insert(id.clone(), Vec::new());
        id
    }

    /// Append bypassing fee handling (test convenience for seeding topics).
    pub fn append_raw(&self, topic: &TopicId, payload: &str, sender: Option<&str>) -> u64 {
        let mut st = self.state.lock().expect("ledger state poisoned");
        push_entry(&mut st, topic, payload, sender)
    }

    fn settle_native_fee(
        st: &mut State,
        topic: &TopicId,
        payer: &str,
    ) -> Result<(), LedgerError> {
        let Some(fee) = st.fees.get(topic).cloned() else {
            return Ok(());
        };
        let available = st.balances.get(payer).copied().unwrap_or(0);
        if available < fee.amount {
            return Err(LedgerError::InsufficientBalance {
                account: payer.to_string(),
                available,
                required: fee.amount,
            });
        }
        *st.balances.get_mut(payer).expect("checked above") -= fee.amount;
        *st.balances.entry(fee.collector).or_insert(0) += fee.amount;
        Ok(())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn push_entry(st: &mut State, topic: &TopicId, payload: &str, sender: Option<&str>) -> u64 {
    let entries = st.topics.entry(topic.clone()).or_default();
    let seq = entries.last().map(|e| e.sequence_number).unwrap_or(0) + 1;
    entries.push(Entry {
        sequence_number: seq,
        payload: payload.to_string(),
        sender: sender.map(str::to_string),
        timestamp_ms: now_ms(),
        memo: None,
    });
    seq
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn get_entries_since(
        &self,
        topic: &TopicId,
        cursor: Cursor,
    ) -> Result<Vec<Entry>, LedgerError> {
        if self.fail_reads.load(Ordering::SeqCst) > 0 {
            self.fail_reads.fetch_sub(1, Ordering::SeqCst);
            return Err(LedgerError::Io("injected read failure".into()));
        }
        let st = self.state.lock().expect("ledger state poisoned");
        let entries = st
            .topics
            .get(topic)
            .ok_or_else(|| LedgerError::UnknownTopic(topic.clone()))?;
        // Returned newest-first on purpose: the real query interface makes
        // no ordering promise and the poller must sort.
        Ok(entries
            .iter()
            .filter(|e| e.sequence_number > cursor)
            .rev()
            .cloned()
            .collect())
    }

    async fn append_entry(
        &self,
        topic: &TopicId,
        payload: &str,
        fee: Option<FeeContext>,
    ) -> Result<u64, LedgerError> {
        if self.fail_appends.load(Ordering::SeqCst) > 0 {
            self.fail_appends.fetch_sub(1, Ordering::SeqCst);
            return Err(LedgerError::AppendRejected("injected append failure".into()));
        }
        let mut st = self.state.lock().expect("ledger state poisoned");
        if !st.topics.contains_key(topic) {
            return Err(LedgerError::UnknownTopic(topic.clone()));
        }
        if let Some(FeeContext::Native { payer }) = &fee {
            Self::settle_native_fee(&mut st, topic, payer)?;
        }
        Ok(push_entry(&mut st, topic, payload, self.operator.as_deref()))
    }

    async fn latest_sequence(&self, topic: &TopicId) -> Result<u64, LedgerError> {
        let st = self.state.lock().expect("ledger state poisoned");
        let entries = st
            .topics
            .get(topic)
            .ok_or_else(|| LedgerError::UnknownTopic(topic.clone()))?;
        Ok(entries.last().map(|e| e.sequence_number).unwrap_or(0))
    }

    async fn create_topic(&self, memo: &str) -> Result<TopicId, LedgerError> {
        Ok(self.create_topic_sync(memo))
    }

    async fn transfer(&self, from: &str, to: &str, amount: u64) -> Result<(), LedgerError> {
        let mut st = self.state.lock().expect("ledger state poisoned");
        let available = st.balances.get(from).copied().unwrap_or(0);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                account: from.to_string(),
                available,
                required: amount,
            });
        }
        *st.balances.get_mut(from).expect("checked above") -= amount;
        *st.balances.entry(to.to_string()).or_insert(0) += amount;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequences_are_monotonic_per_topic() {
        let ledger = MemoryLedger::new();
        let t1 = ledger.create_topic_sync("a");
        let t2 = ledger.create_topic_sync("b");
        assert_eq!(ledger.append_entry(&t1, "x", None).await.unwrap(), 1);
        assert_eq!(ledger.append_entry(&t1, "y", None).await.unwrap(), 2);
        assert_eq!(ledger.append_entry(&t2, "z", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reads_are_idempotent_and_unordered() {
        let ledger = MemoryLedger::new();
        let t = ledger.create_topic_sync("t");
        for p in ["a", "b", "c"] {
            ledger.append_entry(&t, p, None).await.unwrap();
        }
        let first = ledger.get_entries_since(&t, 0).await.unwrap();
        let second = ledger.get_entries_since(&t, 0).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first.len(), second.len());
        // Newest first, so not already sorted ascending.
        assert_eq!(first[0].sequence_number, 3);
        let after_two = ledger.get_entries_since(&t, 2).await.unwrap();
        assert_eq!(after_two.len(), 1);
        assert_eq!(after_two[0].sequence_number, 3);
    }

    #[tokio::test]
    async fn native_fee_moves_balance_on_append() {
        let ledger = MemoryLedger::new();
        let t = ledger.create_topic_sync("paid");
        ledger.set_topic_fee(&t, 50, "0.0.2002");
        ledger.credit("0.0.1001", 120);

        ledger
            .append_entry(
                &t,
                "hello",
                Some(FeeContext::Native {
                    payer: "0.0.1001".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(ledger.balance("0.0.1001"), 70);
        assert_eq!(ledger.balance("0.0.2002"), 50);

        // Third append exceeds the balance and is rejected whole.
        ledger
            .append_entry(
                &t,
                "again",
                Some(FeeContext::Native {
                    payer: "0.0.1001".into(),
                }),
            )
            .await
            .unwrap();
        let err = ledger
            .append_entry(
                &t,
                "broke",
                Some(FeeContext::Native {
                    payer: "0.0.1001".into(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(ledger.latest_sequence(&t).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn injected_read_failures_are_transient() {
        let ledger = MemoryLedger::new();
        let t = ledger.create_topic_sync("flaky");
        ledger.fail_next_reads(2);
        assert!(ledger.get_entries_since(&t, 0).await.is_err());
        assert!(ledger.get_entries_since(&t, 0).await.is_err());
        assert!(ledger.get_entries_since(&t, 0).await.is_ok());
    }

    #[tokio::test]
    async fn injected_append_failures_are_transient() {
        let ledger = MemoryLedger::new();
        let t = ledger.create_topic_sync("flaky");
        ledger.fail_next_appends(1);
        let err = ledger.append_entry(&t, "x", None).await.unwrap_err();
        assert!(matches!(err, LedgerError::AppendRejected(_)));
        // The rejected append assigned no sequence.
        assert_eq!(ledger.latest_sequence(&t).await.unwrap(), 0);
        assert_eq!(ledger.append_entry(&t, "x", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transfer_rejects_overdraft() {
        let ledger = MemoryLedger::new();
        ledger.credit("a", 10);
        assert!(ledger.transfer("a", "b", 25).await.is_err());
        ledger.transfer("a", "b", 10).await.unwrap();
        assert_eq!(ledger.balance("b"), 10);
        assert_eq!(ledger.balance("a"), 0);
    }
}
