//! Pending-response registry: maps an outbound request's correlation id to
//! the caller waiting on it, resolving or timing out that caller when the
//! matching response entry (eventually) arrives off a poll cycle.
//!
//! Registration and resolution take the same lock, so a response observed
//! between "about to register" and "registered" cannot be lost or doubled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::NodeError;

/// Receives exactly one of: the response payload, a timeout error, or a
/// cancellation error.
pub type ResponseFuture = oneshot::Receiver<Result<String, NodeError>>;

struct Pending {
    tx: oneshot::Sender<Result<String, NodeError>>,
    timeout_task: tokio::task::JoinHandle<()>,
}

#[derive(Clone, Default)]
pub struct ResponseCorrelator {
    pending: Arc<Mutex<HashMap<String, Pending>>>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending response. Errors synchronously if the id is
    /// already registered — that is caller misuse, not a race to absorb.
    ///
    /// The returned future resolves with the response payload, or with
    /// [`NodeError::ResponseTimeout`] no earlier than `timeout`.
    pub fn register(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<ResponseFuture, NodeError> {
        let mut pending = self.pending.lock().expect("pending map poisoned");
        if pending.contains_key(correlation_id) {
            return Err(NodeError::DuplicateCorrelation(correlation_id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let timeout_task = {
            let correlator = self.clone();
            let id = correlation_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                correlator.expire(&id, timeout.as_millis() as u64);
            })
        };
        pending.insert(correlation_id.to_string(), Pending { tx, timeout_task });
        Ok(rx)
    }

    /// Resolve a pending response with a payload. Returns false when no
    /// registration exists (the entry is then unsolicited, or a duplicate
    /// already absorbed by the dedup cache).
    pub fn resolve(&self, correlation_id: &str, payload: String) -> bool {
        let entry = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.remove(correlation_id)
        };
        match entry {
            Some(p) => {
                p.timeout_task.abort();
                // Receiver may already be dropped; nothing to do then.
                let _ = p.tx.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Drop a registration without resolving it. The waiting caller gets
    /// [`NodeError::ResponseCancelled`].
    pub fn cancel(&self, correlation_id: &str) -> bool {
        let entry = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.remove(correlation_id)
        };
        match entry {
            Some(p) => {
                p.timeout_task.abort();
                let _ = p
                    .tx
                    .send(Err(NodeError::ResponseCancelled(correlation_id.to_string())));
                true
            }
            None => false,
        }
    }

    fn expire(&self, correlation_id: &str, timeout_ms: u64) {
        let entry = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.remove(correlation_id)
        };
        if let Some(p) = entry {
            tracing::debug!("Response wait timed out for correlation id {correlation_id}");
            let _ = p.tx.send(Err(NodeError::ResponseTimeout {
                id: correlation_id.to_string(),
                timeout_ms,
            }));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_payload_once() {
        let corr = ResponseCorrelator::new();
        let rx = corr.register("abc", Duration::from_secs(5)).unwrap();
        assert!(corr.resolve("abc", "sunny".into()));
        assert_eq!(rx.await.unwrap().unwrap(), "sunny");
        // Second delivery finds no registration.
        assert!(!corr.resolve("abc", "sunny again".into()));
        assert_eq!(corr.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_registration_is_synchronous_error() {
        let corr = ResponseCorrelator::new();
        let _rx = corr.register("abc", Duration::from_secs(5)).unwrap();
        let err = corr.register("abc", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, NodeError::DuplicateCorrelation(_)));
        // Original registration is untouched.
        assert_eq!(corr.pending_count(), 1);
    }

    #[tokio::test]
    async fn timeout_rejects_and_removes() {
        let corr = ResponseCorrelator::new();
        let rx = corr.register("slow", Duration::from_millis(20)).unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, NodeError::ResponseTimeout { .. }));
        assert_eq!(corr.pending_count(), 0);
        // The id is free again after expiry.
        assert!(corr.register("slow", Duration::from_millis(20)).is_ok());
    }

    #[tokio::test]
    async fn timeout_does_not_fire_early() {
        let corr = ResponseCorrelator::new();
        let rx = corr.register("t", Duration::from_millis(80)).unwrap();
        let start = tokio::time::Instant::now();
        let err = rx.await.unwrap().unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert!(matches!(err, NodeError::ResponseTimeout { .. }));
    }

    #[tokio::test]
    async fn cancel_rejects_with_cancelled() {
        let corr = ResponseCorrelator::new();
        let rx = corr.register("c", Duration::from_secs(5)).unwrap();
        assert!(corr.cancel("c"));
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, NodeError::ResponseCancelled(_)));
        assert!(!corr.cancel("c"));
    }
}
