//! Per-connection fee terms and settlement.
//!
//! A connection topic may require a per-message payment to a collector.
//! Terms are fixed when the connection activates and never change after
//! that; re-registration is disallowed.

use std::collections::HashSet;

use topicwire_ledger::{FeeContext, LedgerClient};

use crate::error::NodeError;

/// How a fee is actually moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FeeMechanism {
    /// The ledger deducts the fee from the payer as part of accepting the
    /// write (single atomic pay-and-write).
    LedgerNative,
    /// The ledger has no native primitive: the fee is a separate transfer
    /// issued before the message write. Not atomic; a crash between the
    /// two leaves the fee paid with no message written.
    ExplicitTransfer,
}

/// Fee terms attached to one connection. Immutable after activation.
#[derive(Debug, Clone)]
pub struct FeeConfig {
    /// Per-message amount, smallest ledger denomination.
    pub amount: u64,
    /// Account the fee is paid to.
    pub collector: String,
    /// Accounts that write for free. Requester and responder are placed
    /// here at activation so the handshake and welcome traffic costs
    /// nothing; an operator may revoke that later.
    pub exempt: HashSet<String>,
    pub mechanism: FeeMechanism,
}

impl FeeConfig {
    pub fn new(
        amount: u64,
        collector: impl Into<String>,
        mechanism: FeeMechanism,
        exempt: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            amount,
            collector: collector.into(),
            exempt: exempt.into_iter().collect(),
            mechanism,
        }
    }

    pub fn is_exempt(&self, account: &str) -> bool {
        self.exempt.contains(account)
    }

    pub fn revoke_exemption(&mut self, account: &str) -> bool {
        self.exempt.remove(account)
    }

    /// Settle the fee for one write by `sender`, returning the fee context
    /// the append should carry.
    ///
    /// Exempt senders pay nothing. The native mechanism defers to the
    /// ledger. The explicit mechanism transfers first and returns
    /// [`FeeContext::Settled`]; if the subsequent append fails the caller
    /// retries with the returned context so the fee is never paid twice.
    pub async fn settle(
        &self,
        ledger: &dyn LedgerClient,
        sender: &str,
    ) -> Result<Option<FeeContext>, NodeError> {
        if self.is_exempt(sender) {
            return Ok(None);
        }
        match self.mechanism {
            FeeMechanism::LedgerNative => Ok(Some(FeeContext::Native {
                payer: sender.to_string(),
            })),
            FeeMechanism::ExplicitTransfer => {
                ledger.transfer(sender, &self.collector, self.amount).await?;
                tracing::debug!(
                    "Fee transfer settled: {} -> {} ({})",
                    sender,
                    self.collector,
                    self.amount,
                );
                Ok(Some(FeeContext::Settled))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use topicwire_ledger::MemoryLedger;

    fn config(mechanism: FeeMechanism) -> FeeConfig {
        FeeConfig::new(
            100,
            "0.0.9",
            mechanism,
            ["0.0.1".to_string(), "0.0.2".to_string()],
        )
    }

    #[tokio::test]
    async fn exempt_sender_pays_nothing() {
        let ledger = MemoryLedger::new();
        let fee = config(FeeMechanism::ExplicitTransfer);
        let ctx = fee.settle(&ledger, "0.0.1").await.unwrap();
        assert_eq!(ctx, None);
        assert_eq!(ledger.balance("0.0.9"), 0);
    }

    #[tokio::test]
    async fn native_mechanism_defers_to_ledger() {
        let ledger = MemoryLedger::new();
        let fee = config(FeeMechanism::LedgerNative);
        let ctx = fee.settle(&ledger, "0.0.3").await.unwrap();
        assert_eq!(
            ctx,
            Some(FeeContext::Native {
                payer: "0.0.3".into()
            })
        );
    }

    #[tokio::test]
    async fn explicit_transfer_moves_funds_before_write() {
        let ledger = MemoryLedger::new();
        ledger.credit("0.0.3", 250);
        let fee = config(FeeMechanism::ExplicitTransfer);
        let ctx = fee.settle(&ledger, "0.0.3").await.unwrap();
        assert_eq!(ctx, Some(FeeContext::Settled));
        assert_eq!(ledger.balance("0.0.3"), 150);
        assert_eq!(ledger.balance("0.0.9"), 100);
    }

    #[tokio::test]
    async fn explicit_transfer_surfaces_overdraft() {
        let ledger = MemoryLedger::new();
        let fee = config(FeeMechanism::ExplicitTransfer);
        assert!(fee.settle(&ledger, "0.0.3").await.is_err());
    }

    #[test]
    fn revoking_exemption_makes_sender_pay() {
        let mut fee = config(FeeMechanism::LedgerNative);
        assert!(fee.is_exempt("0.0.1"));
        assert!(fee.revoke_exemption("0.0.1"));
        assert!(!fee.is_exempt("0.0.1"));
    }
}
