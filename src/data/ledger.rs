use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use crate::data::types::Market;
use crate::execution::admin::AdminGate;

/// Chain-mutating contract calls
#[derive(Debug, Clone, PartialEq)]
pub enum ContractCall {
    CreateMarket {
        slot_id: [u8; 32],
        city: String,
        resolve_time: DateTime<Utc>,
        threshold_c: f64,
    },
    ResolveMarket {
        market_id: u64,
        temperature_c: f64,
        proof: String,
    },
    CancelMarket {
        market_id: u64,
    },
}

impl ContractCall {
    pub fn name(&self) -> &'static str {
        match self {
            ContractCall::CreateMarket { .. } => "createMarket",
            ContractCall::ResolveMarket { .. } => "resolveMarket",
            ContractCall::CancelMarket { .. } => "cancelMarket",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub success: bool,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertKind {
    NotAuthorized,
    InvalidStatus,
    AlreadyExists,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Call reverted ({kind:?}): {reason}")]
    Reverted { kind: RevertKind, reason: String },

    #[error("Transaction {0:?} reverted on-chain")]
    TxFailed(H256),

    #[error("Confirmation timed out after {0:?} for {1:?}")]
    ConfirmationTimeout(Duration, H256),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Cannot encode or decode contract data: {0}")]
    Encoding(String),
}

impl LedgerError {
    pub fn reverted(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        LedgerError::Reverted {
            kind: classify_revert(&reason),
            reason,
        }
    }

    /// Retrying cannot fix an authorization or status mismatch
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            LedgerError::Reverted {
                kind: RevertKind::NotAuthorized | RevertKind::InvalidStatus,
                ..
            } | LedgerError::Encoding(_)
        )
    }

    pub fn revert_kind(&self) -> Option<RevertKind> {
        match self {
            LedgerError::Reverted { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub fn classify_revert(reason: &str) -> RevertKind {
    let reason = reason.to_lowercase();

    if reason.contains("not authorized")
        || reason.contains("unauthorized")
        || reason.contains("caller is not")
    {
        RevertKind::NotAuthorized
    } else if reason.contains("invalid status")
        || reason.contains("already resolved")
        || reason.contains("already cancelled")
        || reason.contains("not open")
    {
        RevertKind::InvalidStatus
    } else if reason.contains("already exists") {
        RevertKind::AlreadyExists
    } else {
        RevertKind::Other
    }
}

/// The market contract as seen by the keeper
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Dry-run the call against current chain state
    async fn simulate(&self, call: &ContractCall) -> Result<(), LedgerError>;

    /// Broadcast the call, returning its transaction hash
    async fn send(&self, call: &ContractCall) -> Result<H256, LedgerError>;

    /// Receipt for a transaction, None while still pending
    async fn receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, LedgerError>;

    async fn market(&self, market_id: u64) -> Result<Market, LedgerError>;

    /// Markets past their resolve time still Open or Closed
    async fn markets_due(&self, now: DateTime<Utc>) -> Result<Vec<Market>, LedgerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Chain writes paused by operator")]
    Paused,

    #[error("Admin config unavailable: {0}")]
    Admin(anyhow::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Runs every chain-mutating call through simulate -> write -> wait
pub struct TxSubmitter {
    ledger: Arc<dyn Ledger>,
    admin: AdminGate,
    confirmation_timeout: Duration,
    receipt_poll_interval: Duration,
}

impl TxSubmitter {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        admin: AdminGate,
        confirmation_timeout: Duration,
        receipt_poll_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            admin,
            confirmation_timeout,
            receipt_poll_interval,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub async fn submit(&self, call: &ContractCall) -> Result<TxReceipt, SubmitError> {
        // Pause is re-read before every write so it applies to in-flight jobs
        if self.admin.settler_paused().map_err(SubmitError::Admin)? {
            return Err(SubmitError::Paused);
        }

        self.ledger.simulate(call).await?;
        debug!(call = call.name(), "Simulation passed");

        let tx_hash = self.ledger.send(call).await?;
        info!(call = call.name(), tx = ?tx_hash, "📤 Transaction submitted");

        let receipt = self.wait_for_receipt(tx_hash).await?;
        if !receipt.success {
            return Err(LedgerError::TxFailed(tx_hash).into());
        }

        info!(
            call = call.name(),
            tx = ?tx_hash,
            block = ?receipt.block_number,
            "✅ Transaction confirmed"
        );
        Ok(receipt)
    }

    async fn wait_for_receipt(&self, tx_hash: H256) -> Result<TxReceipt, LedgerError> {
        let poll = async {
            loop {
                match self.ledger.receipt(tx_hash).await {
                    Ok(Some(receipt)) => return Ok::<_, LedgerError>(receipt),
                    Ok(None) => tokio::time::sleep(self.receipt_poll_interval).await,
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(self.confirmation_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::ConfirmationTimeout(self.confirmation_timeout, tx_hash)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_revert() {
        assert_eq!(classify_revert("Ownable: caller is not the owner"), RevertKind::NotAuthorized);
        assert_eq!(classify_revert("Market: invalid status"), RevertKind::InvalidStatus);
        assert_eq!(classify_revert("market already resolved"), RevertKind::InvalidStatus);
        assert_eq!(classify_revert("market already exists"), RevertKind::AlreadyExists);
        assert_eq!(classify_revert("proof expired"), RevertKind::Other);
    }

    #[test]
    fn test_only_state_mismatch_is_permanent() {
        assert!(LedgerError::reverted("not authorized").is_permanent());
        assert!(LedgerError::reverted("invalid status").is_permanent());
        assert!(!LedgerError::reverted("proof expired").is_permanent());
        assert!(!LedgerError::Rpc("nonce too low".to_string()).is_permanent());
        assert!(!LedgerError::ConfirmationTimeout(Duration::from_secs(1), H256::zero()).is_permanent());
    }
}
