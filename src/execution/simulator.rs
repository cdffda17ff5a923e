use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::H256;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::info;
use crate::data::ledger::{ContractCall, Ledger, LedgerError, TxReceipt};
use crate::data::types::{Market, MarketStatus};

/// In-process stand-in for the market contract, used in dry-run mode.
/// Enforces the contract's status rules so the pipelines behave as on-chain.
pub struct DryRunLedger {
    markets: DashMap<u64, Market>,
    slots: DashMap<[u8; 32], u64>,
    receipts: DashMap<H256, TxReceipt>,
    next_market_id: AtomicU64,
    next_tx: AtomicU64,
    block: AtomicU64,
    authorized: AtomicBool,
    withhold_receipts: AtomicBool,
    simulate_calls: AtomicUsize,
    send_calls: AtomicUsize,
}

impl DryRunLedger {
    pub fn new() -> Self {
        info!("Dry-run ledger initialized, no transactions will reach the chain");

        Self {
            markets: DashMap::new(),
            slots: DashMap::new(),
            receipts: DashMap::new(),
            next_market_id: AtomicU64::new(0),
            next_tx: AtomicU64::new(1),
            block: AtomicU64::new(1),
            authorized: AtomicBool::new(true),
            withhold_receipts: AtomicBool::new(false),
            simulate_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
        }
    }

    /// Simulations plus sends seen so far
    #[cfg(test)]
    pub fn call_count(&self) -> usize {
        self.simulate_calls.load(Ordering::SeqCst) + self.send_calls.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn send_count(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    /// Make every write revert as if the keeper lost its role
    #[cfg(test)]
    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }

    /// Leave transactions pending forever
    #[cfg(test)]
    pub fn set_withhold_receipts(&self, withhold: bool) {
        self.withhold_receipts.store(withhold, Ordering::SeqCst);
    }

    pub fn insert_market(&self, city: &str, resolve_time: DateTime<Utc>, threshold_c: f64) -> u64 {
        let id = self.next_market_id.fetch_add(1, Ordering::SeqCst);
        self.markets.insert(
            id,
            Market {
                id,
                city: city.to_string(),
                resolve_time,
                threshold_c,
                yes_pool: 0.0,
                no_pool: 0.0,
                status: MarketStatus::Open,
            },
        );
        id
    }

    fn check(&self, call: &ContractCall) -> Result<(), LedgerError> {
        if !self.authorized.load(Ordering::SeqCst) {
            return Err(LedgerError::reverted("caller is not the keeper"));
        }

        match call {
            ContractCall::CreateMarket { slot_id, .. } => {
                if self.slots.contains_key(slot_id) {
                    return Err(LedgerError::reverted("market already exists"));
                }
            }
            ContractCall::ResolveMarket { market_id, .. } => {
                let market = self.lookup(*market_id)?;
                if !matches!(market.status, MarketStatus::Open | MarketStatus::Closed) {
                    return Err(LedgerError::reverted("invalid status"));
                }
                if market.resolve_time > Utc::now() {
                    return Err(LedgerError::reverted("resolve time not reached"));
                }
            }
            ContractCall::CancelMarket { market_id } => {
                let market = self.lookup(*market_id)?;
                if !matches!(market.status, MarketStatus::Open | MarketStatus::Closed) {
                    return Err(LedgerError::reverted("invalid status"));
                }
            }
        }
        Ok(())
    }

    fn apply(&self, call: &ContractCall) {
        match call {
            ContractCall::CreateMarket { slot_id, city, resolve_time, threshold_c } => {
                let id = self.insert_market(city, *resolve_time, *threshold_c);
                self.slots.insert(*slot_id, id);
                info!("[DRY RUN] Created market {} for {} at {}", id, city, resolve_time);
            }
            ContractCall::ResolveMarket { market_id, temperature_c, .. } => {
                if let Some(mut market) = self.markets.get_mut(market_id) {
                    market.status = MarketStatus::Resolved;
                }
                info!("[DRY RUN] Resolved market {} with {:.1}°C", market_id, temperature_c);
            }
            ContractCall::CancelMarket { market_id } => {
                if let Some(mut market) = self.markets.get_mut(market_id) {
                    market.status = MarketStatus::Cancelled;
                }
                info!("[DRY RUN] Cancelled market {}", market_id);
            }
        }
    }

    fn lookup(&self, market_id: u64) -> Result<Market, LedgerError> {
        self.markets
            .get(&market_id)
            .map(|m| m.clone())
            .ok_or_else(|| LedgerError::reverted(format!("unknown market {}", market_id)))
    }
}

impl Default for DryRunLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for DryRunLedger {
    async fn simulate(&self, call: &ContractCall) -> Result<(), LedgerError> {
        self.simulate_calls.fetch_add(1, Ordering::SeqCst);
        self.check(call)
    }

    async fn send(&self, call: &ContractCall) -> Result<H256, LedgerError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.check(call)?;
        self.apply(call);

        let tx_hash = H256::from_low_u64_be(self.next_tx.fetch_add(1, Ordering::SeqCst));
        let block = self.block.fetch_add(1, Ordering::SeqCst);
        self.receipts.insert(
            tx_hash,
            TxReceipt {
                tx_hash,
                success: true,
                block_number: Some(block),
            },
        );
        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, LedgerError> {
        if self.withhold_receipts.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.receipts.get(&tx_hash).map(|r| *r))
    }

    async fn market(&self, market_id: u64) -> Result<Market, LedgerError> {
        self.lookup(market_id)
    }

    async fn markets_due(&self, now: DateTime<Utc>) -> Result<Vec<Market>, LedgerError> {
        let mut due: Vec<Market> = self
            .markets
            .iter()
            .filter(|m| m.is_due(now))
            .map(|m| m.clone())
            .collect();
        due.sort_by_key(|m| m.id);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ledger::{RevertKind, SubmitError, TxSubmitter};
    use crate::execution::admin::{AdminGate, ADMIN_CONFIG_KEY};
    use crate::execution::persistence::{KeeperDatabase, SharedStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn submitter(ledger: Arc<DryRunLedger>, db: &KeeperDatabase) -> TxSubmitter {
        TxSubmitter::new(
            ledger,
            AdminGate::new(Arc::new(db.clone())),
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_resolve_only_from_open() {
        let ledger = Arc::new(DryRunLedger::new());
        let db = KeeperDatabase::in_memory().unwrap();
        let id = ledger.insert_market("London", Utc::now() - chrono::Duration::hours(1), 12.0);
        let submitter = submitter(ledger.clone(), &db);

        let resolve = ContractCall::ResolveMarket { market_id: id, temperature_c: 13.0, proof: "0x01".to_string() };
        let receipt = submitter.submit(&resolve).await.unwrap();
        assert!(receipt.success);
        assert_eq!(ledger.market(id).await.unwrap().status, MarketStatus::Resolved);

        // Second resolution fails in simulation and never gets sent
        let err = submitter.submit(&resolve).await.unwrap_err();
        match err {
            SubmitError::Ledger(e) => assert_eq!(e.revert_kind(), Some(RevertKind::InvalidStatus)),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(ledger.send_count(), 1);
    }

    #[tokio::test]
    async fn test_paused_submitter_touches_nothing() {
        let ledger = Arc::new(DryRunLedger::new());
        let db = KeeperDatabase::in_memory().unwrap();
        db.set(ADMIN_CONFIG_KEY, r#"{"settler_paused":true}"#).unwrap();
        let submitter = submitter(ledger.clone(), &db);

        let cancel = ContractCall::CancelMarket { market_id: 0 };
        assert!(matches!(submitter.submit(&cancel).await, Err(SubmitError::Paused)));
        assert_eq!(ledger.call_count(), 0);
    }

    #[tokio::test]
    async fn test_withheld_receipt_times_out() {
        let ledger = Arc::new(DryRunLedger::new());
        let db = KeeperDatabase::in_memory().unwrap();
        ledger.set_withhold_receipts(true);
        let id = ledger.insert_market("Seoul", Utc::now(), 5.0);
        let submitter = submitter(ledger.clone(), &db);

        let err = submitter
            .submit(&ContractCall::CancelMarket { market_id: id })
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Ledger(LedgerError::ConfirmationTimeout(..))));
    }

    #[tokio::test]
    async fn test_duplicate_slot_rejected() {
        let ledger = DryRunLedger::new();
        let create = ContractCall::CreateMarket {
            slot_id: [7u8; 32],
            city: "Chicago".to_string(),
            resolve_time: Utc::now(),
            threshold_c: 20.0,
        };
        ledger.send(&create).await.unwrap();
        let err = ledger.simulate(&create).await.unwrap_err();
        assert_eq!(err.revert_kind(), Some(RevertKind::AlreadyExists));
        assert_eq!(ledger.market_count(), 1);
    }
}
