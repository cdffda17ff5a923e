use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use crate::data::ledger::{ContractCall, Ledger, LedgerError, TxReceipt};
use crate::data::types::{Market, MarketStatus};

abigen!(
    WeatherMarkets,
    r#"[
        function createMarket(bytes32 slotId, string city, uint64 resolveTime, int64 thresholdTenths) external returns (uint256)
        function resolveMarket(uint256 marketId, int64 observedTenths, bytes proof) external
        function cancelMarket(uint256 marketId) external
        function marketCount() external view returns (uint256)
        function getMarket(uint256 marketId) external view returns (string, uint64, int64, uint256, uint256, uint8)
    ]"#
);

type Client = NonceManagerMiddleware<SignerMiddleware<Provider<Http>, LocalWallet>>;

/// Market contract reached over JSON-RPC
pub struct EthersLedger {
    client: Arc<Client>,
    contract: WeatherMarkets<Client>,
    stake_decimals: u32,
    /// Lowest market id that may still be unsettled
    scan_from: AtomicU64,
}

impl EthersLedger {
    pub async fn connect(
        rpc_url: &str,
        private_key: &str,
        contract_address: &str,
        stake_decimals: u32,
    ) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("Invalid RPC URL: {}", rpc_url))?;
        let chain_id = provider
            .get_chainid()
            .await
            .context("Failed to query chain id")?;

        let wallet = private_key
            .parse::<LocalWallet>()
            .context("Invalid keeper private key")?
            .with_chain_id(chain_id.as_u64());
        let keeper = wallet.address();

        let address: Address = contract_address
            .parse()
            .with_context(|| format!("Invalid contract address: {}", contract_address))?;

        let signer = SignerMiddleware::new(provider, wallet);
        let client = Arc::new(NonceManagerMiddleware::new(signer, keeper));
        let contract = WeatherMarkets::new(address, client.clone());

        info!(
            "Connected to chain {} as {:?}, contract {:?}",
            chain_id, keeper, address
        );

        Ok(Self {
            client,
            contract,
            stake_decimals,
            scan_from: AtomicU64::new(0),
        })
    }

    fn to_market(
        &self,
        id: u64,
        raw: (String, u64, i64, U256, U256, u8),
    ) -> Result<Market, LedgerError> {
        let (city, resolve_time, threshold_tenths, yes_pool, no_pool, status) = raw;

        let resolve_time = Utc
            .timestamp_opt(resolve_time as i64, 0)
            .single()
            .ok_or_else(|| LedgerError::Encoding(format!("bad resolve time for market {}", id)))?;
        let status = MarketStatus::from_code(status)
            .ok_or_else(|| LedgerError::Encoding(format!("unknown status {} for market {}", status, id)))?;

        Ok(Market {
            id,
            city,
            resolve_time,
            threshold_c: threshold_tenths as f64 / 10.0,
            yes_pool: self.units_to_f64(yes_pool),
            no_pool: self.units_to_f64(no_pool),
            status,
        })
    }

    fn units_to_f64(&self, value: U256) -> f64 {
        ethers::utils::format_units(value, self.stake_decimals)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0)
    }
}

fn to_tenths(celsius: f64) -> i64 {
    (celsius * 10.0).round() as i64
}

fn parse_proof(proof: &str) -> Result<Bytes, LedgerError> {
    proof
        .parse::<Bytes>()
        .map_err(|e| LedgerError::Encoding(format!("malformed proof: {}", e)))
}

fn map_contract_error<M: Middleware>(err: ContractError<M>) -> LedgerError {
    if let Some(reason) = err.decode_revert::<String>() {
        return LedgerError::reverted(reason);
    }

    let message = err.to_string();
    if err.is_revert() || message.contains("execution reverted") {
        LedgerError::reverted(message)
    } else {
        LedgerError::Rpc(message)
    }
}

#[async_trait]
impl Ledger for EthersLedger {
    async fn simulate(&self, call: &ContractCall) -> Result<(), LedgerError> {
        match call {
            ContractCall::CreateMarket { slot_id, city, resolve_time, threshold_c } => {
                self.contract
                    .create_market(*slot_id, city.clone(), resolve_time.timestamp() as u64, to_tenths(*threshold_c))
                    .call()
                    .await
                    .map(|_| ())
                    .map_err(map_contract_error)
            }
            ContractCall::ResolveMarket { market_id, temperature_c, proof } => {
                self.contract
                    .resolve_market(U256::from(*market_id), to_tenths(*temperature_c), parse_proof(proof)?)
                    .call()
                    .await
                    .map_err(map_contract_error)
            }
            ContractCall::CancelMarket { market_id } => {
                self.contract
                    .cancel_market(U256::from(*market_id))
                    .call()
                    .await
                    .map_err(map_contract_error)
            }
        }
    }

    async fn send(&self, call: &ContractCall) -> Result<H256, LedgerError> {
        let tx_hash = match call {
            ContractCall::CreateMarket { slot_id, city, resolve_time, threshold_c } => {
                let tx = self.contract.create_market(
                    *slot_id,
                    city.clone(),
                    resolve_time.timestamp() as u64,
                    to_tenths(*threshold_c),
                );
                let pending = tx.send().await.map_err(map_contract_error)?;
                pending.tx_hash()
            }
            ContractCall::ResolveMarket { market_id, temperature_c, proof } => {
                let tx = self.contract.resolve_market(
                    U256::from(*market_id),
                    to_tenths(*temperature_c),
                    parse_proof(proof)?,
                );
                let pending = tx.send().await.map_err(map_contract_error)?;
                pending.tx_hash()
            }
            ContractCall::CancelMarket { market_id } => {
                let tx = self.contract.cancel_market(U256::from(*market_id));
                let pending = tx.send().await.map_err(map_contract_error)?;
                pending.tx_hash()
            }
        };

        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, LedgerError> {
        let receipt = self
            .client
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;

        Ok(receipt.map(|r| TxReceipt {
            tx_hash,
            success: r.status == Some(U64::from(1)),
            block_number: r.block_number.map(|b| b.as_u64()),
        }))
    }

    async fn market(&self, market_id: u64) -> Result<Market, LedgerError> {
        let raw = self
            .contract
            .get_market(U256::from(market_id))
            .call()
            .await
            .map_err(map_contract_error)?;

        self.to_market(market_id, raw)
    }

    async fn markets_due(&self, now: DateTime<Utc>) -> Result<Vec<Market>, LedgerError> {
        let count = self
            .contract
            .market_count()
            .call()
            .await
            .map_err(map_contract_error)?
            .as_u64();

        let start = self.scan_from.load(Ordering::Relaxed);
        let mut first_live = None;
        let mut due = Vec::new();

        for id in start..count {
            let market = self.market(id).await?;
            if market.status.is_terminal() {
                continue;
            }
            first_live.get_or_insert(id);
            if market.is_due(now) {
                due.push(market);
            }
        }

        self.scan_from.store(first_live.unwrap_or(count), Ordering::Relaxed);
        debug!("Scanned markets {}..{}: {} due", start, count, due.len());
        Ok(due)
    }
}
