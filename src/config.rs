use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::str::FromStr;
use std::time::Duration;
use crate::execution::queue::RetryPolicy;

pub const MAX_MARKETS_PER_DAY: usize = 5;
pub const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub creation: CreationConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub outage: OutageConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    pub dry_run: bool,
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub lease_ttl_secs: u64,
    pub dedupe_retention_hours: i64,
    pub idle_poll_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff_base_ms: 5000,
            lease_ttl_secs: 600,
            dedupe_retention_hours: 48,
            idle_poll_ms: 500,
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base_ms: self.backoff_base_ms,
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn dedupe_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.dedupe_retention_hours)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CitySlot {
    pub name: String,
    pub threshold_c: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreationConfig {
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_markets_per_day")]
    pub markets_per_day: usize,
    pub cities: Vec<CitySlot>,
    /// Resolve hour (UTC) of the first slot
    #[serde(default = "default_first_resolve_hour")]
    pub first_resolve_hour_utc: u32,
    /// Hours between consecutive slots; 0 resolves every slot at the same time
    #[serde(default)]
    pub spacing_hours: u32,
    /// Days between the batch date and the resolve date
    #[serde(default = "default_resolve_after_days")]
    pub resolve_after_days: i64,
}

fn default_cron() -> String { "0 0 0 * * *".to_string() }
fn default_markets_per_day() -> usize { MAX_MARKETS_PER_DAY }
fn default_first_resolve_hour() -> u32 { 12 }
fn default_resolve_after_days() -> i64 { 1 }

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub poll_interval_secs: u64,
    pub concurrency: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutageConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub gate_on_degraded: bool,
    pub probe_timeout_secs: u64,
}

impl Default for OutageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 30,
            gate_on_degraded: false,
            probe_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub confirmation_timeout_secs: u64,
    pub receipt_poll_ms: u64,
    pub stake_decimals: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: 120,
            receipt_poll_ms: 2000,
            stake_decimals: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub csv_logging: bool,
    pub csv_log_path: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            csv_logging: false,
            csv_log_path: "keeper_events.csv".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub chain_rpc_url: Option<String>,
    pub market_contract_address: Option<String>,
    pub keeper_private_key: Option<String>,
    pub oracle_api_url: Option<String>,
    pub oracle_api_key: Option<String>,
    pub database_path: Option<String>,
    pub dry_run: Option<bool>,
}

pub struct ChainCredentials<'a> {
    pub rpc_url: &'a str,
    pub contract_address: &'a str,
    pub private_key: &'a str,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&contents).with_context(|| format!("Invalid config file: {}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let creation = &self.creation;
        if creation.markets_per_day == 0 || creation.markets_per_day > MAX_MARKETS_PER_DAY {
            anyhow::bail!(
                "creation.markets_per_day must be between 1 and {}, got {}",
                MAX_MARKETS_PER_DAY,
                creation.markets_per_day
            );
        }
        if creation.cities.is_empty() {
            anyhow::bail!("creation.cities must list at least one city");
        }
        if creation.cities.iter().any(|c| c.name.trim().is_empty()) {
            anyhow::bail!("creation.cities contains an empty city name");
        }
        cron::Schedule::from_str(&creation.cron)
            .with_context(|| format!("Invalid creation.cron expression: {}", creation.cron))?;

        let last_hour = creation
            .spacing_hours
            .checked_mul(creation.markets_per_day as u32 - 1)
            .and_then(|span| span.checked_add(creation.first_resolve_hour_utc))
            .with_context(|| format!("creation.spacing_hours {} overflows the day", creation.spacing_hours))?;
        if last_hour > 23 {
            anyhow::bail!(
                "creation slots overflow the day: last slot would resolve at hour {}",
                last_hour
            );
        }
        if creation.resolve_after_days < 0 {
            anyhow::bail!("creation.resolve_after_days cannot be negative");
        }

        if self.queue.max_retries == 0 || self.queue.max_retries > MAX_RETRIES {
            anyhow::bail!(
                "queue.max_retries must be between 1 and {}, got {}",
                MAX_RETRIES,
                self.queue.max_retries
            );
        }
        if self.queue.backoff_base_ms == 0 {
            anyhow::bail!("queue.backoff_base_ms must be positive");
        }
        if self.queue.lease_ttl_secs <= self.chain.confirmation_timeout_secs {
            anyhow::bail!("queue.lease_ttl_secs must exceed chain.confirmation_timeout_secs");
        }

        if self.settlement.concurrency == 0 {
            anyhow::bail!("settlement.concurrency must be at least 1");
        }
        if self.settlement.poll_interval_secs == 0 || self.outage.poll_interval_secs == 0 {
            anyhow::bail!("poll intervals must be positive");
        }

        Ok(())
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            chain_rpc_url: std::env::var("CHAIN_RPC_URL").ok(),
            market_contract_address: std::env::var("MARKET_CONTRACT_ADDRESS").ok(),
            keeper_private_key: std::env::var("KEEPER_PRIVATE_KEY").ok(),
            oracle_api_url: std::env::var("ORACLE_API_URL").ok(),
            oracle_api_key: std::env::var("ORACLE_API_KEY").ok(),
            database_path: std::env::var("KEEPER_DATABASE_PATH").ok(),
            dry_run: match std::env::var("DRY_RUN") {
                Ok(v) => Some(v.parse().with_context(|| format!("DRY_RUN must be true or false, got {}", v))?),
                Err(_) => None,
            },
        })
    }

    pub fn oracle_api_url(&self) -> Result<&str> {
        self.oracle_api_url.as_deref().context("ORACLE_API_URL not set")
    }

    /// Environment override wins over the config file
    pub fn database_path<'a>(&'a self, config: &'a Config) -> &'a str {
        self.database_path.as_deref().unwrap_or(&config.system.database_path)
    }

    pub fn dry_run(&self, config: &Config) -> bool {
        self.dry_run.unwrap_or(config.system.dry_run)
    }

    pub fn chain_credentials(&self) -> Result<ChainCredentials<'_>> {
        Ok(ChainCredentials {
            rpc_url: self.chain_rpc_url.as_deref().context("CHAIN_RPC_URL not set")?,
            contract_address: self
                .market_contract_address
                .as_deref()
                .context("MARKET_CONTRACT_ADDRESS not set")?,
            private_key: self
                .keeper_private_key
                .as_deref()
                .context("KEEPER_PRIVATE_KEY not set")?,
        })
    }
}
