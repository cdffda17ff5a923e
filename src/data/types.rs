use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
    Cancelled,
}

impl MarketStatus {
    /// Resolved and Cancelled markets never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, MarketStatus::Resolved | MarketStatus::Cancelled)
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MarketStatus::Open),
            1 => Some(MarketStatus::Closed),
            2 => Some(MarketStatus::Resolved),
            3 => Some(MarketStatus::Cancelled),
            _ => None,
        }
    }
}

/// Working copy of an on-chain market. The contract stays the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: u64,
    pub city: String,
    pub resolve_time: DateTime<Utc>,
    pub threshold_c: f64,
    pub yes_pool: f64,
    pub no_pool: f64,
    pub status: MarketStatus,
}

impl Market {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.resolve_time <= now
            && matches!(self.status, MarketStatus::Open | MarketStatus::Closed)
    }
}

/// One market the scheduler wants opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSpec {
    pub date: NaiveDate,
    pub slot: u32,
    pub city: String,
    pub resolve_time: DateTime<Utc>,
    pub threshold_c: f64,
}

impl MarketSpec {
    /// De-duplication key: one job per date and city slot
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}:{}", self.date, self.slot, self.city)
    }
}

/// Health color reported by the weather/oracle provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Green,
    Yellow,
    Red,
    /// The probe itself failed
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Green => "green",
            HealthStatus::Yellow => "yellow",
            HealthStatus::Red => "red",
            HealthStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Attested observation returned by the proof service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub city: String,
    pub observed_at: DateTime<Utc>,
    /// None when the provider could not evaluate the market condition
    pub temperature_c: Option<f64>,
    /// Hex-encoded attestation passed through to the contract
    pub proof: String,
}
