use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use crate::data::types::{Market, MarketSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    MarketCreation,
    Settlement,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::MarketCreation => "market-creation",
            QueueName::Settlement => "settlement",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market-creation" => Ok(QueueName::MarketCreation),
            "settlement" => Ok(QueueName::Settlement),
            other => anyhow::bail!("Unknown queue: {}", other),
        }
    }
}

/// Market the settlement worker should finalize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementTarget {
    pub market_id: u64,
    pub city: String,
    pub resolve_time: DateTime<Utc>,
}

impl From<&Market> for SettlementTarget {
    fn from(market: &Market) -> Self {
        Self {
            market_id: market.id,
            city: market.city.clone(),
            resolve_time: market.resolve_time,
        }
    }
}

/// Typed job payload; the variant decides which queue a job belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    CreateMarket(MarketSpec),
    SettleMarket(SettlementTarget),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::CreateMarket(_) => QueueName::MarketCreation,
            JobPayload::SettleMarket(_) => QueueName::Settlement,
        }
    }

    pub fn dedupe_key(&self) -> String {
        match self {
            JobPayload::CreateMarket(spec) => spec.dedupe_key(),
            JobPayload::SettleMarket(target) => format!("settle:{}", target.market_id),
        }
    }
}

/// A claimed unit of queued work
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub queue: QueueName,
    pub dedupe_key: Option<String>,
    pub payload: String,
    /// 1-based count of the attempt now running
    pub attempt: u32,
    pub worker_id: String,
}

impl Job {
    /// Decode and check the payload belongs on this job's queue
    pub fn decode_payload(&self) -> Result<JobPayload, JobError> {
        let payload: JobPayload = serde_json::from_str(&self.payload)
            .map_err(|e| JobError::Validation(format!("malformed payload: {}", e)))?;

        if payload.queue() != self.queue {
            return Err(JobError::Validation(format!(
                "{} payload on {} queue",
                payload.queue(),
                self.queue
            )));
        }
        Ok(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Put back without consuming an attempt
    Deferred(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Transient failure: {0}")]
    Transient(#[from] anyhow::Error),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued(i64),
    /// A job with the same dedupe key is pending, in flight, recently completed or dead-lettered
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    RetryScheduled { attempt: u32, delay: Duration },
    DeadLettered,
    /// Another worker reclaimed the job first; nothing was recorded
    LeaseLost,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: i64,
    pub queue: QueueName,
    pub dedupe_key: Option<String>,
    pub payload: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub queued: usize,
    pub running: usize,
    pub dead: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn job(queue: QueueName, payload: String) -> Job {
        Job {
            id: 1,
            queue,
            dedupe_key: None,
            payload,
            attempt: 1,
            worker_id: "w".to_string(),
        }
    }

    #[test]
    fn test_payload_rejected_on_wrong_queue() {
        let payload = JobPayload::SettleMarket(SettlementTarget {
            market_id: 4,
            city: "Chicago".to_string(),
            resolve_time: Utc.with_ymd_and_hms(2026, 2, 17, 18, 0, 0).unwrap(),
        });
        let raw = serde_json::to_string(&payload).unwrap();

        assert_eq!(job(QueueName::Settlement, raw.clone()).decode_payload().unwrap(), payload);
        assert!(matches!(
            job(QueueName::MarketCreation, raw).decode_payload(),
            Err(JobError::Validation(_))
        ));
    }

    #[test]
    fn test_malformed_payload_is_validation_error() {
        let err = job(QueueName::Settlement, "{\"kind\":\"nope\"}".to_string())
            .decode_payload()
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_dedupe_keys() {
        let spec = MarketSpec {
            date: NaiveDate::from_ymd_opt(2026, 2, 17).unwrap(),
            slot: 0,
            city: "London".to_string(),
            resolve_time: Utc.with_ymd_and_hms(2026, 2, 17, 12, 0, 0).unwrap(),
            threshold_c: 10.0,
        };
        assert_eq!(JobPayload::CreateMarket(spec).dedupe_key(), "2026-02-17:0:London");
        assert_eq!("settlement".parse::<QueueName>().unwrap(), QueueName::Settlement);
    }
}
