use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use crate::config::CreationConfig;
use crate::data::ledger::{ContractCall, RevertKind, SubmitError, TxSubmitter};
use crate::data::types::MarketSpec;
use crate::execution::admin::AdminGate;
use crate::execution::queue::{JobProcessor, Queue};
use crate::execution::types::{EnqueueResult, Job, JobError, JobOutcome, JobPayload};
use crate::pipelines::outcome_for_submit_error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FireReport {
    pub paused: bool,
    pub enqueued: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Fires on the creation cron and enqueues the day's batch
pub struct CreationScheduler {
    queue: Queue,
    admin: AdminGate,
    config: CreationConfig,
    schedule: Schedule,
}

impl CreationScheduler {
    pub fn new(queue: Queue, admin: AdminGate, config: CreationConfig) -> Result<Self> {
        let schedule = Schedule::from_str(&config.cron)
            .with_context(|| format!("Invalid creation cron: {}", config.cron))?;

        Ok(Self {
            queue,
            admin,
            config,
            schedule,
        })
    }

    /// One spec per slot, cycling through the configured cities
    pub fn plan_batch(&self, date: NaiveDate) -> Result<Vec<MarketSpec>> {
        let resolve_date = date
            .checked_add_signed(chrono::Duration::days(self.config.resolve_after_days))
            .context("Resolve date out of range")?;

        (0..self.config.markets_per_day)
            .map(|slot| -> Result<MarketSpec> {
                let city = &self.config.cities[slot % self.config.cities.len()];
                let hour = self.config.first_resolve_hour_utc + self.config.spacing_hours * slot as u32;
                let naive = resolve_date
                    .and_hms_opt(hour, 0, 0)
                    .with_context(|| format!("Slot {} resolves outside the day (hour {})", slot, hour))?;

                Ok(MarketSpec {
                    date,
                    slot: slot as u32,
                    city: city.name.clone(),
                    resolve_time: Utc.from_utc_datetime(&naive),
                    threshold_c: city.threshold_c,
                })
            })
            .collect()
    }

    pub fn fire(&self, now: DateTime<Utc>) -> Result<FireReport> {
        let admin = self.admin.config()?;
        if admin.settler_paused {
            info!(
                reason = admin.paused_reason.as_deref().unwrap_or("unspecified"),
                "⏸️  Settler paused, skipping market creation"
            );
            return Ok(FireReport {
                paused: true,
                ..FireReport::default()
            });
        }

        let mut report = FireReport::default();
        for spec in self.plan_batch(now.date_naive())? {
            let key = spec.dedupe_key();
            // One slot failing to enqueue does not stop the rest of the batch
            match self.queue.enqueue(&JobPayload::CreateMarket(spec)) {
                Ok(EnqueueResult::Enqueued(_)) => report.enqueued += 1,
                Ok(EnqueueResult::Duplicate) => report.duplicates += 1,
                Err(e) => {
                    warn!(dedupe_key = %key, "Failed to enqueue market creation: {:#}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            date = %now.date_naive(),
            enqueued = report.enqueued,
            duplicates = report.duplicates,
            failed = report.failed,
            "🗓️  Market creation batch scheduled"
        );
        Ok(report)
    }

    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(cron = %self.config.cron, "Market creation scheduler started");

        loop {
            let Some(next) = self.next_fire(Utc::now()) else {
                warn!("Creation cron has no upcoming fire time, scheduler stopping");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }

            if let Err(e) = self.fire(next) {
                warn!("Market creation tick failed: {:#}", e);
            }
        }
    }
}

/// Worker side of the creation queue
pub struct MarketCreator {
    submitter: Arc<TxSubmitter>,
    pause_recheck: Duration,
}

impl MarketCreator {
    pub fn new(submitter: Arc<TxSubmitter>, pause_recheck: Duration) -> Self {
        Self {
            submitter,
            pause_recheck,
        }
    }
}

/// Contract-side idempotency key for a creation slot
pub fn slot_id(spec: &MarketSpec) -> [u8; 32] {
    ethers::utils::keccak256(spec.dedupe_key().as_bytes())
}

#[async_trait]
impl JobProcessor for MarketCreator {
    async fn process(&self, job: &Job, payload: JobPayload) -> Result<JobOutcome, JobError> {
        let spec = match payload {
            JobPayload::CreateMarket(spec) => spec,
            other => {
                return Err(JobError::Validation(format!(
                    "expected a market spec, got {}",
                    other.dedupe_key()
                )))
            }
        };

        let call = ContractCall::CreateMarket {
            slot_id: slot_id(&spec),
            city: spec.city.clone(),
            resolve_time: spec.resolve_time,
            threshold_c: spec.threshold_c,
        };

        match self.submitter.submit(&call).await {
            Ok(receipt) => {
                info!(
                    job_id = job.id,
                    city = %spec.city,
                    resolve_time = %spec.resolve_time,
                    tx = ?receipt.tx_hash,
                    "🆕 Market created"
                );
                Ok(JobOutcome::Completed)
            }
            // An earlier attempt already landed
            Err(SubmitError::Ledger(e)) if e.revert_kind() == Some(RevertKind::AlreadyExists) => {
                info!(job_id = job.id, dedupe_key = %spec.dedupe_key(), "Market already exists for slot");
                Ok(JobOutcome::Completed)
            }
            Err(e) => outcome_for_submit_error(e, self.pause_recheck),
        }
    }
}
