use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use crate::data::ledger::{ContractCall, TxSubmitter};
use crate::data::weather::WeatherProvider;
use crate::execution::admin::AdminGate;
use crate::execution::outage::OutageGate;
use crate::execution::queue::{JobProcessor, Queue};
use crate::execution::types::{EnqueueResult, Job, JobError, JobOutcome, JobPayload, SettlementTarget};
use crate::pipelines::outcome_for_submit_error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub skipped: bool,
    pub due: usize,
    pub enqueued: usize,
}

/// Resolves or cancels markets once their resolve time has passed
pub struct SettlementEngine {
    submitter: Arc<TxSubmitter>,
    admin: AdminGate,
    outage: OutageGate,
    provider: Arc<dyn WeatherProvider>,
    recheck: Duration,
}

impl SettlementEngine {
    pub fn new(
        submitter: Arc<TxSubmitter>,
        admin: AdminGate,
        outage: OutageGate,
        provider: Arc<dyn WeatherProvider>,
        recheck: Duration,
    ) -> Self {
        Self {
            submitter,
            admin,
            outage,
            provider,
            recheck,
        }
    }

    /// Why settlement should hold off right now, if it should
    fn gate(&self) -> Result<Option<&'static str>> {
        if self.admin.settler_paused()? {
            return Ok(Some("settler paused"));
        }
        if self.outage.is_outage()? {
            return Ok(Some("provider outage"));
        }
        Ok(None)
    }

    /// Enqueue a settlement job for every market past its resolve time
    pub async fn poll_due_markets(&self, queue: &Queue, now: DateTime<Utc>) -> Result<PollReport> {
        if let Some(reason) = self.gate()? {
            debug!(reason, "Settlement poll skipped");
            return Ok(PollReport {
                skipped: true,
                ..PollReport::default()
            });
        }

        let due = self
            .submitter
            .ledger()
            .markets_due(now)
            .await
            .context("Failed to list due markets")?;

        let mut report = PollReport {
            due: due.len(),
            ..PollReport::default()
        };
        for market in &due {
            let payload = JobPayload::SettleMarket(SettlementTarget::from(market));
            match queue.enqueue(&payload) {
                Ok(EnqueueResult::Enqueued(_)) => report.enqueued += 1,
                Ok(EnqueueResult::Duplicate) => {}
                Err(e) => warn!(market_id = market.id, "Failed to enqueue settlement: {:#}", e),
            }
        }

        if report.enqueued > 0 {
            info!(due = report.due, enqueued = report.enqueued, "⚖️  Settlement jobs enqueued");
        }
        Ok(report)
    }

    pub async fn run_poll(self: Arc<Self>, queue: Queue, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Settlement poll every {:?}", interval);

        loop {
            if let Err(e) = self.poll_due_markets(&queue, Utc::now()).await {
                warn!("Settlement poll failed: {:#}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn settle(&self, job: &Job, target: SettlementTarget) -> Result<JobOutcome, JobError> {
        // Gates are re-checked per job; the poll that enqueued it may be stale
        if let Some(reason) = self.gate()? {
            info!(job_id = job.id, market_id = target.market_id, reason, "Settlement deferred");
            return Ok(JobOutcome::Deferred(self.recheck));
        }

        let market = self
            .submitter
            .ledger()
            .market(target.market_id)
            .await
            .map_err(|e| JobError::Transient(anyhow::Error::new(e).context("Failed to read market")))?;

        if market.status.is_terminal() {
            info!(job_id = job.id, market_id = market.id, status = ?market.status, "Market already settled");
            return Ok(JobOutcome::Completed);
        }

        let now = Utc::now();
        if market.resolve_time > now {
            let wait = (market.resolve_time - now).to_std().unwrap_or(self.recheck);
            return Ok(JobOutcome::Deferred(wait));
        }

        let observation = self
            .provider
            .fetch_observation(&market.city, market.resolve_time)
            .await
            .with_context(|| format!("Observation unavailable for {} at {}", market.city, market.resolve_time))?;

        let call = match observation.temperature_c {
            Some(temperature_c) => ContractCall::ResolveMarket {
                market_id: market.id,
                temperature_c,
                proof: observation.proof,
            },
            None => {
                warn!(market_id = market.id, city = %market.city, "No verifiable observation, cancelling market");
                ContractCall::CancelMarket { market_id: market.id }
            }
        };

        match self.submitter.submit(&call).await {
            Ok(receipt) => {
                info!(
                    job_id = job.id,
                    market_id = market.id,
                    call = call.name(),
                    tx = ?receipt.tx_hash,
                    "🏁 Market settled"
                );
                Ok(JobOutcome::Completed)
            }
            Err(e) => outcome_for_submit_error(e, self.recheck),
        }
    }
}

#[async_trait]
impl JobProcessor for SettlementEngine {
    async fn process(&self, job: &Job, payload: JobPayload) -> Result<JobOutcome, JobError> {
        match payload {
            JobPayload::SettleMarket(target) => self.settle(job, target).await,
            other => Err(JobError::Validation(format!(
                "expected a settlement target, got {}",
                other.dedupe_key()
            ))),
        }
    }
}
