use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::execution::backoff::backoff_delay;
use crate::execution::persistence::KeeperDatabase;
use crate::execution::types::{
    EnqueueResult, FailureDisposition, Job, JobError, JobOutcome, JobPayload, QueueName,
};
use crate::monitoring::logger::EventJournal;

static WORKER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

/// Handle to one named queue in the shared database
#[derive(Clone)]
pub struct Queue {
    name: QueueName,
    db: KeeperDatabase,
    retry: RetryPolicy,
    lease_ttl: Duration,
    dedupe_retention: chrono::Duration,
    journal: Option<Arc<EventJournal>>,
}

impl Queue {
    pub fn new(
        name: QueueName,
        db: KeeperDatabase,
        retry: RetryPolicy,
        lease_ttl: Duration,
        dedupe_retention: chrono::Duration,
    ) -> Self {
        Self {
            name,
            db,
            retry,
            lease_ttl,
            dedupe_retention,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<EventJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    /// Enqueue keyed by the payload's own dedupe key
    pub fn enqueue(&self, payload: &JobPayload) -> Result<EnqueueResult> {
        self.enqueue_keyed(payload, Some(payload.dedupe_key()))
    }

    pub fn enqueue_keyed(&self, payload: &JobPayload, dedupe_key: Option<String>) -> Result<EnqueueResult> {
        if payload.queue() != self.name {
            anyhow::bail!("Refusing {} payload on {} queue", payload.queue(), self.name);
        }

        let now = Utc::now();
        let raw = serde_json::to_string(payload)?;
        let result = self.db.insert_job(
            self.name,
            dedupe_key.as_deref(),
            &raw,
            now,
            now - self.dedupe_retention,
        )?;

        match result {
            EnqueueResult::Enqueued(id) => {
                debug!(queue = %self.name, job_id = id, dedupe_key = ?dedupe_key, "Job enqueued")
            }
            EnqueueResult::Duplicate => {
                debug!(queue = %self.name, dedupe_key = ?dedupe_key, "Duplicate job ignored")
            }
        }
        Ok(result)
    }

    pub fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.db.claim_job(self.name, worker_id, now, self.lease_ttl)
    }

    pub fn complete(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        if !self.db.complete_job(job, now)? {
            warn!(queue = %self.name, job_id = job.id, "Lease lost before completion");
        }
        Ok(())
    }

    /// Requeue without consuming an attempt
    pub fn defer(&self, job: &Job, delay: Duration, now: DateTime<Utc>) -> Result<()> {
        let available_at = now + chrono::Duration::from_std(delay)?;
        if !self.db.reschedule_job(job, available_at, None, false)? {
            warn!(queue = %self.name, job_id = job.id, "Lease lost before deferral");
        }
        Ok(())
    }

    /// Schedule a retry with backoff, or dead-letter once the budget is spent
    pub fn fail(&self, job: &Job, err: &JobError, now: DateTime<Utc>) -> Result<FailureDisposition> {
        let reason = err.to_string();

        if err.is_retryable() && job.attempt <= self.retry.max_retries {
            let delay = backoff_delay(job.attempt, self.retry.backoff_base_ms);
            let available_at = now + chrono::Duration::from_std(delay)?;
            if !self.db.reschedule_job(job, available_at, Some(&reason), true)? {
                warn!(queue = %self.name, job_id = job.id, error = %reason, "Lease lost before retry scheduling");
                return Ok(FailureDisposition::LeaseLost);
            }

            warn!(
                queue = %self.name,
                job_id = job.id,
                attempt = job.attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %reason,
                "🔁 Job failed, retry scheduled"
            );
            return Ok(FailureDisposition::RetryScheduled {
                attempt: job.attempt,
                delay,
            });
        }

        if self.db.dead_letter_job(job, &reason, now)?.is_none() {
            warn!(queue = %self.name, job_id = job.id, "Lease lost before dead-lettering");
            return Ok(FailureDisposition::LeaseLost);
        }

        error!(
            queue = %self.name,
            job_id = job.id,
            dedupe_key = ?job.dedupe_key,
            attempts = job.attempt,
            error = %reason,
            "💀 Job dead-lettered"
        );
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.log_dead_letter(job, &reason) {
                warn!("Failed to journal dead letter: {:#}", e);
            }
        }
        Ok(FailureDisposition::DeadLettered)
    }

    #[cfg(test)]
    pub fn depth(&self) -> Result<crate::execution::types::QueueDepth> {
        self.db.queue_depth(self.name)
    }
}

/// Work performed for each job pulled off a queue
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job, payload: JobPayload) -> Result<JobOutcome, JobError>;
}

/// Runs up to `concurrency` processor invocations against one queue
pub struct Worker {
    queue: Queue,
    concurrency: usize,
    processor: Arc<dyn JobProcessor>,
    worker_id: String,
    idle_poll: Duration,
}

impl Worker {
    pub fn new(queue: Queue, concurrency: usize, processor: Arc<dyn JobProcessor>) -> Self {
        let worker_id = format!(
            "{}-{}-{}",
            queue.name(),
            std::process::id(),
            WORKER_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        Self {
            queue,
            concurrency: concurrency.max(1),
            processor,
            worker_id,
            idle_poll: Duration::from_millis(500),
        }
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        info!(
            queue = %self.queue.name(),
            worker = %self.worker_id,
            concurrency = self.concurrency,
            "👷 Worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let claimed = self.queue.claim(&self.worker_id, Utc::now());
            let job = match claimed {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_poll) => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    warn!(queue = %self.queue.name(), "Failed to claim job: {:#}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_poll) => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
            };

            // Malformed payloads never reach the processor
            let payload = match job.decode_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    if let Err(e) = self.queue.fail(&job, &err, Utc::now()) {
                        error!(queue = %self.queue.name(), job_id = job.id, "Failed to reject job: {:#}", e);
                    }
                    continue;
                }
            };

            let queue = self.queue.clone();
            let processor = self.processor.clone();
            tokio::spawn(async move {
                execute(&queue, processor.as_ref(), job, payload).await;
                drop(permit);
            });
        }

        // Wait for in-flight jobs
        let _ = permits.acquire_many(self.concurrency as u32).await;
        info!(queue = %self.queue.name(), worker = %self.worker_id, "Worker stopped");
    }
}

async fn execute(queue: &Queue, processor: &dyn JobProcessor, job: Job, payload: JobPayload) {
    debug!(queue = %queue.name(), job_id = job.id, attempt = job.attempt, "Processing job");

    let result = processor.process(&job, payload).await;
    let now = Utc::now();

    let recorded = match result {
        Ok(JobOutcome::Completed) => {
            info!(queue = %queue.name(), job_id = job.id, attempt = job.attempt, "Job completed");
            queue.complete(&job, now)
        }
        Ok(JobOutcome::Deferred(delay)) => {
            debug!(queue = %queue.name(), job_id = job.id, ?delay, "Job deferred");
            queue.defer(&job, delay, now)
        }
        Err(err) => queue.fail(&job, &err, now).map(|_| ()),
    };

    if let Err(e) = recorded {
        error!(queue = %queue.name(), job_id = job.id, "Failed to record job result: {:#}", e);
    }
}
