use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use crate::execution::types::{DeadLetter, EnqueueResult, Job, QueueDepth, QueueName};

/// Key/value view of the shared store (outage sentinel, admin config)
pub trait SharedStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// SQLite file shared by every keeper process on the host
#[derive(Clone)]
pub struct KeeperDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl KeeperDatabase {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // Other processes hold the write lock briefly during claims
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                dedupe_key TEXT,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                available_at_ms INTEGER NOT NULL,
                lease_expires_at_ms INTEGER,
                worker_id TEXT,
                last_error TEXT,
                created_at_ms INTEGER NOT NULL,
                UNIQUE(queue, dedupe_key)
            );

            CREATE TABLE IF NOT EXISTS completed_jobs (
                queue TEXT NOT NULL,
                dedupe_key TEXT NOT NULL,
                completed_at_ms INTEGER NOT NULL,
                PRIMARY KEY(queue, dedupe_key)
            );

            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                dedupe_key TEXT,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                error TEXT NOT NULL,
                failed_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_dispatch ON jobs(queue, status, available_at_ms);
            CREATE INDEX IF NOT EXISTS idx_dead_letters_key ON dead_letters(queue, dedupe_key);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Database lock poisoned"))
    }

    /// Insert a job unless its dedupe key is pending, in flight, recently completed or dead-lettered
    pub fn insert_job(
        &self,
        queue: QueueName,
        dedupe_key: Option<&str>,
        payload: &str,
        now: DateTime<Utc>,
        completed_cutoff: DateTime<Utc>,
    ) -> Result<EnqueueResult> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(key) = dedupe_key {
            let blocked: bool = tx.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM completed_jobs
                    WHERE queue = ?1 AND dedupe_key = ?2 AND completed_at_ms >= ?3
                 ) OR EXISTS(
                    SELECT 1 FROM dead_letters WHERE queue = ?1 AND dedupe_key = ?2
                 )",
                params![queue.as_str(), key, completed_cutoff.timestamp_millis()],
                |row| row.get(0),
            )?;
            if blocked {
                return Ok(EnqueueResult::Duplicate);
            }
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO jobs (queue, dedupe_key, payload, status, attempts, available_at_ms, created_at_ms)
             VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?4)",
            params![queue.as_str(), dedupe_key, payload, now.timestamp_millis()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        if inserted == 0 {
            Ok(EnqueueResult::Duplicate)
        } else {
            Ok(EnqueueResult::Enqueued(id))
        }
    }

    /// Claim the oldest runnable job: queued and due, or running with an expired lease
    pub fn claim_job(
        &self,
        queue: QueueName,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> Result<Option<Job>> {
        let now_ms = now.timestamp_millis();
        let lease_expires_at_ms = now_ms + lease_ttl.as_millis() as i64;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate = tx
            .query_row(
                "SELECT id, dedupe_key, payload, attempts FROM jobs
                 WHERE queue = ?1
                   AND ((status = 'queued' AND available_at_ms <= ?2)
                     OR (status = 'running' AND lease_expires_at_ms < ?2))
                 ORDER BY available_at_ms ASC, id ASC
                 LIMIT 1",
                params![queue.as_str(), now_ms],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, dedupe_key, payload, attempts)) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs
             SET status = 'running', attempts = attempts + 1, worker_id = ?2, lease_expires_at_ms = ?3
             WHERE id = ?1",
            params![id, worker_id, lease_expires_at_ms],
        )?;
        tx.commit()?;

        Ok(Some(Job {
            id,
            queue,
            dedupe_key,
            payload,
            attempt: attempts + 1,
            worker_id: worker_id.to_string(),
        }))
    }

    /// Delete a finished job and remember its dedupe key. False if the lease was lost.
    pub fn complete_job(&self, job: &Job, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let deleted = tx.execute(
            "DELETE FROM jobs WHERE id = ?1 AND worker_id = ?2 AND attempts = ?3",
            params![job.id, job.worker_id, job.attempt],
        )?;
        if deleted > 0 {
            if let Some(key) = &job.dedupe_key {
                tx.execute(
                    "INSERT OR REPLACE INTO completed_jobs (queue, dedupe_key, completed_at_ms)
                     VALUES (?1, ?2, ?3)",
                    params![job.queue.as_str(), key, now.timestamp_millis()],
                )?;
            }
        }
        tx.commit()?;

        Ok(deleted > 0)
    }

    /// Return a job to the queue. Without `consume_attempt` the claim is not counted.
    pub fn reschedule_job(
        &self,
        job: &Job,
        available_at: DateTime<Utc>,
        error: Option<&str>,
        consume_attempt: bool,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let refund: u32 = if consume_attempt { 0 } else { 1 };

        let updated = conn.execute(
            "UPDATE jobs
             SET status = 'queued', available_at_ms = ?4, last_error = COALESCE(?5, last_error),
                 attempts = attempts - ?6, worker_id = NULL, lease_expires_at_ms = NULL
             WHERE id = ?1 AND worker_id = ?2 AND attempts = ?3",
            params![
                job.id,
                job.worker_id,
                job.attempt,
                available_at.timestamp_millis(),
                error,
                refund
            ],
        )?;

        Ok(updated > 0)
    }

    /// Move a job to the dead-letter table. None if the lease was lost.
    pub fn dead_letter_job(&self, job: &Job, error: &str, now: DateTime<Utc>) -> Result<Option<i64>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let deleted = tx.execute(
            "DELETE FROM jobs WHERE id = ?1 AND worker_id = ?2 AND attempts = ?3",
            params![job.id, job.worker_id, job.attempt],
        )?;
        if deleted == 0 {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO dead_letters (queue, dedupe_key, payload, attempts, error, failed_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.queue.as_str(),
                job.dedupe_key,
                job.payload,
                job.attempt,
                error,
                now.timestamp_millis()
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Some(id))
    }

    pub fn list_dead_letters(&self, queue: Option<QueueName>) -> Result<Vec<DeadLetter>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, queue, dedupe_key, payload, attempts, error, failed_at_ms
             FROM dead_letters
             WHERE ?1 IS NULL OR queue = ?1
             ORDER BY failed_at_ms ASC",
        )?;

        let rows = stmt.query_map(params![queue.map(|q| q.as_str())], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut letters = Vec::new();
        for row in rows {
            let (id, queue, dedupe_key, payload, attempts, error, failed_at_ms) = row?;
            letters.push(DeadLetter {
                id,
                queue: queue.parse()?,
                dedupe_key,
                payload,
                attempts,
                error,
                failed_at: ms_to_dt(failed_at_ms),
            });
        }
        Ok(letters)
    }

    /// Put a dead letter back on its queue with a fresh retry budget
    pub fn replay_dead_letter(&self, id: i64, now: DateTime<Utc>) -> Result<Option<EnqueueResult>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let letter = tx
            .query_row(
                "SELECT queue, dedupe_key, payload FROM dead_letters WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((queue, dedupe_key, payload)) = letter else {
            return Ok(None);
        };

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO jobs (queue, dedupe_key, payload, status, attempts, available_at_ms, created_at_ms)
             VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?4)",
            params![queue, dedupe_key, payload, now.timestamp_millis()],
        )?;
        let job_id = tx.last_insert_rowid();
        // Keep the record when an identical job is already pending
        if inserted > 0 {
            tx.execute("DELETE FROM dead_letters WHERE id = ?1", params![id])?;
        }
        tx.commit()?;

        Ok(Some(if inserted == 0 {
            EnqueueResult::Duplicate
        } else {
            EnqueueResult::Enqueued(job_id)
        }))
    }

    pub fn queue_depth(&self, queue: QueueName) -> Result<QueueDepth> {
        let conn = self.lock()?;
        let (queued, running): (usize, usize) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0)
             FROM jobs WHERE queue = ?1",
            params![queue.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let dead: usize = conn.query_row(
            "SELECT COUNT(*) FROM dead_letters WHERE queue = ?1",
            params![queue.as_str()],
            |row| row.get(0),
        )?;

        Ok(QueueDepth { queued, running, dead })
    }

    /// Forget completed dedupe keys older than the cutoff
    pub fn purge_completed(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let purged = conn.execute(
            "DELETE FROM completed_jobs WHERE completed_at_ms < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(purged)
    }

    #[cfg(test)]
    pub fn available_at(&self, job_id: i64) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let ms: Option<i64> = conn
            .query_row(
                "SELECT available_at_ms FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ms.map(ms_to_dt))
    }
}

impl SharedStore for KeeperDatabase {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at_ms = ?3",
            params![key, value, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::hours(48)
    }

    #[test]
    fn test_kv_roundtrip() {
        let db = KeeperDatabase::in_memory().unwrap();
        assert_eq!(db.get("outage:provider").unwrap(), None);

        db.set("outage:provider", "red").unwrap();
        db.set("outage:provider", "red-again").unwrap();
        assert_eq!(db.get("outage:provider").unwrap().as_deref(), Some("red-again"));

        db.delete("outage:provider").unwrap();
        assert_eq!(db.get("outage:provider").unwrap(), None);
    }

    #[test]
    fn test_dedupe_key_blocks_pending_job() {
        let db = KeeperDatabase::in_memory().unwrap();
        let now = Utc::now();

        let first = db.insert_job(QueueName::Settlement, Some("settle:1"), "{}", now, cutoff(now)).unwrap();
        let second = db.insert_job(QueueName::Settlement, Some("settle:1"), "{}", now, cutoff(now)).unwrap();
        let other_queue = db.insert_job(QueueName::MarketCreation, Some("settle:1"), "{}", now, cutoff(now)).unwrap();

        assert!(matches!(first, EnqueueResult::Enqueued(_)));
        assert_eq!(second, EnqueueResult::Duplicate);
        assert!(matches!(other_queue, EnqueueResult::Enqueued(_)));
    }

    #[test]
    fn test_claim_is_exclusive_until_lease_expires() {
        let db = KeeperDatabase::in_memory().unwrap();
        let now = Utc::now();
        db.insert_job(QueueName::Settlement, Some("settle:1"), "{}", now, cutoff(now)).unwrap();

        let lease = Duration::from_secs(60);
        let job = db.claim_job(QueueName::Settlement, "a", now, lease).unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        assert!(db.claim_job(QueueName::Settlement, "b", now, lease).unwrap().is_none());

        // Worker "a" crashed; its lease lapses and "b" takes over
        let later = now + chrono::Duration::seconds(61);
        let stolen = db.claim_job(QueueName::Settlement, "b", later, lease).unwrap().unwrap();
        assert_eq!(stolen.id, job.id);
        assert_eq!(stolen.attempt, 2);

        // The stale owner can no longer settle the job
        assert!(!db.complete_job(&job, later).unwrap());
        assert!(db.complete_job(&stolen, later).unwrap());
    }

    #[test]
    fn test_completed_key_remembered_until_purged() {
        let db = KeeperDatabase::in_memory().unwrap();
        let now = Utc::now();
        db.insert_job(QueueName::MarketCreation, Some("2026-02-17:0:London"), "{}", now, cutoff(now)).unwrap();
        let job = db.claim_job(QueueName::MarketCreation, "a", now, Duration::from_secs(60)).unwrap().unwrap();
        db.complete_job(&job, now).unwrap();

        let again = db.insert_job(QueueName::MarketCreation, Some("2026-02-17:0:London"), "{}", now, cutoff(now)).unwrap();
        assert_eq!(again, EnqueueResult::Duplicate);

        assert_eq!(db.purge_completed(now + chrono::Duration::seconds(1)).unwrap(), 1);
        let after_purge = db.insert_job(QueueName::MarketCreation, Some("2026-02-17:0:London"), "{}", now, cutoff(now)).unwrap();
        assert!(matches!(after_purge, EnqueueResult::Enqueued(_)));
    }

    #[test]
    fn test_dead_letter_blocks_key_until_replayed() {
        let db = KeeperDatabase::in_memory().unwrap();
        let now = Utc::now();
        db.insert_job(QueueName::Settlement, Some("settle:9"), "{}", now, cutoff(now)).unwrap();
        let job = db.claim_job(QueueName::Settlement, "a", now, Duration::from_secs(60)).unwrap().unwrap();

        let letter_id = db.dead_letter_job(&job, "invalid status", now).unwrap().unwrap();
        assert_eq!(db.queue_depth(QueueName::Settlement).unwrap(), QueueDepth { queued: 0, running: 0, dead: 1 });
        assert_eq!(
            db.insert_job(QueueName::Settlement, Some("settle:9"), "{}", now, cutoff(now)).unwrap(),
            EnqueueResult::Duplicate
        );

        let letters = db.list_dead_letters(Some(QueueName::Settlement)).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error, "invalid status");
        assert_eq!(letters[0].attempts, 1);

        let replayed = db.replay_dead_letter(letter_id, now).unwrap();
        assert!(matches!(replayed, Some(EnqueueResult::Enqueued(_))));
        let fresh = db.claim_job(QueueName::Settlement, "a", now, Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(fresh.attempt, 1);
        assert!(db.replay_dead_letter(letter_id, now).unwrap().is_none());
    }

    #[test]
    fn test_replay_keeps_letter_when_job_already_pending() {
        let db = KeeperDatabase::in_memory().unwrap();
        let now = Utc::now();
        db.insert_job(QueueName::Settlement, Some("settle:4"), "{}", now, cutoff(now)).unwrap();
        let job = db.claim_job(QueueName::Settlement, "a", now, Duration::from_secs(60)).unwrap().unwrap();
        let letter_id = db.dead_letter_job(&job, "rpc timeout", now).unwrap().unwrap();

        // An operator re-created the job by hand before replaying
        db.lock()
            .unwrap()
            .execute(
                "INSERT INTO jobs (queue, dedupe_key, payload, status, attempts, available_at_ms, created_at_ms)
                 VALUES ('settlement', 'settle:4', '{}', 'queued', 0, ?1, ?1)",
                params![now.timestamp_millis()],
            )
            .unwrap();

        assert_eq!(db.replay_dead_letter(letter_id, now).unwrap(), Some(EnqueueResult::Duplicate));
        let letters = db.list_dead_letters(Some(QueueName::Settlement)).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id, letter_id);
    }

    #[test]
    fn test_reschedule_without_consuming_attempt() {
        let db = KeeperDatabase::in_memory().unwrap();
        let now = Utc::now();
        db.insert_job(QueueName::Settlement, None, "{}", now, cutoff(now)).unwrap();
        let job = db.claim_job(QueueName::Settlement, "a", now, Duration::from_secs(60)).unwrap().unwrap();

        let later = now + chrono::Duration::seconds(30);
        assert!(db.reschedule_job(&job, later, None, false).unwrap());
        assert!(db.claim_job(QueueName::Settlement, "a", now, Duration::from_secs(60)).unwrap().is_none());

        let again = db.claim_job(QueueName::Settlement, "a", later, Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(again.attempt, 1);
    }
}
