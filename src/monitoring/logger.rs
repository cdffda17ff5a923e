use anyhow::Result;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;
use crate::data::types::HealthStatus;
use crate::execution::types::Job;

/// Append-only CSV record of events operators need to see: outage transitions and dead letters
pub struct EventJournal {
    log_path: String,
    write_lock: Mutex<()>,
}

impl EventJournal {
    pub fn new(log_path: String) -> Result<Self> {
        // Create CSV file with headers if it doesn't exist
        if !std::path::Path::new(&log_path).exists() {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&log_path)?;

            writeln!(file, "timestamp,event,queue,job_id,dedupe_key,attempts,detail")?;
        }

        Ok(Self {
            log_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Log an outage state transition
    pub fn log_outage_transition(&self, is_outage: bool, status: HealthStatus) -> Result<()> {
        let event = if is_outage { "OUTAGE_START" } else { "OUTAGE_END" };
        self.append(&format!(
            "{},{},,,,,{}",
            Utc::now().to_rfc3339(),
            event,
            status
        ))
    }

    /// Log a job that exhausted its retries or failed permanently
    pub fn log_dead_letter(&self, job: &Job, reason: &str) -> Result<()> {
        self.append(&format!(
            "{},DEAD_LETTER,{},{},{},{},{}",
            Utc::now().to_rfc3339(),
            job.queue,
            job.id,
            escape(job.dedupe_key.as_deref().unwrap_or("")),
            job.attempt,
            escape(reason)
        ))
    }

    fn append(&self, line: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Journal lock poisoned"))?;

        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

fn escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
