pub mod creation;
pub mod settlement;

use std::time::Duration;
use crate::data::ledger::SubmitError;
use crate::execution::types::{JobError, JobOutcome};

/// Map a failed submission onto the job error taxonomy.
/// A pause is not a failure: the job is put back for `recheck`.
pub(crate) fn outcome_for_submit_error(err: SubmitError, recheck: Duration) -> Result<JobOutcome, JobError> {
    match err {
        SubmitError::Paused => Ok(JobOutcome::Deferred(recheck)),
        SubmitError::Admin(e) => Err(JobError::Transient(e)),
        SubmitError::Ledger(e) if e.is_permanent() => Err(JobError::Permanent(e.to_string())),
        SubmitError::Ledger(e) => Err(JobError::Transient(anyhow::Error::new(e))),
    }
}
