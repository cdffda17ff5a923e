pub mod admin;
pub mod backoff;
pub mod outage;
pub mod persistence;
pub mod queue;
pub mod simulator;
pub mod types;
