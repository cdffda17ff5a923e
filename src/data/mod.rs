pub mod contract;
pub mod ledger;
pub mod types;
pub mod weather;
