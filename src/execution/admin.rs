use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use crate::execution::persistence::SharedStore;

/// Written by the authenticated admin surface, read-only here
pub const ADMIN_CONFIG_KEY: &str = "admin:config";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub settler_paused: bool,
    #[serde(default)]
    pub paused_reason: Option<String>,
}

/// Operator override consulted before every chain-mutating action.
/// Nothing is cached: each call reads the shared store.
#[derive(Clone)]
pub struct AdminGate {
    store: Arc<dyn SharedStore>,
}

impl AdminGate {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub fn config(&self) -> Result<AdminConfig> {
        match self.store.get(ADMIN_CONFIG_KEY)? {
            Some(raw) => serde_json::from_str(&raw).context("Malformed admin config"),
            None => Ok(AdminConfig::default()),
        }
    }

    pub fn settler_paused(&self) -> Result<bool> {
        Ok(self.config()?.settler_paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::persistence::KeeperDatabase;

    #[test]
    fn test_missing_config_means_running() {
        let db = Arc::new(KeeperDatabase::in_memory().unwrap());
        let gate = AdminGate::new(db);
        assert!(!gate.settler_paused().unwrap());
    }

    #[test]
    fn test_pause_read_on_every_call() {
        let db = Arc::new(KeeperDatabase::in_memory().unwrap());
        let gate = AdminGate::new(db.clone());

        db.set(ADMIN_CONFIG_KEY, r#"{"settler_paused":true,"paused_reason":"oracle audit"}"#).unwrap();
        assert!(gate.settler_paused().unwrap());
        assert_eq!(gate.config().unwrap().paused_reason.as_deref(), Some("oracle audit"));

        db.set(ADMIN_CONFIG_KEY, r#"{"settler_paused":false}"#).unwrap();
        assert!(!gate.settler_paused().unwrap());
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let db = Arc::new(KeeperDatabase::in_memory().unwrap());
        db.set(ADMIN_CONFIG_KEY, "paused").unwrap();
        assert!(AdminGate::new(db).settler_paused().is_err());
    }
}
