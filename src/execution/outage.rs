use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use crate::data::types::HealthStatus;
use crate::data::weather::WeatherProvider;
use crate::execution::persistence::SharedStore;
use crate::monitoring::logger::EventJournal;

/// Present in the shared store exactly while the provider is in outage
pub const OUTAGE_SENTINEL_KEY: &str = "outage:weather-provider";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutageState {
    pub is_outage: bool,
    pub last_status: Option<HealthStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutageTick {
    pub changed: bool,
    pub is_outage: bool,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutagePolicy {
    /// Treat yellow as an outage too
    pub gate_on_degraded: bool,
}

/// Red and failed probes open the breaker; green closes it; yellow follows the policy.
pub fn next_outage_state(previous_is_outage: bool, status: HealthStatus, policy: OutagePolicy) -> OutageTick {
    let is_outage = match status {
        HealthStatus::Red | HealthStatus::Unknown => true,
        HealthStatus::Yellow => policy.gate_on_degraded,
        HealthStatus::Green => false,
    };

    OutageTick {
        changed: is_outage != previous_is_outage,
        is_outage,
        status,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Sentinel {
    status: HealthStatus,
    since: DateTime<Utc>,
}

/// Circuit breaker over the weather/oracle provider
pub struct OutageController {
    provider: Arc<dyn WeatherProvider>,
    store: Arc<dyn SharedStore>,
    policy: OutagePolicy,
    state: Mutex<OutageState>,
    journal: Option<Arc<EventJournal>>,
}

impl OutageController {
    /// Starts from whatever the shared store currently says
    pub fn new(
        provider: Arc<dyn WeatherProvider>,
        store: Arc<dyn SharedStore>,
        policy: OutagePolicy,
    ) -> Result<Self> {
        let is_outage = store.get(OUTAGE_SENTINEL_KEY)?.is_some();
        if is_outage {
            warn!("Provider outage sentinel present at startup");
        }

        Ok(Self {
            provider,
            store,
            policy,
            state: Mutex::new(OutageState {
                is_outage,
                last_status: None,
            }),
            journal: None,
        })
    }

    pub fn with_journal(mut self, journal: Arc<EventJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> Result<OutageState> {
        self.state
            .lock()
            .map(|s| *s)
            .map_err(|_| anyhow::anyhow!("Outage state lock poisoned"))
    }

    /// Probe the provider and apply the reading. Probe failures are returned, not swallowed.
    pub async fn tick(&self) -> Result<OutageTick> {
        let status = self
            .provider
            .health_check()
            .await
            .context("Provider health probe failed")?;
        self.apply(status)
    }

    /// Apply a reading; the shared store is written only on a transition
    pub fn apply(&self, status: HealthStatus) -> Result<OutageTick> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("Outage state lock poisoned"))?;

        let tick = next_outage_state(state.is_outage, status, self.policy);
        let previous = state.last_status.replace(status);

        if !tick.changed {
            debug!(status = %status, previous = ?previous, is_outage = tick.is_outage, "Provider health unchanged");
            return Ok(tick);
        }

        if tick.is_outage {
            let sentinel = serde_json::to_string(&Sentinel {
                status,
                since: Utc::now(),
            })?;
            self.store.set(OUTAGE_SENTINEL_KEY, &sentinel)?;
            warn!(status = %status, "🔴 Provider outage started, settlement gated");
        } else {
            self.store.delete(OUTAGE_SENTINEL_KEY)?;
            info!(status = %status, "🟢 Provider outage cleared, settlement resumes");
        }
        state.is_outage = tick.is_outage;

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.log_outage_transition(tick.is_outage, status) {
                warn!("Failed to journal outage transition: {:#}", e);
            }
        }
        Ok(tick)
    }

    /// Poll until shutdown. A failed probe counts as an Unknown reading.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Outage monitor polling every {:?}", interval);

        loop {
            let applied = match self.tick().await {
                Ok(tick) => Ok(tick),
                Err(e) => {
                    warn!("{:#}; treating provider as unavailable", e);
                    self.apply(HealthStatus::Unknown)
                }
            };
            if let Err(e) = applied {
                warn!("Failed to record outage state: {:#}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Read side of the breaker, usable from any process sharing the store
#[derive(Clone)]
pub struct OutageGate {
    store: Arc<dyn SharedStore>,
}

impl OutageGate {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub fn is_outage(&self) -> Result<bool> {
        Ok(self.store.get(OUTAGE_SENTINEL_KEY)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::persistence::KeeperDatabase;
    use crate::test_support::{CountingStore, ScriptedProvider};
    use std::sync::atomic::Ordering;

    fn controller(
        health: Vec<Result<HealthStatus, String>>,
        store: Arc<CountingStore>,
        policy: OutagePolicy,
    ) -> OutageController {
        OutageController::new(Arc::new(ScriptedProvider::new(health)), store, policy).unwrap()
    }

    #[test]
    fn test_transition_rule() {
        let policy = OutagePolicy::default();

        let tick = next_outage_state(false, HealthStatus::Red, policy);
        assert!(tick.is_outage && tick.changed);

        let tick = next_outage_state(true, HealthStatus::Red, policy);
        assert!(tick.is_outage && !tick.changed);

        let tick = next_outage_state(true, HealthStatus::Yellow, policy);
        assert!(!tick.is_outage && tick.changed);

        let tick = next_outage_state(false, HealthStatus::Green, policy);
        assert!(!tick.is_outage && !tick.changed);
    }

    #[test]
    fn test_degraded_gates_when_configured() {
        let strict = OutagePolicy { gate_on_degraded: true };
        assert!(next_outage_state(false, HealthStatus::Yellow, strict).is_outage);
        assert!(next_outage_state(false, HealthStatus::Unknown, OutagePolicy::default()).is_outage);
    }

    #[tokio::test]
    async fn test_red_red_green_sequence() {
        let store = Arc::new(CountingStore::new(KeeperDatabase::in_memory().unwrap()));
        let health = vec![Ok(HealthStatus::Red), Ok(HealthStatus::Red), Ok(HealthStatus::Green)];
        let controller = controller(health, store.clone(), OutagePolicy::default());
        let gate = OutageGate::new(store.clone());

        let first = controller.tick().await.unwrap();
        assert!(first.changed && first.is_outage);
        assert!(gate.is_outage().unwrap());

        let second = controller.tick().await.unwrap();
        assert!(!second.changed && second.is_outage);

        let third = controller.tick().await.unwrap();
        assert!(third.changed && !third.is_outage);
        assert!(!gate.is_outage().unwrap());

        assert!(!controller.state().unwrap().is_outage);
        assert_eq!(controller.state().unwrap().last_status, Some(HealthStatus::Green));
    }

    #[tokio::test]
    async fn test_repeated_red_writes_once() {
        let store = Arc::new(CountingStore::new(KeeperDatabase::in_memory().unwrap()));
        let health = vec![Ok(HealthStatus::Red); 5];
        let controller = controller(health, store.clone(), OutagePolicy::default());

        let changed: Vec<bool> = {
            let mut out = Vec::new();
            for _ in 0..5 {
                out.push(controller.tick().await.unwrap().changed);
            }
            out
        };

        assert_eq!(changed, vec![true, false, false, false, false]);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_check_failure_surfaced_without_state_change() {
        let store = Arc::new(CountingStore::new(KeeperDatabase::in_memory().unwrap()));
        let controller = controller(vec![Err("connection refused".to_string())], store.clone(), OutagePolicy::default());

        assert!(controller.tick().await.is_err());
        assert!(!controller.state().unwrap().is_outage);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);

        // The monitor loop's conservative fallback
        let tick = controller.apply(HealthStatus::Unknown).unwrap();
        assert!(tick.changed && tick.is_outage);
    }

    #[tokio::test]
    async fn test_monitor_loop_gates_on_failed_health_check() {
        let store = Arc::new(CountingStore::new(KeeperDatabase::in_memory().unwrap()));
        let controller = Arc::new(controller(vec![Err("down".to_string())], store.clone(), OutagePolicy::default()));
        let gate = OutageGate::new(store.clone());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(controller.clone().run(Duration::from_secs(3600), rx));

        for _ in 0..200 {
            if gate.is_outage().unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gate.is_outage().unwrap());
        assert_eq!(controller.state().unwrap().last_status, Some(HealthStatus::Unknown));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_restart_picks_up_existing_outage() {
        let db = KeeperDatabase::in_memory().unwrap();
        db.set(OUTAGE_SENTINEL_KEY, r#"{"status":"red","since":"2026-02-17T00:00:00Z"}"#).unwrap();
        let store = Arc::new(CountingStore::new(db));

        let controller = controller(vec![], store.clone(), OutagePolicy::default());
        assert!(controller.state().unwrap().is_outage);

        let tick = controller.apply(HealthStatus::Red).unwrap();
        assert!(!tick.changed);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }
}
