use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use crate::data::types::{HealthStatus, Observation};
use crate::data::weather::WeatherProvider;
use crate::execution::persistence::{KeeperDatabase, SharedStore};

/// Provider returning queued health readings and a fixed observation
pub struct ScriptedProvider {
    health: Mutex<VecDeque<Result<HealthStatus, String>>>,
    pub observation_calls: AtomicUsize,
    pub temperature_c: Mutex<Option<Option<f64>>>,
}

impl ScriptedProvider {
    pub fn new(health: Vec<Result<HealthStatus, String>>) -> Self {
        Self {
            health: Mutex::new(health.into()),
            observation_calls: AtomicUsize::new(0),
            temperature_c: Mutex::new(Some(Some(14.2))),
        }
    }

    /// `None` makes observation fetches fail
    pub fn set_observation(&self, temperature_c: Option<Option<f64>>) {
        *self.temperature_c.lock().unwrap() = temperature_c;
    }
}

#[async_trait]
impl WeatherProvider for ScriptedProvider {
    async fn health_check(&self) -> Result<HealthStatus> {
        match self.health.lock().unwrap().pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Ok(HealthStatus::Green),
        }
    }

    async fn fetch_observation(&self, city: &str, at: DateTime<Utc>) -> Result<Observation> {
        self.observation_calls.fetch_add(1, Ordering::SeqCst);
        match *self.temperature_c.lock().unwrap() {
            Some(temperature_c) => Ok(Observation {
                city: city.to_string(),
                observed_at: at,
                temperature_c,
                proof: "0xbeef".to_string(),
            }),
            None => anyhow::bail!("proof service timeout"),
        }
    }
}

/// Store wrapper counting writes
pub struct CountingStore {
    inner: KeeperDatabase,
    pub writes: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: KeeperDatabase) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
        }
    }
}

impl SharedStore for CountingStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key)
    }
}
