use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use crate::data::types::{HealthStatus, Observation};

/// Upstream weather/oracle provider
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Probe the provider's health endpoint
    async fn health_check(&self) -> Result<HealthStatus>;

    /// Fetch an attested observation for a city at a timestamp
    async fn fetch_observation(&self, city: &str, at: DateTime<Utc>) -> Result<Observation>;
}

pub struct OracleClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ObservationResponse {
    city: String,
    observed_at: DateTime<Utc>,
    #[serde(default)]
    temperature_c: Option<f64>,
    proof: String,
}

impl OracleClient {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("MarketKeeper/1.0")
            .build()
            .context("Failed to build oracle HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl WeatherProvider for OracleClient {
    async fn health_check(&self) -> Result<HealthStatus> {
        let url = format!("{}/health", self.base_url);

        let response: HealthResponse = self
            .get(&url)
            .send()
            .await
            .context("Health probe request failed")?
            .error_for_status()
            .context("Health probe returned error status")?
            .json()
            .await
            .context("Failed to parse health response")?;

        parse_health_status(&response.status)
    }

    async fn fetch_observation(&self, city: &str, at: DateTime<Utc>) -> Result<Observation> {
        let url = format!("{}/observations", self.base_url);

        let response: ObservationResponse = self
            .get(&url)
            .query(&[("city", city.to_string()), ("timestamp", at.timestamp().to_string())])
            .send()
            .await
            .with_context(|| format!("Observation request failed for {}", city))?
            .error_for_status()
            .with_context(|| format!("Observation service rejected request for {}", city))?
            .json()
            .await
            .context("Failed to parse observation response")?;

        if !response.city.eq_ignore_ascii_case(city) {
            anyhow::bail!(
                "Observation city mismatch: requested {}, got {}",
                city,
                response.city
            );
        }

        Ok(Observation {
            city: response.city,
            observed_at: response.observed_at,
            temperature_c: response.temperature_c,
            proof: response.proof,
        })
    }
}

/// Map the provider's color string to a status. Unrecognized colors are an error.
pub fn parse_health_status(raw: &str) -> Result<HealthStatus> {
    match raw.trim().to_lowercase().as_str() {
        "green" => Ok(HealthStatus::Green),
        "yellow" | "amber" => Ok(HealthStatus::Yellow),
        "red" => Ok(HealthStatus::Red),
        other => anyhow::bail!("Unrecognized health status: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_health_status() {
        assert_eq!(parse_health_status("green").unwrap(), HealthStatus::Green);
        assert_eq!(parse_health_status(" RED ").unwrap(), HealthStatus::Red);
        assert_eq!(parse_health_status("amber").unwrap(), HealthStatus::Yellow);
        assert!(parse_health_status("purple").is_err());
    }

    #[test]
    fn test_observation_response_allows_missing_temperature() {
        let json = r#"{"city":"London","observed_at":"2026-02-17T18:00:00Z","proof":"0xdead"}"#;
        let parsed: ObservationResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.temperature_c.is_none());
        assert_eq!(parsed.proof, "0xdead");
    }
}
