//! Instrument catalog collaborator

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use services_common::ServiceError;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Default wait when a 429 carries no usable `Retry-After`
const DEFAULT_RETRY_AFTER_SECS: u64 = 1;
const DEFAULT_MAX_RETRIES: u32 = 3;
const HTTP_TIMEOUT_SECS: u64 = 30;

/// Catalog entry as returned by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Provider identifier, e.g. `BTCUSD.SPOT`
    pub name: String,
    #[serde(default)]
    pub underlier: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl Instrument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            underlier: None,
            kind: None,
        }
    }
}

/// Source of the tradable instrument list
///
/// Called once at startup (and retried by the caller until it succeeds).
#[async_trait]
pub trait InstrumentCatalog: Send + Sync {
    async fn fetch_instruments(&self) -> Result<Vec<Instrument>>;
}

/// Catalog fetched from the provider's REST API
#[derive(Clone)]
pub struct RestInstrumentCatalog {
    client: Client,
    base_url: String,
    authorization_token: String,
    max_retries: u32,
}

impl fmt::Debug for RestInstrumentCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestInstrumentCatalog")
            .field("base_url", &self.base_url)
            .field("authorization_token", &"<redacted>")
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl RestInstrumentCatalog {
    pub fn new(base_url: impl Into<String>, authorization_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            authorization_token: authorization_token.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Number of retries on `429 Too Many Requests`
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn instruments_url(&self) -> String {
        format!("{}/instruments/", self.base_url)
    }
}

fn retry_after(response: &reqwest::Response) -> Duration {
    let secs = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    Duration::from_secs(secs)
}

#[async_trait]
impl InstrumentCatalog for RestInstrumentCatalog {
    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let url = self.instruments_url();
        let mut retries = 0;

        loop {
            let response = self
                .client
                .get(&url)
                .header(AUTHORIZATION, format!("Token {}", self.authorization_token))
                .send()
                .await
                .map_err(|e| ServiceError::ConnectionFailed(e.to_string()))
                .with_context(|| format!("Failed to request {url}"))?;

            let status = response.status();
            if status.is_success() {
                let instruments: Vec<Instrument> = response
                    .json()
                    .await
                    .context("Failed to decode instrument catalog")?;
                info!(count = instruments.len(), "Fetched instrument catalog");
                return Ok(instruments);
            }

            if status == StatusCode::TOO_MANY_REQUESTS && retries < self.max_retries {
                let delay = retry_after(&response);
                retries += 1;
                warn!(?delay, attempt = retries, max = self.max_retries, "Catalog request throttled; retrying");
                sleep(delay).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status.as_u16(), body))
                .with_context(|| format!("Instrument catalog request failed with HTTP {status}"));
        }
    }
}
