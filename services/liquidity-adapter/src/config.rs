//! Configuration for the liquidity adapter
//!
//! Loaded once at startup from a file plus `LIQUIDITY_ADAPTER__*` environment
//! overrides (e.g. `LIQUIDITY_ADAPTER__PROVIDER__AUTHORIZATION_TOKEN`), then
//! normalized and validated before anything is started.

use crate::stream::StreamSettings;
use serde::{Deserialize, Serialize};
use services_common::{DEFAULT_CHANNEL_SIZE, DEFAULT_RETRY_DELAY_MS, SPOT_SUFFIX};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "LIQUIDITY_ADAPTER";

/// Most depth levels the provider accepts per subscription
pub const MAX_LEVELS_PER_INSTRUMENT: usize = 2;

/// Path of the quote stream below the stream base URL
const QUOTES_PATH: &str = "quotes";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or deserialized
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Values were read but break a validation rule
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Liquidity adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Provider endpoints and credential
    pub provider: ProviderConfig,
    /// Stream client tuning
    #[serde(default)]
    pub stream: StreamConfig,
    /// Subscriptions and supervisor timers
    pub order_books: OrderBooksConfig,
    /// Downstream publishing
    #[serde(default)]
    pub publishing: PublishingConfig,
}

/// Provider endpoints
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// REST base URL, e.g. `https://api.uat.b2c2.net`
    pub rest_url: String,
    /// WebSocket base URL, e.g. `wss://socket.uat.b2c2.net`
    pub stream_url: String,
    pub authorization_token: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("rest_url", &self.rest_url)
            .field("stream_url", &self.stream_url)
            .field("authorization_token", &"<redacted>")
            .finish()
    }
}

impl ProviderConfig {
    /// Full URL of the quote stream
    #[must_use]
    pub fn quotes_url(&self) -> String {
        format!("{}/{}", self.stream_url, QUOTES_PATH)
    }
}

/// Stream client tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Wait for a tagged subscribe / unsubscribe response
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Depth levels requested for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentLevels {
    /// Normalized instrument, e.g. `BTCUSD`
    pub instrument: String,
    /// Quantity thresholds
    pub levels: Vec<f64>,
}

impl InstrumentLevels {
    pub fn new(instrument: impl Into<String>, levels: Vec<f64>) -> Self {
        Self {
            instrument: instrument.into(),
            levels,
        }
    }
}

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBooksConfig {
    /// Instruments to subscribe to, in subscription order
    pub instruments: Vec<InstrumentLevels>,
    /// Suffix of the provider instruments that get mapped
    #[serde(default = "default_instrument_suffix")]
    pub instrument_suffix: String,
    /// Staleness watchdog tick
    #[serde(default = "default_reconnect_check_interval_secs")]
    pub reconnect_check_interval_secs: u64,
    /// Age beyond which the whole cache counts as stale
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,
    /// Full cache republish tick
    #[serde(default = "default_publish_from_cache_interval_secs")]
    pub publish_from_cache_interval_secs: u64,
    /// Unconditional maintenance reconnect, disabled when absent
    #[serde(default)]
    pub force_reconnect_interval_secs: Option<u64>,
    /// Consecutive failures after which a subscription pass gives up
    #[serde(default = "default_max_consecutive_resubscribe_failures")]
    pub max_consecutive_resubscribe_failures: u32,
    /// Delay between catalog fetch or connection attempts at startup
    #[serde(default = "default_catalog_retry_delay_ms")]
    pub catalog_retry_delay_ms: u64,
}

impl OrderBooksConfig {
    /// Defaults for everything except the instrument list
    pub fn with_instruments(instruments: Vec<InstrumentLevels>) -> Self {
        Self {
            instruments,
            instrument_suffix: default_instrument_suffix(),
            reconnect_check_interval_secs: default_reconnect_check_interval_secs(),
            staleness_threshold_secs: default_staleness_threshold_secs(),
            publish_from_cache_interval_secs: default_publish_from_cache_interval_secs(),
            force_reconnect_interval_secs: None,
            max_consecutive_resubscribe_failures: default_max_consecutive_resubscribe_failures(),
            catalog_retry_delay_ms: default_catalog_retry_delay_ms(),
        }
    }

    /// Period of the staleness watchdog
    pub const fn reconnect_check_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_check_interval_secs)
    }

    /// Age above which an order book counts as stale
    pub const fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    /// Period of the full cache republish
    pub const fn publish_from_cache_interval(&self) -> Duration {
        Duration::from_secs(self.publish_from_cache_interval_secs)
    }

    /// Period of the maintenance reconnect, disabled when unset
    pub fn force_reconnect_interval(&self) -> Option<Duration> {
        self.force_reconnect_interval_secs.map(Duration::from_secs)
    }

    /// Pause between catalog and connection attempts
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.catalog_retry_delay_ms)
    }

    /// Configured levels for a normalized instrument (case-insensitive)
    pub fn levels_for(&self, instrument: &str) -> Option<&[f64]> {
        self.instruments
            .iter()
            .find(|entry| entry.instrument.eq_ignore_ascii_case(instrument.trim()))
            .map(|entry| entry.levels.as_slice())
    }
}

/// Downstream publishing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishingConfig {
    /// Publish every stored order book
    #[serde(default = "default_true")]
    pub order_books_enabled: bool,
    /// Publish the tick price derived from every stored order book
    #[serde(default = "default_true")]
    pub tick_prices_enabled: bool,
    /// Capacity of the broadcast channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            order_books_enabled: true,
            tick_prices_enabled: true,
            channel_capacity: default_channel_capacity(),
        }
    }
}

const fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_instrument_suffix() -> String {
    SPOT_SUFFIX.to_owned()
}

const fn default_reconnect_check_interval_secs() -> u64 {
    30
}

const fn default_staleness_threshold_secs() -> u64 {
    30
}

const fn default_publish_from_cache_interval_secs() -> u64 {
    5
}

const fn default_max_consecutive_resubscribe_failures() -> u32 {
    3
}

const fn default_catalog_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

const fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_SIZE
}

const fn default_true() -> bool {
    true
}

fn check_url(field: &str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let parsed = Url::parse(value)
        .map_err(|e| ConfigError::Invalid(format!("{field} is not a valid URL ({value:?}): {e}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigError::Invalid(format!(
            "{field} must use one of {schemes:?}, got {}",
            parsed.scheme()
        )));
    }
    Ok(())
}

impl AdapterConfig {
    /// Load configuration from file and environment
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.prepared()
    }

    /// Normalize and validate
    pub fn prepared(mut self) -> Result<Self, ConfigError> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Strip trailing slashes from URLs and upper-case instrument names
    pub fn normalize(&mut self) {
        self.provider.rest_url = self.provider.rest_url.trim().trim_end_matches('/').to_owned();
        self.provider.stream_url = self.provider.stream_url.trim().trim_end_matches('/').to_owned();
        for entry in &mut self.order_books.instruments {
            entry.instrument = entry.instrument.trim().to_uppercase();
        }
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        check_url("provider.rest_url", &self.provider.rest_url, &["http", "https"])?;
        check_url("provider.stream_url", &self.provider.stream_url, &["ws", "wss"])?;
        if self.provider.authorization_token.trim().is_empty() {
            return invalid("provider.authorization_token is empty".to_owned());
        }
        if self.stream.request_timeout_ms == 0 {
            return invalid("stream.request_timeout_ms must be positive".to_owned());
        }

        let books = &self.order_books;
        if books.instruments.is_empty() {
            return invalid("order_books.instruments is empty".to_owned());
        }
        for entry in &books.instruments {
            if entry.instrument.trim().is_empty() {
                return invalid("order_books.instruments contains an empty instrument".to_owned());
            }
            if entry.levels.is_empty() {
                return invalid(format!("{} has no levels", entry.instrument));
            }
            if entry.levels.len() > MAX_LEVELS_PER_INSTRUMENT {
                return invalid(format!(
                    "{} has {} levels, at most {} are allowed",
                    entry.instrument,
                    entry.levels.len(),
                    MAX_LEVELS_PER_INSTRUMENT
                ));
            }
            if entry.levels.iter().any(|level| !level.is_finite() || *level <= 0.0) {
                return invalid(format!("{} has a non-positive level", entry.instrument));
            }
            let duplicates = books
                .instruments
                .iter()
                .filter(|other| other.instrument.eq_ignore_ascii_case(&entry.instrument))
                .count();
            if duplicates > 1 {
                return invalid(format!("{} is configured more than once", entry.instrument));
            }
        }

        if books.reconnect_check_interval_secs == 0 {
            return invalid("order_books.reconnect_check_interval_secs must be positive".to_owned());
        }
        if books.staleness_threshold_secs == 0 {
            return invalid("order_books.staleness_threshold_secs must be positive".to_owned());
        }
        if books.publish_from_cache_interval_secs == 0 {
            return invalid("order_books.publish_from_cache_interval_secs must be positive".to_owned());
        }
        if books.force_reconnect_interval_secs == Some(0) {
            return invalid("order_books.force_reconnect_interval_secs must be positive".to_owned());
        }
        if books.max_consecutive_resubscribe_failures == 0 {
            return invalid("order_books.max_consecutive_resubscribe_failures must be positive".to_owned());
        }
        if self.publishing.channel_capacity == 0 {
            return invalid("publishing.channel_capacity must be positive".to_owned());
        }

        Ok(())
    }

    /// Settings for stream clients built from this configuration
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            url: self.provider.quotes_url(),
            authorization_token: self.provider.authorization_token.clone(),
            request_timeout: Duration::from_millis(self.stream.request_timeout_ms),
        }
    }
}
