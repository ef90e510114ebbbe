//! Common constants used across the adapter services

/// Source tag stamped on every order book and tick price we publish
pub const DEFAULT_SOURCE: &str = "b2c2";

/// Suffix the provider appends to spot instruments (`BTCUSD.SPOT`)
pub const SPOT_SUFFIX: &str = ".SPOT";

/// Delay between catalog and connection retries
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;

// Buffer sizes
pub const DEFAULT_CHANNEL_SIZE: usize = 1000;
