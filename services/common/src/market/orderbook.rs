//! Order book types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Aggregated price level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    /// Price
    pub price: f64,
    /// Quantity available at this price
    pub volume: f64,
}

impl OrderBookLevel {
    /// Create a new level
    #[must_use]
    pub const fn new(price: f64, volume: f64) -> Self {
        Self { price, volume }
    }
}

/// Snapshot of a provider's book for one instrument
///
/// Order books are immutable once built: a newer snapshot replaces an older
/// one, it never patches it. Bids are kept in descending price order and asks
/// in ascending price order so that the first level of each side is the best.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBook {
    /// Source tag (liquidity provider name)
    pub source: String,
    /// Normalized instrument, e.g. `BTCUSD`
    pub asset_pair: String,
    /// Provider-asserted timestamp
    pub timestamp: DateTime<Utc>,
    /// Bid levels, best first
    pub bids: Vec<OrderBookLevel>,
    /// Ask levels, best first
    pub asks: Vec<OrderBookLevel>,
}

impl OrderBook {
    /// Build an order book, sorting both sides best-first
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        asset_pair: impl Into<String>,
        timestamp: DateTime<Utc>,
        mut bids: Vec<OrderBookLevel>,
        mut asks: Vec<OrderBookLevel>,
    ) -> Self {
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal));

        Self {
            source: source.into(),
            asset_pair: asset_pair.into(),
            timestamp,
            bids,
            asks,
        }
    }

    /// Best (highest) bid
    #[must_use]
    pub fn best_bid(&self) -> Option<OrderBookLevel> {
        self.bids.first().copied()
    }

    /// Best (lowest) ask
    #[must_use]
    pub fn best_ask(&self) -> Option<OrderBookLevel> {
        self.asks.first().copied()
    }

    /// Mid price when both sides are present
    #[must_use]
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / 2.0),
            _ => None,
        }
    }

    /// Strictly newer than `other` by provider timestamp
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.timestamp > other.timestamp
    }

    /// Both sides empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}
