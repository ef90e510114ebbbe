//! Tick price (top of book) derived from an order book

use super::orderbook::OrderBook;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Best bid / best ask summary of an order book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickPrice {
    /// Source tag (liquidity provider name)
    pub source: String,
    /// Normalized instrument
    pub asset: String,
    /// Timestamp of the order book this was derived from
    pub timestamp: DateTime<Utc>,
    /// Best bid price, if the bid side is not empty
    pub bid: Option<f64>,
    /// Best ask price, if the ask side is not empty
    pub ask: Option<f64>,
}

impl TickPrice {
    /// Derive the tick price of an order book
    #[must_use]
    pub fn from_order_book(order_book: &OrderBook) -> Self {
        Self {
            source: order_book.source.clone(),
            asset: order_book.asset_pair.clone(),
            timestamp: order_book.timestamp,
            bid: order_book.best_bid().map(|level| level.price),
            ask: order_book.best_ask().map(|level| level.price),
        }
    }

    /// Spread when both sides are quoted
    #[must_use]
    pub fn spread(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }
}

impl From<&OrderBook> for TickPrice {
    fn from(order_book: &OrderBook) -> Self {
        Self::from_order_book(order_book)
    }
}
