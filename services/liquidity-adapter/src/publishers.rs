//! Downstream publishers
//!
//! The supervisor hands every stored order book and its tick price to these
//! collaborators. Delivery is fire-and-forget: a failure is logged by the
//! caller and never stops the feed.

use async_trait::async_trait;
use services_common::{OrderBook, ServiceError, TickPrice};
use tokio::sync::broadcast;
use tracing::trace;

/// Receives finished order books
#[async_trait]
pub trait OrderBookPublisher: Send + Sync {
    async fn publish_order_book(&self, order_book: &OrderBook) -> Result<(), ServiceError>;
}

/// Receives tick prices derived from order books
#[async_trait]
pub trait TickPricePublisher: Send + Sync {
    async fn publish_tick_price(&self, tick_price: &TickPrice) -> Result<(), ServiceError>;
}

/// In-process fan-out over tokio broadcast channels
///
/// Having no subscriber is not an error; the message is simply dropped.
/// Slow subscribers lag and skip messages rather than blocking the feed.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    order_books: broadcast::Sender<OrderBook>,
    tick_prices: broadcast::Sender<TickPrice>,
}

impl BroadcastPublisher {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (order_books, _) = broadcast::channel(capacity.max(1));
        let (tick_prices, _) = broadcast::channel(capacity.max(1));
        Self {
            order_books,
            tick_prices,
        }
    }

    pub fn subscribe_order_books(&self) -> broadcast::Receiver<OrderBook> {
        self.order_books.subscribe()
    }

    pub fn subscribe_tick_prices(&self) -> broadcast::Receiver<TickPrice> {
        self.tick_prices.subscribe()
    }
}

#[async_trait]
impl OrderBookPublisher for BroadcastPublisher {
    async fn publish_order_book(&self, order_book: &OrderBook) -> Result<(), ServiceError> {
        if self.order_books.send(order_book.clone()).is_err() {
            trace!(instrument = %order_book.asset_pair, "No order book subscribers");
        }
        Ok(())
    }
}

#[async_trait]
impl TickPricePublisher for BroadcastPublisher {
    async fn publish_tick_price(&self, tick_price: &TickPrice) -> Result<(), ServiceError> {
        if self.tick_prices.send(tick_price.clone()).is_err() {
            trace!(instrument = %tick_price.asset, "No tick price subscribers");
        }
        Ok(())
    }
}
