//! Latest order book per instrument
//!
//! Entries are replaced, never patched. A replacement is accepted only when
//! its provider timestamp is strictly newer than the cached one, so a late or
//! duplicated frame can never regress what gets published. The compare and
//! the swap happen under one write lock.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use services_common::{OrderBook, TickPrice};
use std::collections::hash_map::Entry;
use std::time::Duration;
use tokio::time::Instant;

/// Result of offering an order book to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// First order book for the instrument
    Inserted,
    /// Newer than the cached one
    Replaced,
    /// Not newer than the cached one; discarded
    Stale,
}

impl CacheUpdate {
    /// The order book was kept and should be published
    pub const fn is_stored(self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    order_book: OrderBook,
    /// Local receipt time, drives staleness
    received_at: Instant,
    /// Times this instrument was published, diagnostics only
    publish_count: u64,
}

/// Order books keyed by normalized instrument
#[derive(Debug, Default)]
pub struct OrderBookCache {
    entries: RwLock<FxHashMap<String, CacheEntry>>,
}

impl OrderBookCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `order_book` if it is the first or a strictly newer one
    pub fn update(&self, order_book: OrderBook, received_at: Instant) -> CacheUpdate {
        let mut entries = self.entries.write();
        match entries.entry(order_book.asset_pair.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    order_book,
                    received_at,
                    publish_count: 0,
                });
                CacheUpdate::Inserted
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if order_book.is_newer_than(&entry.order_book) {
                    entry.order_book = order_book;
                    entry.received_at = received_at;
                    CacheUpdate::Replaced
                } else {
                    CacheUpdate::Stale
                }
            }
        }
    }

    /// Bump the publish counter; returns the new value
    pub fn mark_published(&self, instrument: &str) -> Option<u64> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(instrument)?;
        entry.publish_count += 1;
        Some(entry.publish_count)
    }

    pub fn publish_count(&self, instrument: &str) -> Option<u64> {
        self.entries.read().get(instrument).map(|entry| entry.publish_count)
    }

    pub fn get(&self, instrument: &str) -> Option<OrderBook> {
        self.entries
            .read()
            .get(instrument)
            .map(|entry| entry.order_book.clone())
    }

    /// Snapshot of every cached order book, sorted by instrument
    pub fn order_books(&self) -> Vec<OrderBook> {
        let mut books: Vec<OrderBook> = self
            .entries
            .read()
            .values()
            .map(|entry| entry.order_book.clone())
            .collect();
        books.sort_by(|a, b| a.asset_pair.cmp(&b.asset_pair));
        books
    }

    /// Tick price of every cached order book, sorted by instrument
    pub fn tick_prices(&self) -> Vec<TickPrice> {
        self.order_books().iter().map(TickPrice::from_order_book).collect()
    }

    pub fn instruments(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self.entries.read().keys().cloned().collect();
        instruments.sort();
        instruments
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// True when the cache is non-empty and every entry is older than
    /// `threshold`
    ///
    /// Ages are measured from the later of the entry's receipt time and
    /// `fresh_since`, which lets a new connection have a full threshold
    /// before it is judged.
    pub fn is_stale(&self, now: Instant, threshold: Duration, fresh_since: Option<Instant>) -> bool {
        let entries = self.entries.read();
        !entries.is_empty()
            && entries.values().all(|entry| {
                let reference = fresh_since.map_or(entry.received_at, |since| since.max(entry.received_at));
                now.saturating_duration_since(reference) > threshold
            })
    }

    /// Age of the most recently received entry
    pub fn youngest_age(&self, now: Instant) -> Option<Duration> {
        self.entries
            .read()
            .values()
            .map(|entry| now.saturating_duration_since(entry.received_at))
            .min()
    }
}
