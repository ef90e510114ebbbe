//! Order books service
//!
//! Resilience supervisor on top of the stream client. It resolves the
//! provider's instrument catalog, subscribes to the configured instruments,
//! keeps the latest order book per instrument and publishes every accepted
//! update. Three background tasks keep it healthy:
//! - watchdog: forces a full reconnect when the whole cache has gone stale or
//!   configured instruments have no active binding
//! - republish: periodically publishes the full cache again
//! - maintenance (optional): unconditional reconnect on a fixed interval
//!
//! A reconnect always disposes the current [`StreamClient`] and builds a new
//! one; the client is never reset in place.

use super::cache::{CacheUpdate, OrderBookCache};
use crate::config::{AdapterConfig, OrderBooksConfig, PublishingConfig};
use crate::instruments::{InstrumentCatalog, InstrumentMapping};
use crate::metrics;
use crate::publishers::{OrderBookPublisher, TickPricePublisher};
use crate::stream::{PriceHandler, PriceMessage, QuantityPrice, StreamClient, StreamError, StreamSettings};
use crate::transport::Connector;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use services_common::{OrderBook, OrderBookLevel, ServiceError, TickPrice, DEFAULT_SOURCE};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Build an order book from a provider price frame
///
/// The provider's `buy` levels are the prices it sells at, so they become our
/// asks; its `sell` levels become our bids.
pub fn order_book_from_price(message: &PriceMessage, instrument: &str) -> OrderBook {
    let to_levels = |levels: &[QuantityPrice]| {
        levels
            .iter()
            .map(|level| OrderBookLevel::new(level.price, level.quantity))
            .collect::<Vec<_>>()
    };

    OrderBook::new(
        DEFAULT_SOURCE,
        instrument,
        message.timestamp,
        to_levels(message.levels.sell.as_slice()),
        to_levels(message.levels.buy.as_slice()),
    )
}

/// External collaborators of the service
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub catalog: Arc<dyn InstrumentCatalog>,
    pub order_book_publisher: Arc<dyn OrderBookPublisher>,
    pub tick_price_publisher: Arc<dyn TickPricePublisher>,
}

/// Summary of one pass over the configured instruments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPass {
    pub subscribed: usize,
    /// Configured instruments missing from the catalog
    pub skipped: Vec<String>,
    pub failed: usize,
    /// Stopped early after too many consecutive failures
    pub aborted: bool,
    /// A failure reported the connection as gone
    pub connection_lost: bool,
}

/// What a reconnect request ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Completed(SubscriptionPass),
    /// Another reconnect was already running; nothing was done
    AlreadyInProgress,
}

/// Why the supervisor decided to reconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectReason {
    /// Every cached order book is older than the staleness threshold
    Stale,
    /// Configured instruments without an active binding
    MissingSubscriptions(Vec<String>),
    /// Periodic maintenance reconnect
    Maintenance,
}

impl fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale => f.write_str("all order books are stale"),
            Self::MissingSubscriptions(missing) => {
                write!(f, "missing subscriptions: {}", missing.join(", "))
            }
            Self::Maintenance => f.write_str("maintenance interval elapsed"),
        }
    }
}

struct CacheUpdateHandler {
    inner: Weak<Inner>,
    instrument: String,
}

#[async_trait]
impl PriceHandler for CacheUpdateHandler {
    async fn handle(&self, message: PriceMessage) -> anyhow::Result<()> {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_price(&self.instrument, &message).await;
        }
        Ok(())
    }
}

struct Inner {
    config: OrderBooksConfig,
    publishing: PublishingConfig,
    stream: StreamSettings,
    collaborators: Collaborators,
    mapping: RwLock<InstrumentMapping>,
    cache: OrderBookCache,
    client: RwLock<Option<Arc<StreamClient>>>,
    /// Held for the duration of a reconnect
    reconnect_lock: AsyncMutex<()>,
    reconnects: AtomicU64,
    /// Start of the current connection's grace period
    fresh_since: Mutex<Option<Instant>>,
}

impl Inner {
    fn current_client(&self) -> Option<Arc<StreamClient>> {
        self.client.read().clone()
    }

    fn new_client(&self) -> Arc<StreamClient> {
        Arc::new(StreamClient::new(
            self.stream.clone(),
            Arc::clone(&self.collaborators.connector),
        ))
    }

    async fn load_catalog(&self) -> InstrumentMapping {
        let delay = self.config.retry_delay();
        loop {
            match self.collaborators.catalog.fetch_instruments().await {
                Ok(instruments) => {
                    let mapping = InstrumentMapping::from_catalog(
                        instruments.iter().map(|instrument| instrument.name.as_str()),
                        &self.config.instrument_suffix,
                    );
                    info!(
                        catalog = instruments.len(),
                        mapped = mapping.len(),
                        suffix = %self.config.instrument_suffix,
                        "Instrument mapping built"
                    );
                    return mapping;
                }
                Err(e) => {
                    let permanent = e
                        .downcast_ref::<ServiceError>()
                        .is_some_and(|error| !error.is_transient());
                    if permanent {
                        error!(error = %format!("{e:#}"), ?delay, "Instrument catalog rejected the request; retrying");
                    } else {
                        warn!(error = %format!("{e:#}"), ?delay, "Failed to fetch instrument catalog; retrying");
                    }
                    sleep(delay).await;
                }
            }
        }
    }

    async fn handle_price(&self, instrument: &str, message: &PriceMessage) {
        let order_book = order_book_from_price(message, instrument);
        let delay_ms = (Utc::now() - order_book.timestamp).num_milliseconds();
        metrics::record_order_book_in(instrument, delay_ms);

        let update = self.cache.update(order_book.clone(), Instant::now());
        if !update.is_stored() {
            metrics::record_stale_order_book(instrument);
            debug!(%instrument, timestamp = %order_book.timestamp, "Discarding order book not newer than cached one");
            return;
        }
        if update == CacheUpdate::Inserted {
            info!(%instrument, "First order book received");
            metrics::set_cache_size(self.cache.len());
        }
        self.publish(&order_book).await;
    }

    async fn publish(&self, order_book: &OrderBook) {
        let instrument = order_book.asset_pair.as_str();

        if self.publishing.order_books_enabled {
            match self
                .collaborators
                .order_book_publisher
                .publish_order_book(order_book)
                .await
            {
                Ok(()) => metrics::record_order_book_out(instrument),
                Err(e) => warn!(%instrument, error = %e, "Failed to publish order book"),
            }
        }

        if self.publishing.tick_prices_enabled {
            let tick_price = TickPrice::from_order_book(order_book);
            match self
                .collaborators
                .tick_price_publisher
                .publish_tick_price(&tick_price)
                .await
            {
                Ok(()) => metrics::record_quote_out(&tick_price),
                Err(e) => warn!(%instrument, error = %e, "Failed to publish tick price"),
            }
        }

        self.cache.mark_published(instrument);
    }

    async fn republish_all(&self) {
        let mut count = 0;
        // Re-read each entry so a live update published meanwhile is never
        // followed by an older snapshot.
        for instrument in self.cache.instruments() {
            if let Some(order_book) = self.cache.get(&instrument) {
                self.publish(&order_book).await;
                count += 1;
            }
        }
        debug!(count, "Republished order book cache");
    }

    /// Subscribe to every configured instrument on `client`, in order
    async fn subscribe_all(self: &Arc<Self>, client: &StreamClient) -> SubscriptionPass {
        let mut pass = SubscriptionPass::default();
        let mut consecutive_failures = 0;
        let max_failures = self.config.max_consecutive_resubscribe_failures;

        for entry in &self.config.instruments {
            let raw = self.mapping.read().raw(&entry.instrument).map(str::to_owned);
            let Some(raw) = raw else {
                warn!(instrument = %entry.instrument, "Instrument not in provider catalog; skipping");
                pass.skipped.push(entry.instrument.clone());
                continue;
            };

            let handler = self.handler_for(&entry.instrument);
            match client.subscribe(&raw, &entry.levels, handler).await {
                Ok(()) => {
                    consecutive_failures = 0;
                    pass.subscribed += 1;
                }
                Err(e) if e.is_already_subscribed() => {
                    debug!(instrument = %entry.instrument, "Already subscribed; counting as success");
                    consecutive_failures = 0;
                    pass.subscribed += 1;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    pass.failed += 1;
                    pass.connection_lost |= e.is_connection_failure();
                    warn!(
                        instrument = %entry.instrument,
                        error = %e,
                        consecutive_failures,
                        "Subscription failed"
                    );
                    if consecutive_failures >= max_failures {
                        error!(
                            consecutive_failures,
                            "Too many consecutive subscription failures; aborting pass until next check"
                        );
                        pass.aborted = true;
                        break;
                    }
                }
            }
        }

        info!(
            subscribed = pass.subscribed,
            failed = pass.failed,
            skipped = pass.skipped.len(),
            aborted = pass.aborted,
            "Subscription pass finished"
        );
        pass
    }

    fn handler_for(self: &Arc<Self>, instrument: &str) -> Arc<dyn PriceHandler> {
        Arc::new(CacheUpdateHandler {
            inner: Arc::downgrade(self),
            instrument: instrument.to_owned(),
        })
    }

    /// Configured instruments (provider form) without an active binding
    fn missing_subscriptions(&self) -> Vec<String> {
        let active = self
            .current_client()
            .map(|client| client.active_instruments())
            .unwrap_or_default();
        let mapping = self.mapping.read();

        self.config
            .instruments
            .iter()
            .filter_map(|entry| mapping.raw(&entry.instrument))
            .filter(|raw| !active.iter().any(|bound| bound == raw))
            .map(str::to_owned)
            .collect()
    }

    fn reconnect_reason(&self) -> Option<ReconnectReason> {
        if self.cache.is_empty() {
            return None;
        }

        let fresh_since = *self.fresh_since.lock();
        if self
            .cache
            .is_stale(Instant::now(), self.config.staleness_threshold(), fresh_since)
        {
            return Some(ReconnectReason::Stale);
        }

        let missing = self.missing_subscriptions();
        if missing.is_empty() {
            None
        } else {
            Some(ReconnectReason::MissingSubscriptions(missing))
        }
    }

    async fn force_reconnect(self: &Arc<Self>, reason: &ReconnectReason) -> Result<ReconnectOutcome, StreamError> {
        let Ok(_running) = self.reconnect_lock.try_lock() else {
            info!(%reason, "Reconnect already in progress; skipping");
            return Ok(ReconnectOutcome::AlreadyInProgress);
        };

        let count = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_forced_reconnect();
        warn!(%reason, count, "Forcing reconnect");

        // Install the new client before tearing the old one down so explicit
        // subscriptions never observe an empty slot.
        let client = self.new_client();
        let resubscribing = client.begin_resubscription();
        let previous = self.client.write().replace(Arc::clone(&client));
        if let Some(previous) = previous {
            previous.disconnect().await;
        }

        client.connect().await?;
        *self.fresh_since.lock() = Some(Instant::now());

        let pass = self.subscribe_all(&client).await;
        drop(resubscribing);

        info!(count, subscribed = pass.subscribed, failed = pass.failed, "Reconnect completed");
        Ok(ReconnectOutcome::Completed(pass))
    }

    /// Store `client` unless a reconnect filled the slot first
    fn install_initial(&self, client: &Arc<StreamClient>) -> bool {
        let mut slot = self.client.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::clone(client));
        true
    }

    /// Empty the slot only while it still holds `client`
    fn release_if_current(&self, client: &Arc<StreamClient>) -> bool {
        let mut slot = self.client.write();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, client)) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Connect and subscribe, retrying until a pass completes on a live
    /// connection
    async fn connect_and_subscribe(self: &Arc<Self>) {
        let delay = self.config.retry_delay();
        loop {
            let client = self.new_client();
            match client.connect().await {
                Ok(()) => {
                    if !self.install_initial(&client) {
                        info!("Reconnect already installed a client; dropping the initial connection");
                        client.disconnect().await;
                        return;
                    }
                    *self.fresh_since.lock() = Some(Instant::now());

                    let pass = self.subscribe_all(&client).await;
                    if !pass.connection_lost {
                        return;
                    }
                    if !self.release_if_current(&client) {
                        info!("Initial connection replaced by a reconnect; leaving subscriptions to it");
                        return;
                    }
                    warn!(?delay, "Connection lost during initial subscription; reconnecting");
                    client.disconnect().await;
                }
                Err(e) => warn!(error = %e, ?delay, "Failed to connect to quote stream; retrying"),
            }
            sleep(delay).await;
        }
    }
}

async fn run_watchdog(inner: Arc<Inner>) {
    let period = inner.config.reconnect_check_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match inner.reconnect_reason() {
            None => {
                let age = inner.cache.youngest_age(Instant::now());
                debug!(?age, cached = inner.cache.len(), "Order book feed healthy");
            }
            Some(reason) => {
                if let Err(e) = inner.force_reconnect(&reason).await {
                    error!(error = %e, "Forced reconnect failed; retrying on next check");
                }
            }
        }
    }
}

async fn run_republish(inner: Arc<Inner>) {
    let period = inner.config.publish_from_cache_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        inner.republish_all().await;
    }
}

async fn run_maintenance(inner: Arc<Inner>, period: std::time::Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = inner.force_reconnect(&ReconnectReason::Maintenance).await {
            error!(error = %e, "Maintenance reconnect failed");
        }
    }
}

/// Order book cache and resilience supervisor
pub struct OrderBooksService {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for OrderBooksService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderBooksService")
            .field("instruments", &self.inner.config.instruments.len())
            .field("cached", &self.inner.cache.len())
            .field("reconnects", &self.reconnect_count())
            .field("running", &!self.tasks.lock().is_empty())
            .finish()
    }
}

impl OrderBooksService {
    #[must_use]
    pub fn new(config: &AdapterConfig, collaborators: Collaborators) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: config.order_books.clone(),
                publishing: config.publishing.clone(),
                stream: config.stream_settings(),
                collaborators,
                mapping: RwLock::new(InstrumentMapping::default()),
                cache: OrderBookCache::new(),
                client: RwLock::new(None),
                reconnect_lock: AsyncMutex::new(()),
                reconnects: AtomicU64::new(0),
                fresh_since: Mutex::new(None),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Resolve the catalog, subscribe and start the background tasks
    ///
    /// Catalog and connection failures are retried until they succeed.
    pub async fn start(&self) -> Result<()> {
        if !self.tasks.lock().is_empty() {
            bail!("Order books service already started");
        }

        let mapping = self.inner.load_catalog().await;
        *self.inner.mapping.write() = mapping;
        self.inner.connect_and_subscribe().await;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(run_watchdog(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(run_republish(Arc::clone(&self.inner))));
        if let Some(period) = self.inner.config.force_reconnect_interval() {
            tasks.push(tokio::spawn(run_maintenance(Arc::clone(&self.inner), period)));
        }
        info!(
            watchdog = ?self.inner.config.reconnect_check_interval(),
            staleness_threshold = ?self.inner.config.staleness_threshold(),
            republish = ?self.inner.config.publish_from_cache_interval(),
            "Order books service started"
        );
        Ok(())
    }

    /// Stop the background tasks and dispose the stream client
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let client = self.inner.client.write().take();
        if let Some(client) = client {
            client.disconnect().await;
        }
        info!("Order books service stopped");
    }

    /// Dispose the current client and resubscribe everything on a new one
    pub async fn force_reconnect(&self) -> Result<ReconnectOutcome, StreamError> {
        self.inner
            .force_reconnect(&ReconnectReason::Maintenance)
            .await
    }

    /// Reason the watchdog would reconnect right now, if any
    pub fn reconnect_reason(&self) -> Option<ReconnectReason> {
        self.inner.reconnect_reason()
    }

    /// Subscribe to one more instrument on the current client
    ///
    /// `levels` defaults to the configured levels of the instrument.
    pub async fn subscribe(&self, instrument: &str, levels: Option<&[f64]>) -> Result<(), StreamError> {
        let normalized = instrument.trim().to_uppercase();
        let raw = self
            .inner
            .mapping
            .read()
            .raw(&normalized)
            .map(str::to_owned)
            .ok_or_else(|| StreamError::InvalidRequest(format!("{normalized} is not a tradable instrument")))?;
        let levels = levels
            .or_else(|| self.inner.config.levels_for(&normalized))
            .map(<[f64]>::to_vec)
            .ok_or_else(|| StreamError::InvalidRequest(format!("no levels for {normalized}")))?;
        let client = self
            .inner
            .current_client()
            .ok_or_else(|| StreamError::Connection("service is not connected".to_owned()))?;

        client
            .subscribe(&raw, &levels, self.inner.handler_for(&normalized))
            .await
    }

    /// Unsubscribe from an instrument on the current client
    pub async fn unsubscribe(&self, instrument: &str) -> Result<(), StreamError> {
        let normalized = instrument.trim().to_uppercase();
        let raw = self
            .inner
            .mapping
            .read()
            .raw(&normalized)
            .map(str::to_owned)
            .ok_or_else(|| StreamError::NotSubscribed(normalized.clone()))?;
        let client = self
            .inner
            .current_client()
            .ok_or_else(|| StreamError::NotSubscribed(normalized.clone()))?;

        client.unsubscribe(&raw).await
    }

    /// Known normalized instruments, sorted
    pub fn get_all_instruments(&self) -> Vec<String> {
        self.inner.mapping.read().normalized_instruments()
    }

    /// Cached order book of an instrument
    pub fn get_order_book(&self, instrument: &str) -> Option<OrderBook> {
        self.inner.cache.get(&instrument.trim().to_uppercase())
    }

    /// Tick price of every cached order book
    pub fn get_all_tick_prices(&self) -> Vec<TickPrice> {
        self.inner.cache.tick_prices()
    }

    pub fn get_all_order_books(&self) -> Vec<OrderBook> {
        self.inner.cache.order_books()
    }

    /// Times the instrument was published, diagnostics only
    pub fn publish_count(&self, instrument: &str) -> Option<u64> {
        self.inner.cache.publish_count(&instrument.trim().to_uppercase())
    }

    pub fn current_client(&self) -> Option<Arc<StreamClient>> {
        self.inner.current_client()
    }

    /// Reconnects forced so far
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }
}

impl Drop for OrderBooksService {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
