//! Order books supervisor end to end against the scripted provider
//!
//! All tests run with paused time, so watchdog and republish timers fire
//! exactly when the clock is advanced past them.

use crate::common::{adapter_config, price_frame, settle, Reply, ScriptedProvider, StaticCatalog};
use async_trait::async_trait;
use liquidity_adapter::config::AdapterConfig;
use liquidity_adapter::orderbook::{Collaborators, ReconnectOutcome, ReconnectReason};
use liquidity_adapter::{BroadcastPublisher, OrderBookPublisher, OrderBooksService};
use parking_lot::Mutex;
use services_common::{OrderBook, ServiceError};
use pretty_assertions::assert_eq;
use rstest::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const CATALOG: &[&str] = &["BTCUSD.SPOT", "ETHUSD.SPOT", "BTCUSD.CFD", "LTCUSD.SPOT"];

struct Harness {
    provider: ScriptedProvider,
    catalog: Arc<StaticCatalog>,
    publisher: Arc<BroadcastPublisher>,
    service: OrderBooksService,
}

impl Harness {
    fn new(config: &AdapterConfig, provider: ScriptedProvider, catalog: Arc<StaticCatalog>) -> Self {
        let publisher = Arc::new(BroadcastPublisher::new(64));
        let service = OrderBooksService::new(
            config,
            Collaborators {
                connector: provider.connector(),
                catalog: catalog.clone(),
                order_book_publisher: publisher.clone(),
                tick_price_publisher: publisher.clone(),
            },
        );
        Self {
            provider,
            catalog,
            publisher,
            service,
        }
    }

    async fn started(config: &AdapterConfig) -> Self {
        let harness = Self::new(config, ScriptedProvider::new(Reply::Success), StaticCatalog::new(CATALOG));
        harness.service.start().await.unwrap();
        harness
    }
}

#[fixture]
fn config() -> AdapterConfig {
    adapter_config(&["BTCUSD", "ETHUSD"])
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_start_subscribes_configured_instruments(config: AdapterConfig) {
    let harness = Harness::started(&config).await;

    assert_eq!(harness.provider.connect_count(), 1);
    assert_eq!(harness.provider.sent_count("subscribe", "BTCUSD.SPOT"), 1);
    assert_eq!(harness.provider.sent_count("subscribe", "ETHUSD.SPOT"), 1);
    assert_eq!(
        harness.service.get_all_instruments(),
        vec!["BTCUSD".to_owned(), "ETHUSD".to_owned(), "LTCUSD".to_owned()]
    );

    let client = harness.service.current_client().unwrap();
    assert_eq!(client.active_instruments(), vec!["BTCUSD.SPOT".to_owned(), "ETHUSD.SPOT".to_owned()]);
    assert_eq!(harness.service.reconnect_reason(), None);
    assert!(harness.service.start().await.is_err());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_prices_are_cached_and_published(config: AdapterConfig) {
    let harness = Harness::started(&config).await;
    let mut order_books = harness.publisher.subscribe_order_books();
    let mut tick_prices = harness.publisher.subscribe_tick_prices();

    harness.provider.push(price_frame("BTCUSD.SPOT", 1_000, 100.0, 101.0));
    settle().await;

    let book = harness.service.get_order_book(" btcusd ").unwrap();
    assert_eq!(book.asset_pair, "BTCUSD");
    assert_eq!(book.source, "b2c2");
    assert_eq!(book.best_bid().map(|level| level.price), Some(100.0));
    assert_eq!(book.best_ask().map(|level| level.price), Some(101.0));

    assert_eq!(order_books.recv().await.unwrap(), book);
    let tick = tick_prices.recv().await.unwrap();
    assert_eq!((tick.asset.as_str(), tick.bid, tick.ask), ("BTCUSD", Some(100.0), Some(101.0)));

    let ticks = harness.service.get_all_tick_prices();
    assert_eq!(ticks.len(), 1);
    assert_eq!(harness.service.publish_count("BTCUSD"), Some(1));
    assert!(harness.service.get_order_book("ETHUSD").is_none());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_out_of_order_price_is_discarded(config: AdapterConfig) {
    let harness = Harness::started(&config).await;

    harness.provider.push(price_frame("BTCUSD.SPOT", 2_000, 100.0, 101.0));
    harness.provider.push(price_frame("BTCUSD.SPOT", 1_000, 90.0, 95.0));
    harness.provider.push(price_frame("BTCUSD.SPOT", 2_000, 80.0, 85.0));
    settle().await;

    let book = harness.service.get_order_book("BTCUSD").unwrap();
    assert_eq!(book.timestamp.timestamp_millis(), 2_000);
    assert_eq!(book.best_bid().map(|level| level.price), Some(100.0));
    assert_eq!(book.best_ask().map(|level| level.price), Some(101.0));
    assert_eq!(harness.service.publish_count("BTCUSD"), Some(1));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_cache_is_republished_periodically(config: AdapterConfig) {
    let harness = Harness::started(&config).await;
    harness.provider.push(price_frame("BTCUSD.SPOT", 1_000, 100.0, 101.0));
    settle().await;
    assert_eq!(harness.service.publish_count("BTCUSD"), Some(1));

    sleep(Duration::from_millis(5_100)).await;
    assert_eq!(harness.service.publish_count("BTCUSD"), Some(2));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.service.publish_count("BTCUSD"), Some(4));
}

/// Takes 100 ms per order book and records instrument and timestamp
#[derive(Default)]
struct SlowRecorder {
    published: Mutex<Vec<(String, i64)>>,
}

impl SlowRecorder {
    fn timestamps(&self, instrument: &str) -> Vec<i64> {
        self.published
            .lock()
            .iter()
            .filter(|(published, _)| published == instrument)
            .map(|(_, timestamp)| *timestamp)
            .collect()
    }
}

#[async_trait]
impl OrderBookPublisher for SlowRecorder {
    async fn publish_order_book(&self, order_book: &OrderBook) -> Result<(), ServiceError> {
        self.published
            .lock()
            .push((order_book.asset_pair.clone(), order_book.timestamp.timestamp_millis()));
        sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_republish_never_regresses_a_live_update(config: AdapterConfig) {
    let provider = ScriptedProvider::new(Reply::Success);
    let recorder = Arc::new(SlowRecorder::default());
    let service = OrderBooksService::new(
        &config,
        Collaborators {
            connector: provider.connector(),
            catalog: StaticCatalog::new(CATALOG),
            order_book_publisher: recorder.clone(),
            tick_price_publisher: Arc::new(BroadcastPublisher::new(16)),
        },
    );
    service.start().await.unwrap();
    provider.push(price_frame("BTCUSD.SPOT", 1_000, 100.0, 101.0));
    provider.push(price_frame("ETHUSD.SPOT", 1_000, 10.0, 11.0));
    settle().await;

    // The republish at 5 s is still publishing BTCUSD when ETHUSD moves.
    sleep(Duration::from_millis(5_050)).await;
    provider.push(price_frame("ETHUSD.SPOT", 2_000, 12.0, 13.0));
    sleep(Duration::from_millis(300)).await;

    assert_eq!(recorder.timestamps("ETHUSD"), vec![1_000, 2_000, 2_000]);
    assert_eq!(recorder.timestamps("BTCUSD"), vec![1_000, 1_000]);
}

/// Pushes one price per instrument half a second before the first watchdog
/// check, so the second check sees 30.5 s of silence
async fn cache_before_first_check(harness: &Harness) {
    sleep(Duration::from_millis(29_500)).await;
    harness.provider.push(price_frame("BTCUSD.SPOT", 1_000, 100.0, 101.0));
    harness.provider.push(price_frame("ETHUSD.SPOT", 1_000, 10.0, 11.0));
    settle().await;
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_silent_feed_triggers_one_reconnect(config: AdapterConfig) {
    let harness = Harness::started(&config).await;
    cache_before_first_check(&harness).await;
    let first_client = harness.service.current_client().unwrap();

    sleep(Duration::from_secs(31)).await;

    assert_eq!(harness.service.reconnect_count(), 1);
    assert_eq!(harness.provider.connect_count(), 2);
    assert_eq!(harness.provider.sent_count("subscribe", "BTCUSD.SPOT"), 2);
    assert_eq!(harness.provider.sent_count("subscribe", "ETHUSD.SPOT"), 2);

    let second_client = harness.service.current_client().unwrap();
    assert!(!Arc::ptr_eq(&first_client, &second_client));
    assert!(!first_client.is_open());
    assert!(second_client.is_open());
    assert!(!second_client.is_resubscribing());
    assert_eq!(
        second_client.active_instruments(),
        vec!["BTCUSD.SPOT".to_owned(), "ETHUSD.SPOT".to_owned()]
    );

    // The new connection gets a full threshold before it is judged.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.service.reconnect_count(), 1);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.service.reconnect_count(), 2);
    assert_eq!(harness.provider.sent_count("subscribe", "BTCUSD.SPOT"), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_age_equal_to_threshold_is_not_stale(config: AdapterConfig) {
    let harness = Harness::started(&config).await;
    harness.provider.push(price_frame("BTCUSD.SPOT", 1_000, 100.0, 101.0));
    settle().await;

    sleep(Duration::from_secs(31)).await;

    assert_eq!(harness.service.reconnect_count(), 0);
    assert_eq!(harness.provider.connect_count(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_explicit_subscribe_during_reconnect(config: AdapterConfig) {
    let harness = Harness::started(&config).await;
    cache_before_first_check(&harness).await;
    harness.provider.reply_for("ETHUSD.SPOT", Reply::Silent);

    // The reconnect pass is now waiting for the ETHUSD ack.
    sleep(Duration::from_secs(31)).await;
    assert_eq!(harness.service.reconnect_count(), 1);
    let client = harness.service.current_client().unwrap();
    assert!(client.is_resubscribing());
    assert!(client.is_subscribed("BTCUSD.SPOT"));

    harness.service.subscribe("BTCUSD", None).await.unwrap();
    assert_eq!(harness.provider.sent_count("subscribe", "BTCUSD.SPOT"), 3);

    sleep(Duration::from_secs(10)).await;
    assert!(!client.is_resubscribing());
    assert!(!client.is_subscribed("ETHUSD.SPOT"));
    assert_eq!(harness.service.reconnect_count(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_explicit_subscribe_while_old_connection_closes(config: AdapterConfig) {
    let harness = Harness::started(&config).await;
    harness.provider.slow_close(Duration::from_millis(900));

    let (reconnect, explicit) = tokio::join!(harness.service.force_reconnect(), async {
        sleep(Duration::from_millis(100)).await;
        harness.service.subscribe("LTCUSD", Some(&[1.0][..])).await
    });

    explicit.unwrap();
    let ReconnectOutcome::Completed(pass) = reconnect.unwrap() else {
        panic!("reconnect was skipped");
    };
    assert_eq!(pass.subscribed, 2);
    assert_eq!(pass.failed, 0);
    assert_eq!(harness.provider.connect_count(), 2);

    let client = harness.service.current_client().unwrap();
    assert_eq!(
        client.active_instruments(),
        vec!["BTCUSD.SPOT", "ETHUSD.SPOT", "LTCUSD.SPOT"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_during_startup_keeps_its_client() {
    let config = adapter_config(&["BTCUSD", "ETHUSD", "LTCUSD"]);
    let harness = Harness::new(&config, ScriptedProvider::new(Reply::Success), StaticCatalog::new(CATALOG));
    harness.provider.reply_for("ETHUSD.SPOT", Reply::Silent);

    // Startup is waiting for the ETHUSD ack when the reconnect replaces its client.
    let (started, reconnect) = tokio::join!(harness.service.start(), async {
        sleep(Duration::from_secs(1)).await;
        harness.service.force_reconnect().await
    });

    started.unwrap();
    let ReconnectOutcome::Completed(pass) = reconnect.unwrap() else {
        panic!("reconnect was skipped");
    };
    assert_eq!(pass.subscribed, 2);
    assert_eq!(pass.failed, 1);
    assert!(!pass.connection_lost);
    assert_eq!(harness.provider.connect_count(), 2);
    assert_eq!(harness.service.reconnect_count(), 1);

    let client = harness.service.current_client().unwrap();
    assert!(client.is_open());
    assert_eq!(client.active_instruments(), vec!["BTCUSD.SPOT", "LTCUSD.SPOT"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_fresh_prices_keep_the_connection(config: AdapterConfig) {
    let harness = Harness::started(&config).await;

    for second in 0..120_i64 {
        harness
            .provider
            .push(price_frame("BTCUSD.SPOT", (second + 1) * 1_000, 100.0, 101.0));
        sleep(Duration::from_secs(1)).await;
    }

    assert_eq!(harness.service.reconnect_count(), 0);
    assert_eq!(harness.provider.connect_count(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_empty_cache_never_triggers_reconnect(config: AdapterConfig) {
    let harness = Harness::started(&config).await;

    sleep(Duration::from_secs(300)).await;

    assert_eq!(harness.service.reconnect_reason(), None);
    assert_eq!(harness.service.reconnect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_instrument_is_reported_missing() {
    let config = adapter_config(&["BTCUSD", "ETHUSD"]);
    let provider = ScriptedProvider::new(Reply::Success);
    provider.reply_for("ETHUSD.SPOT", Reply::Error(3003));
    let harness = Harness::new(&config, provider, StaticCatalog::new(CATALOG));
    harness.service.start().await.unwrap();

    harness.provider.push(price_frame("BTCUSD.SPOT", 1_000, 100.0, 101.0));
    settle().await;

    assert_eq!(
        harness.service.reconnect_reason(),
        Some(ReconnectReason::MissingSubscriptions(vec!["ETHUSD.SPOT".to_owned()]))
    );

    harness.provider.reply_for("ETHUSD.SPOT", Reply::Success);
    sleep(Duration::from_secs(30)).await;

    assert_eq!(harness.service.reconnect_count(), 1);
    assert_eq!(harness.service.reconnect_reason(), None);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_instrument_is_skipped() {
    let config = adapter_config(&["BTCUSD", "DOGEUSD"]);
    let harness = Harness::started(&config).await;
    harness.provider.push(price_frame("BTCUSD.SPOT", 1_000, 100.0, 101.0));
    settle().await;

    assert_eq!(harness.provider.sent().len(), 1);
    assert_eq!(harness.service.reconnect_reason(), None);
    assert!(!harness.service.get_all_instruments().contains(&"DOGEUSD".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn test_start_retries_catalog_and_connection() {
    let config = adapter_config(&["BTCUSD"]);
    let provider = ScriptedProvider::new(Reply::Success);
    provider.fail_next_connects(2);
    let harness = Harness::new(&config, provider, StaticCatalog::failing(CATALOG, 2));

    harness.service.start().await.unwrap();

    assert_eq!(harness.catalog.calls(), 3);
    assert_eq!(harness.provider.connect_count(), 1);
    assert!(harness.service.current_client().unwrap().is_subscribed("BTCUSD.SPOT"));
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_failures_abort_the_pass() {
    let mut config = adapter_config(&["BTCUSD", "ETHUSD", "LTCUSD"]);
    config.order_books.max_consecutive_resubscribe_failures = 2;
    let provider = ScriptedProvider::new(Reply::Error(3016));
    let harness = Harness::new(&config, provider, StaticCatalog::new(CATALOG));
    harness.service.start().await.unwrap();

    let outcome = harness.service.force_reconnect().await.unwrap();

    match outcome {
        ReconnectOutcome::Completed(pass) => {
            assert_eq!(pass.subscribed, 0);
            assert_eq!(pass.failed, 2);
            assert!(pass.aborted);
            assert!(!pass.connection_lost);
        }
        other => panic!("expected a completed pass, got {other:?}"),
    }
    assert_eq!(harness.provider.sent_count("subscribe", "LTCUSD.SPOT"), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_explicit_subscribe_and_unsubscribe(config: AdapterConfig) {
    let harness = Harness::started(&config).await;

    harness.service.subscribe("ltcusd", Some(&[2.0][..])).await.unwrap();
    let client = harness.service.current_client().unwrap();
    assert_eq!(client.subscribed_levels("LTCUSD.SPOT"), Some(vec![2.0]));

    harness.provider.push(price_frame("LTCUSD.SPOT", 1_000, 50.0, 51.0));
    settle().await;
    assert!(harness.service.get_order_book("LTCUSD").is_some());

    harness.service.unsubscribe("LTCUSD").await.unwrap();
    assert!(!client.is_subscribed("LTCUSD.SPOT"));

    let error = harness.service.subscribe("XRPUSD", Some(&[1.0][..])).await.unwrap_err();
    assert!(matches!(error, liquidity_adapter::StreamError::InvalidRequest(_)));
    let error = harness.service.subscribe("LTCUSD", None).await.unwrap_err();
    assert!(matches!(error, liquidity_adapter::StreamError::InvalidRequest(_)));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_concurrent_reconnect_is_skipped(config: AdapterConfig) {
    let harness = Harness::started(&config).await;
    harness.provider.reply_for("BTCUSD.SPOT", Reply::Silent);

    let (first, second) = tokio::join!(harness.service.force_reconnect(), harness.service.force_reconnect());

    assert!(matches!(first.unwrap(), ReconnectOutcome::Completed(_)));
    assert_eq!(second.unwrap(), ReconnectOutcome::AlreadyInProgress);
    assert_eq!(harness.service.reconnect_count(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_stop_disposes_client(config: AdapterConfig) {
    let harness = Harness::started(&config).await;
    let client = harness.service.current_client().unwrap();

    harness.service.stop().await;

    assert!(harness.service.current_client().is_none());
    assert!(!client.is_open());
    assert!(client.active_instruments().is_empty());
}
