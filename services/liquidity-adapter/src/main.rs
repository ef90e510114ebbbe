//! Liquidity Adapter Service
//!
//! Streams provider quotes into the order book cache and publishes order
//! books and tick prices until interrupted.

use anyhow::{Context, Result};
use liquidity_adapter::orderbook::Collaborators;
use liquidity_adapter::{AdapterConfig, BroadcastPublisher, OrderBooksService, RestInstrumentCatalog, WsConnector};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable naming the configuration file
const CONFIG_PATH_ENV: &str = "LIQUIDITY_ADAPTER_CONFIG";

/// Configuration file used when none is given
const DEFAULT_CONFIG_PATH: &str = "config/adapter";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "liquidity_adapter=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
    let config = AdapterConfig::from_file(&path)
        .with_context(|| format!("Failed to load configuration from {path}"))?;

    info!(
        config = %path,
        instruments = config.order_books.instruments.len(),
        stream = %config.provider.quotes_url(),
        "Starting Liquidity Adapter Service"
    );

    let catalog = RestInstrumentCatalog::new(&config.provider.rest_url, &config.provider.authorization_token)
        .context("Failed to build instrument catalog client")?;
    let publisher = Arc::new(BroadcastPublisher::new(config.publishing.channel_capacity));
    spawn_publication_log(&publisher);

    let service = OrderBooksService::new(
        &config,
        Collaborators {
            connector: Arc::new(WsConnector::new()),
            catalog: Arc::new(catalog),
            order_book_publisher: publisher.clone(),
            tick_price_publisher: publisher,
        },
    );

    tokio::select! {
        result = service.start() => {
            result.context("Failed to start order books service")?;
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
        }
    }

    info!("Shutdown signal received");
    service.stop().await;
    info!(reconnects = service.reconnect_count(), "Liquidity Adapter Service stopped");
    Ok(())
}

/// Log tick prices leaving the adapter at debug level
fn spawn_publication_log(publisher: &BroadcastPublisher) {
    let mut tick_prices = publisher.subscribe_tick_prices();
    tokio::spawn(async move {
        while let Ok(tick_price) = tick_prices.recv().await {
            debug!(
                asset = %tick_price.asset,
                bid = ?tick_price.bid,
                ask = ?tick_price.ask,
                "Tick price published"
            );
        }
    });
}
