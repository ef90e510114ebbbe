//! Prometheus metrics
//!
//! Registered lazily in the default registry. If registration fails the error
//! is logged once and every recorder becomes a no-op.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, CounterVec, Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};
use services_common::TickPrice;

pub(crate) struct Metrics {
    order_book_in_count: IntCounterVec,
    order_book_in_delay_ms: CounterVec,
    order_book_out_count: IntCounterVec,
    order_book_stale_count: IntCounterVec,
    quote_out_count: IntCounterVec,
    quote_out_side_price: GaugeVec,
    order_book_cache_size: IntGauge,
    forced_reconnect_count: IntCounter,
    handler_fault_count: IntCounter,
}

lazy_static::lazy_static! {
    pub(crate) static ref METRICS: Option<Metrics> = init_metrics_internal();
}

// Each registration failure disables the whole set
fn init_metrics_internal() -> Option<Metrics> {
    let order_book_in_count = match register_int_counter_vec!(
        "order_book_in_count",
        "Order books received from the provider",
        &["symbol"]
    ) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to create order_book_in_count metric: {}", e);
            return None;
        }
    };

    let order_book_in_delay_ms = match register_counter_vec!(
        "order_book_in_delay_ms",
        "Accumulated delay between provider timestamp and receipt",
        &["symbol"]
    ) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to create order_book_in_delay_ms metric: {}", e);
            return None;
        }
    };

    let order_book_out_count = match register_int_counter_vec!(
        "order_book_out_count",
        "Order books published downstream",
        &["symbol"]
    ) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to create order_book_out_count metric: {}", e);
            return None;
        }
    };

    let order_book_stale_count = match register_int_counter_vec!(
        "order_book_stale_count",
        "Order books discarded because they were not newer than the cached one",
        &["symbol"]
    ) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to create order_book_stale_count metric: {}", e);
            return None;
        }
    };

    let quote_out_count = match register_int_counter_vec!(
        "quote_out_count",
        "Tick prices published downstream",
        &["symbol"]
    ) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to create quote_out_count metric: {}", e);
            return None;
        }
    };

    let quote_out_side_price = match register_gauge_vec!(
        "quote_out_side_price",
        "Last published best price per side",
        &["symbol", "side"]
    ) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to create quote_out_side_price metric: {}", e);
            return None;
        }
    };

    let order_book_cache_size = match register_int_gauge!(
        "order_book_cache_size",
        "Instruments held in the order book cache"
    ) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to create order_book_cache_size metric: {}", e);
            return None;
        }
    };

    let forced_reconnect_count = match register_int_counter!(
        "forced_reconnect_count",
        "Reconnects forced by the supervisor"
    ) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to create forced_reconnect_count metric: {}", e);
            return None;
        }
    };

    let handler_fault_count = match register_int_counter!(
        "handler_fault_count",
        "Price handlers that failed or panicked"
    ) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to create handler_fault_count metric: {}", e);
            return None;
        }
    };

    Some(Metrics {
        order_book_in_count,
        order_book_in_delay_ms,
        order_book_out_count,
        order_book_stale_count,
        quote_out_count,
        quote_out_side_price,
        order_book_cache_size,
        forced_reconnect_count,
        handler_fault_count,
    })
}

pub fn record_order_book_in(symbol: &str, delay_ms: i64) {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.order_book_in_count.with_label_values(&[symbol]).inc();
        #[allow(clippy::cast_precision_loss)]
        let delay = delay_ms.max(0) as f64;
        metrics.order_book_in_delay_ms.with_label_values(&[symbol]).inc_by(delay);
    }
}

pub fn record_order_book_out(symbol: &str) {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.order_book_out_count.with_label_values(&[symbol]).inc();
    }
}

pub fn record_stale_order_book(symbol: &str) {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.order_book_stale_count.with_label_values(&[symbol]).inc();
    }
}

pub fn record_quote_out(tick_price: &TickPrice) {
    if let Some(metrics) = METRICS.as_ref() {
        let symbol = tick_price.asset.as_str();
        metrics.quote_out_count.with_label_values(&[symbol]).inc();
        if let Some(bid) = tick_price.bid {
            metrics.quote_out_side_price.with_label_values(&[symbol, "bid"]).set(bid);
        }
        if let Some(ask) = tick_price.ask {
            metrics.quote_out_side_price.with_label_values(&[symbol, "ask"]).set(ask);
        }
    }
}

pub fn set_cache_size(size: usize) {
    if let Some(metrics) = METRICS.as_ref() {
        metrics
            .order_book_cache_size
            .set(i64::try_from(size).unwrap_or(i64::MAX));
    }
}

pub fn record_forced_reconnect() {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.forced_reconnect_count.inc();
    }
}

pub fn record_handler_fault() {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.handler_fault_count.inc();
    }
}

/// Encode the default registry in the Prometheus text format
pub fn render() -> String {
    lazy_static::initialize(&METRICS);
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
