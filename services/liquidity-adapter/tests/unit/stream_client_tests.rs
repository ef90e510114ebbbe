//! Stream client protocol tests against the scripted provider

use crate::common::{ack_for, price_frame, settle, stream_settings, Reply, ScriptedProvider, TEST_REQUEST_TIMEOUT};
use liquidity_adapter::stream::{handler_fn, ConnectionState, ErrorCode, PriceHandler, PriceMessage};
use liquidity_adapter::{StreamClient, StreamError};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rstest::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const BTC: &str = "BTCUSD.SPOT";
const ETH: &str = "ETHUSD.SPOT";

fn client(provider: &ScriptedProvider) -> Arc<StreamClient> {
    Arc::new(StreamClient::new(stream_settings(), provider.connector()))
}

/// Handler recording every message it receives
fn recorder() -> (Arc<dyn PriceHandler>, Arc<Mutex<Vec<PriceMessage>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let handler = handler_fn(move |message| {
        sink.lock().push(message);
        Ok(())
    });
    (handler, received)
}

fn noop() -> Arc<dyn PriceHandler> {
    handler_fn(|_| Ok(()))
}

#[fixture]
fn provider() -> ScriptedProvider {
    ScriptedProvider::new(Reply::Success)
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_subscribe_connects_lazily_and_binds(provider: ScriptedProvider) {
    let client = client(&provider);
    assert_eq!(client.state(), ConnectionState::Unconnected);

    client.subscribe(BTC, &[1.0, 5.0], noop()).await.unwrap();

    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(provider.connect_count(), 1);
    assert!(client.is_subscribed(BTC));
    assert_eq!(client.subscribed_levels(BTC), Some(vec![1.0, 5.0]));
    assert_eq!(client.pending_requests(), 0);

    let sent = provider.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["event"], "subscribe");
    assert_eq!(sent[0]["levels"], serde_json::json!([1.0, 5.0]));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_prices_reach_the_bound_handler(provider: ScriptedProvider) {
    let client = client(&provider);
    let (handler, received) = recorder();
    client.subscribe(BTC, &[1.0], handler).await.unwrap();

    provider.push(price_frame(BTC, 1_000, 100.0, 101.0));
    provider.push(price_frame(ETH, 1_000, 10.0, 11.0));
    settle().await;

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].instrument, BTC);
    assert_eq!(received[0].levels.buy[0].price, 101.0);
    assert_eq!(received[0].levels.sell[0].price, 100.0);
    assert!(client.last_price_at().is_some());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_rejected_subscription_reports_provider_code(provider: ScriptedProvider) {
    provider.reply_for(BTC, Reply::Error(3003));
    let client = client(&provider);

    let error = client.subscribe(BTC, &[1.0], noop()).await.unwrap_err();

    assert_eq!(error.provider_code(), Some(ErrorCode::INSTRUMENT_IS_NOT_ALLOWED));
    assert!(!client.is_subscribed(BTC));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_clears_pending_and_ignores_late_ack() {
    let provider = ScriptedProvider::new(Reply::Silent);
    let mut sent = provider.take_sent();
    let client = client(&provider);

    let error = client.subscribe(BTC, &[1.0], noop()).await.unwrap_err();
    match error {
        StreamError::SubscriptionTimeout { instrument, timeout } => {
            assert_eq!(instrument, BTC);
            assert_eq!(timeout, TEST_REQUEST_TIMEOUT);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(client.pending_requests(), 0);

    let request = sent.recv().await.unwrap();
    provider.push(ack_for(&request, None));
    settle().await;

    assert!(!client.is_subscribed(BTC));
    assert!(client.is_open());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_duplicate_subscription_is_rejected_locally(provider: ScriptedProvider) {
    let client = client(&provider);
    client.subscribe(BTC, &[1.0], noop()).await.unwrap();

    let error = client.subscribe(BTC, &[1.0], noop()).await.unwrap_err();

    assert!(matches!(error, StreamError::AlreadySubscribed(ref instrument) if instrument == BTC));
    assert!(error.is_already_subscribed());
    assert_eq!(provider.sent_count("subscribe", BTC), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_resubscription_tolerates_duplicates(provider: ScriptedProvider) {
    let client = client(&provider);
    client.subscribe(BTC, &[1.0], noop()).await.unwrap();

    provider.reply_for(BTC, Reply::Error(3007));
    let guard = client.begin_resubscription();
    assert!(client.is_resubscribing());
    client.subscribe(BTC, &[1.0], noop()).await.unwrap();
    drop(guard);

    assert!(!client.is_resubscribing());
    assert!(client.is_subscribed(BTC));
    assert_eq!(provider.sent_count("subscribe", BTC), 2);

    let error = client.subscribe(BTC, &[1.0], noop()).await.unwrap_err();
    assert!(matches!(error, StreamError::AlreadySubscribed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_subscriptions_during_resubscription() {
    let provider = ScriptedProvider::new(Reply::Silent);
    let mut sent = provider.take_sent();
    let client = client(&provider);
    client.connect().await.unwrap();

    let _guard = client.begin_resubscription();
    let answer = async {
        let first = sent.recv().await.unwrap();
        let second = sent.recv().await.unwrap();
        assert_ne!(first["tag"], second["tag"]);
        provider.push(ack_for(&first, None));
        provider.push(ack_for(&second, Some(3007)));
    };

    let (resubscribed, explicit, ()) = tokio::join!(
        client.subscribe(BTC, &[1.0], noop()),
        client.subscribe(BTC, &[1.0], noop()),
        answer,
    );

    resubscribed.unwrap();
    explicit.unwrap();
    assert!(client.is_subscribed(BTC));
    assert_eq!(client.pending_requests(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_unsubscribe_without_binding_sends_nothing(provider: ScriptedProvider) {
    let client = client(&provider);
    client.connect().await.unwrap();

    let error = client.unsubscribe(ETH).await.unwrap_err();

    assert!(matches!(error, StreamError::NotSubscribed(ref instrument) if instrument == ETH));
    assert!(provider.sent().is_empty());
}

#[rstest]
#[case::acknowledged(Reply::Success)]
#[case::provider_already_forgot(Reply::Error(3008))]
#[tokio::test(start_paused = true)]
async fn test_unsubscribe_drops_binding(provider: ScriptedProvider, #[case] reply: Reply) {
    let client = client(&provider);
    let (handler, received) = recorder();
    client.subscribe(BTC, &[1.0], handler).await.unwrap();

    provider.reply_for(BTC, reply);
    client.unsubscribe(BTC).await.unwrap();

    assert!(!client.is_subscribed(BTC));
    provider.push(price_frame(BTC, 1_000, 100.0, 101.0));
    settle().await;
    assert!(received.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_unsubscribe_while_in_flight_is_rejected() {
    let provider = ScriptedProvider::new(Reply::Success);
    let client = client(&provider);
    client.subscribe(BTC, &[1.0], noop()).await.unwrap();
    provider.reply_for(BTC, Reply::Silent);

    let first = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.unsubscribe(BTC).await }
    });
    settle().await;

    let error = client.unsubscribe(BTC).await.unwrap_err();
    assert!(matches!(error, StreamError::UnsubscriptionInFlight(_)));

    client.disconnect().await;
    assert!(matches!(first.await.unwrap(), Err(StreamError::Cancelled)));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_malformed_frames_do_not_stop_the_loop(provider: ScriptedProvider) {
    let client = client(&provider);
    let (handler, received) = recorder();
    client.subscribe(BTC, &[1.0], handler).await.unwrap();

    provider.push("not json");
    provider.push("[1, 2, 3]");
    provider.push(r#"{"no_event": true}"#);
    provider.push(r#"{"event": "price", "success": true, "instrument": "BTCUSD.SPOT"}"#);
    provider.push(r#"{"event": "price", "success": false, "error_code": 3013}"#);
    provider.push(r#"{"event": "heartbeat"}"#);
    provider.push(price_frame(BTC, 2_000, 100.0, 101.0));
    settle().await;

    assert_eq!(received.lock().len(), 1);
    assert!(client.is_open());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_handler_faults_are_contained(provider: ScriptedProvider) {
    let client = client(&provider);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let handler = handler_fn(move |_| match seen.fetch_add(1, Ordering::SeqCst) {
        0 => panic!("handler blew up"),
        1 => Err(anyhow::anyhow!("handler failed")),
        _ => Ok(()),
    });
    client.subscribe(BTC, &[1.0], handler).await.unwrap();

    for timestamp in [1_000, 2_000, 3_000] {
        provider.push(price_frame(BTC, timestamp, 100.0, 101.0));
    }
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(client.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_requests() {
    let provider = ScriptedProvider::new(Reply::Silent);
    let mut sent = provider.take_sent();
    let client = client(&provider);

    let pending = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.subscribe(BTC, &[1.0], noop()).await }
    });
    sent.recv().await.unwrap();

    client.disconnect().await;

    assert!(matches!(pending.await.unwrap(), Err(StreamError::Cancelled)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.pending_requests(), 0);
    client.disconnect().await;

    let error = client.subscribe(ETH, &[1.0], noop()).await.unwrap_err();
    assert!(error.is_connection_failure());
}

#[tokio::test(start_paused = true)]
async fn test_provider_close_fails_pending_requests() {
    let provider = ScriptedProvider::new(Reply::Silent);
    let mut sent = provider.take_sent();
    let client = client(&provider);

    let pending = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.subscribe(BTC, &[1.0], noop()).await }
    });
    sent.recv().await.unwrap();

    provider.close_latest();
    let result = pending.await.unwrap();

    assert!(matches!(result, Err(StreamError::Connection(_))));
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_connection_failure_leaves_client_reusable() {
    let provider = ScriptedProvider::new(Reply::Success);
    provider.fail_next_connects(1);
    let client = client(&provider);

    let error = client.connect().await.unwrap_err();
    assert!(error.is_connection_failure());
    assert_eq!(client.state(), ConnectionState::Unconnected);

    client.connect().await.unwrap();
    client.connect().await.unwrap();
    assert_eq!(provider.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tradable_instruments_are_recorded() {
    let provider = ScriptedProvider::with_tradable(Reply::Success, vec![BTC.to_owned(), ETH.to_owned()]);
    let client = client(&provider);
    client.connect().await.unwrap();
    settle().await;

    assert_eq!(client.tradable_instruments(), vec![BTC.to_owned(), ETH.to_owned()]);
}

#[rstest]
#[case::empty_instrument(" ", &[1.0][..])]
#[case::no_levels(BTC, &[][..])]
#[tokio::test(start_paused = true)]
async fn test_invalid_requests_send_nothing(
    provider: ScriptedProvider,
    #[case] instrument: &str,
    #[case] levels: &[f64],
) {
    let client = client(&provider);

    let error = client.subscribe(instrument, levels, noop()).await.unwrap_err();

    assert!(matches!(error, StreamError::InvalidRequest(_)));
    assert_eq!(provider.connect_count(), 0);
}
