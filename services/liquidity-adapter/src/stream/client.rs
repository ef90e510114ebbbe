//! Subscription protocol engine
//!
//! [`StreamClient`] turns one duplex text-frame connection into a
//! tag-correlated subscribe / unsubscribe / price-push protocol:
//! - every request carries a fresh UUID tag and a oneshot completion that the
//!   read loop resolves when the matching ack arrives
//! - callers await their own completion, bounded by the request timeout, so
//!   waiting never blocks the read loop
//! - frames are written through a tokio mutex, one complete frame at a time
//! - a single spawned read loop owns the receive half and is the only place
//!   handlers run
//!
//! The client never reconnects by itself. Once the connection is gone the
//! owner disposes it and builds a new one.

use super::error::StreamError;
use super::handler::PriceHandler;
use super::messages::{parse_frame, Ack, ErrorCode, InboundEvent, PriceMessage, Request};
use super::session::{ConnectionState, Resolved, Session};
use crate::metrics;
use crate::transport::{Connector, FrameSink, FrameStream};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on waiting for the write half while closing
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest frame excerpt written to the log
const LOGGED_FRAME_LEN: usize = 256;

/// Connection settings of one stream client
#[derive(Clone)]
pub struct StreamSettings {
    /// Full WebSocket endpoint, e.g. `wss://socket.example.com/quotes`
    pub url: String,
    /// Credential sent in the handshake `Authorization` header
    pub authorization_token: String,
    /// How long a subscribe / unsubscribe waits for its tagged response
    pub request_timeout: Duration,
}

impl fmt::Debug for StreamSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSettings")
            .field("url", &self.url)
            .field("authorization_token", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe => f.write_str("subscribe"),
            Self::Unsubscribe => f.write_str("unsubscribe"),
        }
    }
}

struct Shared {
    settings: StreamSettings,
    connector: Arc<dyn Connector>,
    session: Mutex<Session>,
    /// Write half; the lock also serializes connection attempts
    sink: AsyncMutex<Option<Box<dyn FrameSink>>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.session.lock().state
    }

    async fn send(&self, frame: String) -> Result<(), StreamError> {
        let mut sink = self.sink.lock().await;
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(StreamError::Connection(format!("connection is {state:?}")));
        }
        let Some(sink) = sink.as_mut() else {
            return Err(StreamError::Connection("connection is not open".to_owned()));
        };
        sink.send_text(frame).await.map_err(StreamError::from)
    }

    fn fail_pending(&self, error: impl Fn() -> StreamError) {
        let completions = self.session.lock().drain_pending();
        for completion in completions {
            let _ = completion.send(Err(error()));
        }
    }

    async fn dispatch(&self, text: &str) {
        let event = match parse_frame(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, frame = %excerpt(text), "Dropping malformed frame");
                return;
            }
        };

        match event {
            InboundEvent::TradableInstruments(instruments) => {
                info!(count = instruments.len(), "Tradable instruments received");
                self.session.lock().set_tradable_instruments(instruments);
            }
            InboundEvent::SubscribeAck(ack) => {
                let resolved = self.session.lock().complete_subscription(&ack);
                resolve(resolved, &ack, RequestKind::Subscribe);
            }
            InboundEvent::UnsubscribeAck(ack) => {
                let resolved = self.session.lock().complete_unsubscription(&ack);
                resolve(resolved, &ack, RequestKind::Unsubscribe);
            }
            InboundEvent::Price(message) => self.deliver(message).await,
            InboundEvent::PriceRejected { instrument, error } => {
                if error.code == ErrorCode::NOT_ABLE_TO_QUOTE_AT_THE_MOMENT {
                    info!(instrument = ?instrument, code = %error.code, "Provider cannot quote at the moment");
                } else {
                    warn!(instrument = ?instrument, code = %error.code, message = %error.message, "Price error from provider");
                }
            }
            InboundEvent::Unknown(event) => debug!(%event, "Ignoring unknown event"),
        }
    }

    async fn deliver(&self, message: PriceMessage) {
        let handler = {
            let mut session = self.session.lock();
            session.last_price_at = Some(Utc::now());
            session.handler_for(&message.instrument)
        };

        let Some(handler) = handler else {
            debug!(instrument = %message.instrument, "No handler bound for price; dropping");
            return;
        };

        let instrument = message.instrument.clone();
        match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                metrics::record_handler_fault();
                warn!(%instrument, error = %e, "Price handler failed");
            }
            Err(_) => {
                metrics::record_handler_fault();
                error!(%instrument, "Price handler panicked");
            }
        }
    }
}

fn resolve(resolved: Option<Resolved>, ack: &Ack, kind: RequestKind) {
    let Some(Resolved {
        instrument,
        completion,
        result,
    }) = resolved
    else {
        debug!(tag = ?ack.tag, instrument = ?ack.instrument, "No pending {} request for ack; ignoring", kind);
        return;
    };

    debug!(%instrument, tag = ?ack.tag, success = result.is_ok(), "{} acknowledged", kind);
    if completion.send(result).is_err() {
        debug!(%instrument, "Caller stopped waiting for {} response", kind);
    }
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(LOGGED_FRAME_LEN) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

async fn read_loop(shared: Arc<Shared>, mut stream: Box<dyn FrameStream>) {
    loop {
        match stream.next_text().await {
            Some(Ok(text)) => shared.dispatch(&text).await,
            Some(Err(e)) => {
                warn!(error = %e, "Quote stream receive failed");
                break;
            }
            None => {
                info!("Quote stream closed by provider");
                break;
            }
        }
    }

    {
        let mut session = shared.session.lock();
        if session.state == ConnectionState::Open {
            session.state = ConnectionState::Closed;
        }
    }
    shared.fail_pending(|| StreamError::Connection("connection closed".to_owned()));
}

/// Guard returned by [`StreamClient::begin_resubscription`]
///
/// While at least one guard is alive duplicate subscription checks are
/// suspended and `3007 already subscribed` acks count as success.
pub struct ResubscriptionGuard {
    shared: Arc<Shared>,
}

impl Drop for ResubscriptionGuard {
    fn drop(&mut self) {
        self.shared.session.lock().leave_resubscription();
    }
}

/// Streaming subscription client
pub struct StreamClient {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("settings", &self.shared.settings)
            .field("session", &*self.shared.session.lock())
            .finish()
    }
}

impl StreamClient {
    /// Create an unconnected client
    #[must_use]
    pub fn new(settings: StreamSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                connector,
                session: Mutex::new(Session::default()),
                sink: AsyncMutex::new(None),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Open the connection and start the read loop
    ///
    /// Calling it on an open client is a no-op. A disposed client cannot be
    /// reconnected.
    pub async fn connect(&self) -> Result<(), StreamError> {
        let mut sink = self.shared.sink.lock().await;

        let current = {
            let mut session = self.shared.session.lock();
            let current = session.state;
            if current == ConnectionState::Unconnected {
                session.state = ConnectionState::Connecting;
            }
            current
        };
        match current {
            ConnectionState::Unconnected => {}
            ConnectionState::Open => return Ok(()),
            state => {
                return Err(StreamError::Connection(format!("cannot connect while {state:?}")));
            }
        }

        let settings = &self.shared.settings;
        info!(url = %settings.url, "Connecting to quote stream");
        let (mut frame_sink, frame_stream) = match self
            .shared
            .connector
            .connect(&settings.url, &settings.authorization_token)
            .await
        {
            Ok(halves) => halves,
            Err(e) => {
                {
                    let mut session = self.shared.session.lock();
                    if session.state == ConnectionState::Connecting {
                        session.state = ConnectionState::Unconnected;
                    }
                }
                error!(url = %settings.url, error = %e, "Quote stream connection failed");
                return Err(StreamError::Connection(e.to_string()));
            }
        };

        let opened = {
            let mut session = self.shared.session.lock();
            if session.state == ConnectionState::Connecting {
                session.state = ConnectionState::Open;
                true
            } else {
                false
            }
        };
        if !opened {
            let _ = timeout(CLOSE_TIMEOUT, frame_sink.close()).await;
            return Err(StreamError::Connection("client disposed while connecting".to_owned()));
        }

        *sink = Some(frame_sink);
        let handle = tokio::spawn(read_loop(Arc::clone(&self.shared), frame_stream));
        *self.reader.lock() = Some(handle);
        info!(url = %settings.url, "Quote stream connected");
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), StreamError> {
        match self.shared.state() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Unconnected | ConnectionState::Connecting => self.connect().await,
            state => Err(StreamError::Connection(format!("connection is {state:?}"))),
        }
    }

    /// Subscribe to `instrument` at the given depth levels
    ///
    /// Connects first if needed. Resolves once the provider acknowledges the
    /// tagged request; `handler` is bound only after a successful ack.
    pub async fn subscribe(
        &self,
        instrument: &str,
        levels: &[f64],
        handler: Arc<dyn PriceHandler>,
    ) -> Result<(), StreamError> {
        if instrument.trim().is_empty() {
            return Err(StreamError::InvalidRequest("instrument is empty".to_owned()));
        }
        if levels.is_empty() {
            return Err(StreamError::InvalidRequest(format!("no levels given for {instrument}")));
        }
        self.ensure_connected().await?;

        let tag = Uuid::new_v4().to_string();
        let frame = Request::Subscribe {
            instrument: instrument.to_owned(),
            levels: levels.to_vec(),
            tag: tag.clone(),
        }
        .to_frame()?;

        let (tx, rx) = oneshot::channel();
        self.shared
            .session
            .lock()
            .register_subscription(tag.clone(), instrument, levels, handler, tx)?;
        debug!(%instrument, %tag, ?levels, "Subscribing");

        if let Err(e) = self.shared.send(frame).await {
            self.shared.session.lock().remove_pending_subscription(&tag);
            warn!(%instrument, error = %e, "Failed to send subscribe request");
            return Err(e);
        }

        let result = self
            .await_response(rx, &tag, instrument, RequestKind::Subscribe)
            .await;
        match &result {
            Ok(()) => info!(%instrument, ?levels, "Subscribed"),
            Err(e) => warn!(%instrument, error = %e, "Subscription failed"),
        }
        result
    }

    /// Unsubscribe from `instrument`
    ///
    /// Fails without sending anything when no handler is bound or an
    /// unsubscription is already in flight.
    pub async fn unsubscribe(&self, instrument: &str) -> Result<(), StreamError> {
        let tag = Uuid::new_v4().to_string();
        let frame = Request::Unsubscribe {
            instrument: instrument.to_owned(),
            tag: tag.clone(),
        }
        .to_frame()?;

        let (tx, rx) = oneshot::channel();
        self.shared
            .session
            .lock()
            .register_unsubscription(tag.clone(), instrument, tx)?;
        debug!(%instrument, %tag, "Unsubscribing");

        if let Err(e) = self.shared.send(frame).await {
            self.shared.session.lock().remove_pending_unsubscription(&tag);
            warn!(%instrument, error = %e, "Failed to send unsubscribe request");
            return Err(e);
        }

        let result = self
            .await_response(rx, &tag, instrument, RequestKind::Unsubscribe)
            .await;
        match &result {
            Ok(()) => info!(%instrument, "Unsubscribed"),
            Err(e) => warn!(%instrument, error = %e, "Unsubscription failed"),
        }
        result
    }

    async fn await_response(
        &self,
        rx: oneshot::Receiver<Result<(), StreamError>>,
        tag: &str,
        instrument: &str,
        kind: RequestKind,
    ) -> Result<(), StreamError> {
        let request_timeout = self.shared.settings.request_timeout;
        match timeout(request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StreamError::Cancelled),
            Err(_) => {
                {
                    let mut session = self.shared.session.lock();
                    match kind {
                        RequestKind::Subscribe => session.remove_pending_subscription(tag),
                        RequestKind::Unsubscribe => session.remove_pending_unsubscription(tag),
                    };
                }
                warn!(%instrument, %tag, ?request_timeout, "No {} response in time", kind);
                Err(StreamError::SubscriptionTimeout {
                    instrument: instrument.to_owned(),
                    timeout: request_timeout,
                })
            }
        }
    }

    /// Abort the connection and the read loop
    ///
    /// Pending requests fail with [`StreamError::Cancelled`] and all handler
    /// bindings are dropped. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.shared.session.lock().state = ConnectionState::Closing;

        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
        }
        self.shared.fail_pending(|| StreamError::Cancelled);

        match timeout(CLOSE_TIMEOUT, self.shared.sink.lock()).await {
            Ok(mut sink) => {
                if let Some(mut frame_sink) = sink.take() {
                    match timeout(CLOSE_TIMEOUT, frame_sink.close()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(error = %e, "Error while closing quote stream"),
                        Err(_) => debug!("Timed out closing quote stream"),
                    }
                }
            }
            Err(_) => warn!("Write half busy while disconnecting; dropping it with the client"),
        }

        {
            let mut session = self.shared.session.lock();
            session.state = ConnectionState::Closed;
            session.clear_bindings();
        }
        info!(url = %self.shared.settings.url, "Quote stream disconnected");
    }

    /// Suspend duplicate checks until the returned guard is dropped
    #[must_use]
    pub fn begin_resubscription(&self) -> ResubscriptionGuard {
        self.shared.session.lock().enter_resubscription();
        ResubscriptionGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether a resubscription guard is alive
    pub fn is_resubscribing(&self) -> bool {
        self.shared.session.lock().is_resubscribing()
    }

    /// Current connection lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether requests can be sent right now
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Instruments with an active handler binding, sorted
    pub fn active_instruments(&self) -> Vec<String> {
        self.shared.session.lock().active_instruments()
    }

    pub fn is_subscribed(&self, instrument: &str) -> bool {
        self.shared.session.lock().is_bound(instrument)
    }

    /// Levels of the active binding for `instrument`
    pub fn subscribed_levels(&self, instrument: &str) -> Option<Vec<f64>> {
        self.shared.session.lock().levels_for(instrument)
    }

    /// Requests still waiting for a tagged response
    pub fn pending_requests(&self) -> usize {
        self.shared.session.lock().pending_count()
    }

    /// Catalog announced by the provider after connecting
    pub fn tradable_instruments(&self) -> Vec<String> {
        self.shared.session.lock().tradable_instruments().to_vec()
    }

    /// When the last price frame was received
    pub fn last_price_at(&self) -> Option<DateTime<Utc>> {
        self.shared.session.lock().last_price_at
    }

    /// Settings the client was built with
    pub fn settings(&self) -> &StreamSettings {
        &self.shared.settings
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
        self.shared.session.lock().state = ConnectionState::Closed;
        self.shared.fail_pending(|| StreamError::Cancelled);
    }
}
