//! Connection transport
//!
//! Owns one duplex connection to the provider and moves whole text frames in
//! and out of it. Fragment reassembly and control frames are handled by
//! tungstenite; nothing here knows about the subscription protocol.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport level failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint URL or credential could not be turned into a handshake request
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Handshake with the provider failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Writing a frame failed
    #[error("Send failed: {0}")]
    Send(String),

    /// Reading a frame failed
    #[error("Receive failed: {0}")]
    Receive(String),

    /// Connection is already closed
    #[error("Connection closed")]
    Closed,
}

/// Write half of a connection
#[async_trait]
pub trait FrameSink: Send {
    /// Write one complete text frame
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection
#[async_trait]
pub trait FrameStream: Send {
    /// Next complete text frame, `None` once the peer has closed
    async fn next_text(&mut self) -> Option<Result<String, TransportError>>;
}

/// Opens connections to the provider
///
/// The stream client only ever talks to this trait, so the provider can be
/// replaced by an in-memory double in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection, attaching `authorization` to the handshake
    async fn connect(
        &self,
        url: &str,
        authorization: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    scheme: Option<String>,
}

impl WsConnector {
    /// Connector sending `Authorization: Token <credential>`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different authorization scheme, e.g. `Bearer`
    #[must_use]
    pub fn with_scheme(scheme: impl Into<String>) -> Self {
        Self {
            scheme: Some(scheme.into()),
        }
    }

    fn header_value(&self, credential: &str) -> String {
        format!("{} {}", self.scheme.as_deref().unwrap_or("Token"), credential)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        authorization: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        let header = HeaderValue::from_str(&self.header_value(authorization))
            .map_err(|e| TransportError::InvalidEndpoint(format!("authorization header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        info!(%url, status = %response.status(), "WebSocket connected");

        let (write, read) = ws_stream.split();
        Ok((Box::new(WsSink { inner: write }), Box::new(WsReader { inner: read })))
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

struct WsReader {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsReader {
    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };

            match message {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => debug!(error = %e, "Skipping non UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    debug!(?frame, "Close frame received");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}
