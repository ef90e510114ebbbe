//! Liquidity Adapter Service
//!
//! Streams quotes from a liquidity provider over a tag-correlated WebSocket
//! protocol, keeps the latest order book per instrument and republishes the
//! resulting order books and tick prices to downstream consumers.
//!
//! Layers, leaves first:
//! - [`transport`]: one duplex text-frame connection, no protocol knowledge
//! - [`stream`]: subscription protocol engine ([`StreamClient`])
//! - [`orderbook`]: order book cache and resilience supervisor
//!   ([`OrderBooksService`])
//! - [`publishers`]: downstream collaborators

pub mod config;
pub mod instruments;
pub mod metrics;
pub mod orderbook;
pub mod publishers;
pub mod stream;
pub mod transport;

pub use config::{AdapterConfig, ConfigError};
pub use instruments::{Instrument, InstrumentCatalog, InstrumentMapping, RestInstrumentCatalog};
pub use orderbook::{OrderBookCache, OrderBooksService};
pub use publishers::{BroadcastPublisher, OrderBookPublisher, TickPricePublisher};
pub use stream::{PriceHandler, PriceMessage, StreamClient, StreamError, StreamSettings};
pub use transport::{Connector, FrameSink, FrameStream, TransportError, WsConnector};
