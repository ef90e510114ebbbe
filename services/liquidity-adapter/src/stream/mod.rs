//! Streaming subscription protocol

pub mod client;
pub mod error;
pub mod handler;
pub mod messages;
pub mod session;

pub use client::{ResubscriptionGuard, StreamClient, StreamSettings};
pub use error::StreamError;
pub use handler::{handler_fn, PriceHandler};
pub use messages::{ErrorCode, InboundEvent, Levels, PriceMessage, ProviderError, QuantityPrice, Request};
pub use session::ConnectionState;
