//! Order book cache and resilience supervisor

pub mod cache;
pub mod service;

pub use cache::{CacheUpdate, OrderBookCache};
pub use service::{
    order_book_from_price, Collaborators, OrderBooksService, ReconnectOutcome, ReconnectReason,
    SubscriptionPass,
};
