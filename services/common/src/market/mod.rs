//! Market data objects published by the adapter

pub mod orderbook;
pub mod tick_price;

pub use orderbook::*;
pub use tick_price::*;
