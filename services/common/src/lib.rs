//! Shared types for the liquidity adapter services
//!
//! Holds the market data objects that leave the adapter (order books and
//! tick prices) together with the constants and error type the services
//! agree on.

pub mod constants;
pub mod errors;
pub mod market;

pub use constants::*;
pub use errors::*;
pub use market::*;
