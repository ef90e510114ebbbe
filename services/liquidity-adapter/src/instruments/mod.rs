//! Tradable instrument catalog and identifier mapping

pub mod catalog;
pub mod mapping;

pub use catalog::{Instrument, InstrumentCatalog, RestInstrumentCatalog};
pub use mapping::InstrumentMapping;
