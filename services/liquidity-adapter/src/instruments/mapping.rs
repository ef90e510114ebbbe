//! Raw / normalized instrument identifiers
//!
//! The provider names spot instruments with a type suffix (`BTCUSD.SPOT`);
//! everything downstream of the adapter uses the bare pair (`BTCUSD`). The
//! mapping is built once from the catalog and is immutable afterwards.

use rustc_hash::FxHashMap;
use services_common::SPOT_SUFFIX;

/// Bidirectional map between provider and normalized identifiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentMapping {
    suffix: String,
    to_raw: FxHashMap<String, String>,
    to_normalized: FxHashMap<String, String>,
}

impl InstrumentMapping {
    /// Build from provider names, keeping only those ending in `suffix`
    pub fn from_catalog<I, S>(names: I, suffix: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut mapping = Self {
            suffix: suffix.to_owned(),
            ..Self::default()
        };

        for name in names {
            let raw = name.as_ref().trim();
            let Some(pair) = raw.strip_suffix(suffix) else {
                continue;
            };
            if pair.is_empty() {
                continue;
            }
            let normalized = pair.to_uppercase();
            mapping.to_raw.insert(normalized.clone(), raw.to_owned());
            mapping.to_normalized.insert(raw.to_owned(), normalized);
        }

        mapping
    }

    /// Build from provider names using the spot suffix
    pub fn spot<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_catalog(names, SPOT_SUFFIX)
    }

    /// Provider identifier for a normalized instrument (case-insensitive)
    pub fn raw(&self, normalized: &str) -> Option<&str> {
        self.to_raw
            .get(&normalized.trim().to_uppercase())
            .map(String::as_str)
    }

    /// Normalized identifier for a provider instrument
    pub fn normalized(&self, raw: &str) -> Option<&str> {
        self.to_normalized.get(raw).map(String::as_str)
    }

    /// All normalized instruments, sorted
    pub fn normalized_instruments(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self.to_raw.keys().cloned().collect();
        instruments.sort();
        instruments
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn len(&self) -> usize {
        self.to_raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_raw.is_empty()
    }
}
