//! Recognized wallet currencies
//!
//! The currency set is a fixed, externally configured enumeration. The
//! engine validates against it but never defines currencies itself.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Longest currency code, in bytes (`VARCHAR(16)` columns).
pub const MAX_CODE_LEN: usize = 16;

/// Currency code (wallet kind), normalized to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Currency {
    fn from(code: &str) -> Self {
        Currency::new(code)
    }
}

/// Configured currency entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencySpec {
    pub code: String,
    /// Number of decimal places of one minor unit (2 -> cents)
    pub decimals: u32,
}

impl CurrencySpec {
    pub fn new(code: &str, decimals: u32) -> Self {
        Self {
            code: code.to_string(),
            decimals,
        }
    }
}

/// Wallet kinds shipped by default.
pub fn default_currencies() -> Vec<CurrencySpec> {
    vec![
        CurrencySpec::new("CNY", 2),
        CurrencySpec::new("USD", 2),
        CurrencySpec::new("COIN", 8),
    ]
}

/// Lookup table of recognized currencies and their decimals.
#[derive(Debug, Clone, Default)]
pub struct CurrencyRegistry {
    decimals: BTreeMap<Currency, u32>,
}

impl CurrencyRegistry {
    pub fn new(specs: &[CurrencySpec]) -> Self {
        let decimals = specs
            .iter()
            .map(|spec| (Currency::new(&spec.code), spec.decimals))
            .collect();
        Self { decimals }
    }

    #[inline]
    pub fn is_recognized(&self, currency: &Currency) -> bool {
        self.decimals.contains_key(currency)
    }

    /// Decimal places for `currency`, `None` if it is not recognized.
    pub fn decimals(&self, currency: &Currency) -> Option<u32> {
        self.decimals.get(currency).copied()
    }

    /// Recognized currencies in code order.
    pub fn currencies(&self) -> impl Iterator<Item = &Currency> {
        self.decimals.keys()
    }

    pub fn len(&self) -> usize {
        self.decimals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decimals.is_empty()
    }
}
