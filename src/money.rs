//! Money Conversion Module
//!
//! Conversion between the ledger's fixed-point minor units and the decimal
//! strings clients send and read. Every boundary conversion goes through here.
//!
//! ## Internal Representation
//! - Balances and amounts are `u64` minor units, deltas are `i64`
//! - The scale factor is `10^decimals` of the currency (USD: 2 -> cents)
//! - The authoritative source for decimals is [`CurrencyRegistry`]
//!
//! ## Usage
//! ```rust
//! use wallet_ledger::money::{format_amount, parse_amount};
//!
//! let cents = parse_amount("12.34", 2).unwrap();
//! assert_eq!(cents, 1234);
//! assert_eq!(format_amount(cents, 2), "12.34");
//! ```

use rust_decimal::prelude::*;
use thiserror::Error;

use crate::currency::{Currency, CurrencyRegistry};

/// Largest supported number of decimals for a currency.
pub const MAX_DECIMALS: u32 = 18;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),
}

/// Convert a client amount string into minor units.
///
/// The format is strict: digits with an optional single dot, both sides
/// non-empty, no sign, no exponent, no more fractional digits than the
/// currency allows. Zero is rejected.
pub fn parse_amount(amount_str: &str, decimals: u32) -> Result<u64, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }
    if amount_str.starts_with('-') || amount_str.starts_with('+') {
        return Err(MoneyError::InvalidAmount);
    }

    let (whole, frac) = match amount_str.split_once('.') {
        None => (amount_str, ""),
        Some((_, rest)) if rest.contains('.') => {
            return Err(MoneyError::InvalidFormat("multiple decimal points".into()));
        }
        Some(("", _)) => {
            return Err(MoneyError::InvalidFormat(
                "missing leading zero (e.g., use 0.5 instead of .5)".into(),
            ));
        }
        Some((_, "")) => {
            return Err(MoneyError::InvalidFormat(
                "missing fractional part (e.g., use 5.0 instead of 5.)".into(),
            ));
        }
        Some(_) if decimals == 0 => {
            return Err(MoneyError::InvalidFormat(
                "currency has no decimals, but dot provided".into(),
            ));
        }
        Some(parts) => parts,
    };

    if !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MoneyError::InvalidFormat(format!(
            "invalid character in whole part: {}",
            whole
        )));
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MoneyError::InvalidFormat("invalid fractional part".into()));
    }

    // No silent truncation.
    if frac.len() > decimals as usize {
        return Err(MoneyError::PrecisionOverflow {
            provided: frac.len() as u32,
            max: decimals,
        });
    }

    let whole_num: u64 = whole.parse().map_err(|_| MoneyError::Overflow)?;
    let frac_num: u64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<width$}", frac, width = decimals as usize)
            .parse()
            .map_err(|_| MoneyError::InvalidFormat("invalid fractional part".into()))?
    };

    let amount = 10u64
        .checked_pow(decimals)
        .and_then(|multiplier| whole_num.checked_mul(multiplier))
        .and_then(|v| v.checked_add(frac_num))
        .ok_or(MoneyError::Overflow)?;

    if amount == 0 {
        return Err(MoneyError::InvalidAmount);
    }
    Ok(amount)
}

/// Convert an already-parsed `Decimal` into minor units.
pub fn parse_decimal(decimal: Decimal, decimals: u32) -> Result<u64, MoneyError> {
    if decimal.is_sign_negative() || decimal.is_zero() {
        return Err(MoneyError::InvalidAmount);
    }
    let normalized = decimal.normalize();
    if normalized.scale() > decimals {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: decimals,
        });
    }

    let multiplier = Decimal::from(10u64.checked_pow(decimals).ok_or(MoneyError::Overflow)?);
    normalized
        .checked_mul(multiplier)
        .and_then(|scaled| scaled.to_u64())
        .ok_or(MoneyError::Overflow)
}

/// Full-precision display string of a balance in minor units.
pub fn format_amount(value: u64, decimals: u32) -> String {
    format_scaled(value as i128, decimals)
}

/// Full-precision display string of a signed delta in minor units.
pub fn format_signed(value: i64, decimals: u32) -> String {
    format_scaled(value as i128, decimals)
}

fn format_scaled(value: i128, decimals: u32) -> String {
    let decimal = Decimal::from_i128_with_scale(value, decimals.min(MAX_DECIMALS));
    format!("{:.prec$}", decimal, prec = decimals as usize)
}

/// Parse a client amount for a recognized currency.
pub fn parse_currency_amount(
    amount_str: &str,
    currency: &Currency,
    registry: &CurrencyRegistry,
) -> Result<u64, MoneyError> {
    let decimals = registry
        .decimals(currency)
        .ok_or_else(|| MoneyError::UnknownCurrency(currency.to_string()))?;
    parse_amount(amount_str, decimals)
}

/// Whether `amount` minor units fit the signed delta range of the ledger.
#[inline]
pub fn fits_delta(amount: u64) -> bool {
    amount <= i64::MAX as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::default_currencies;
    use std::str::FromStr;

    #[test]
    fn test_parse_amount_variations() {
        assert_eq!(parse_amount("1.23", 2).unwrap(), 123);
        assert_eq!(parse_amount("1.23", 8).unwrap(), 123_000_000);
        assert_eq!(parse_amount("001.23", 2).unwrap(), 123);
        assert_eq!(parse_amount("0.0001", 4).unwrap(), 1);
        assert_eq!(parse_amount("100", 0).unwrap(), 100);

        assert_eq!(parse_amount("0", 2), Err(MoneyError::InvalidAmount));
        assert_eq!(parse_amount("0.00", 2), Err(MoneyError::InvalidAmount));
    }

    #[test]
    fn test_parse_amount_rejects_loose_formats() {
        for case in [
            "1,000.00", "1.2.3", "1. 23", "+1.23", "-1", "1e2", "0x12", ".", ".5", "5.", "",
        ] {
            assert!(parse_amount(case, 8).is_err(), "accepted {:?}", case);
        }
        assert!(parse_amount("100.0", 0).is_err());
    }

    #[test]
    fn test_parse_amount_precision_limit() {
        assert!(parse_amount("1.234", 3).is_ok());
        assert_eq!(
            parse_amount("1.2345", 3),
            Err(MoneyError::PrecisionOverflow {
                provided: 4,
                max: 3
            })
        );
    }

    #[test]
    fn test_parse_amount_u64_boundary() {
        assert_eq!(parse_amount("184467440737.09551615", 8).unwrap(), u64::MAX);
        assert_eq!(
            parse_amount("184467440737.09551616", 8),
            Err(MoneyError::Overflow)
        );
        assert_eq!(
            parse_amount("999999999999999999999", 0),
            Err(MoneyError::Overflow)
        );
    }

    #[test]
    fn test_parse_decimal() {
        let d = Decimal::from_str("1.23").unwrap();
        assert_eq!(parse_decimal(d, 2).unwrap(), 123);

        // trailing zeros do not count as precision
        let d = Decimal::from_str("1.2300").unwrap();
        assert_eq!(parse_decimal(d, 2).unwrap(), 123);

        let d = Decimal::from_str("1.234").unwrap();
        assert!(matches!(
            parse_decimal(d, 2),
            Err(MoneyError::PrecisionOverflow { .. })
        ));
        assert_eq!(parse_decimal(Decimal::ZERO, 2), Err(MoneyError::InvalidAmount));
        assert_eq!(
            parse_decimal(Decimal::from(-5), 2),
            Err(MoneyError::InvalidAmount)
        );
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(6000, 2), "60.00");
        assert_eq!(format_amount(1, 8), "0.00000001");
        assert_eq!(format_amount(0, 2), "0.00");
        assert_eq!(format_amount(42, 0), "42");
        assert_eq!(format_signed(-4000, 2), "-40.00");
        assert_eq!(format_signed(i64::MIN, 2), "-92233720368547758.08");
    }

    #[test]
    fn test_parse_currency_amount() {
        let registry = CurrencyRegistry::new(&default_currencies());
        let usd = Currency::new("USD");
        assert_eq!(parse_currency_amount("40", &usd, &registry).unwrap(), 4000);
        assert_eq!(
            parse_currency_amount("1", &Currency::new("EUR"), &registry),
            Err(MoneyError::UnknownCurrency("EUR".into()))
        );
    }

    #[test]
    fn test_fits_delta() {
        assert!(fits_delta(i64::MAX as u64));
        assert!(!fits_delta(i64::MAX as u64 + 1));
    }
}
