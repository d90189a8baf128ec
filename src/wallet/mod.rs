//! Wallet balances
//!
//! One [`Wallet`] per (owner, currency). All balance mutations go through
//! [`Wallet::apply`], which is only ever called by a storage transaction.
//!
//! # Invariants (ENFORCED by private fields):
//! - `available` and `frozen` are unsigned and changed with checked arithmetic
//! - `version` increments by exactly one per applied delta
//! - a rejected delta leaves the wallet untouched (apply returns a new value)

pub mod store;

pub use store::WalletStore;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::{Amount, OwnerId, SignedAmount};
use crate::currency::Currency;

/// Wallet identity. Ordered by owner, then currency code; this order is the
/// global lock order used by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletKey {
    pub owner: OwnerId,
    pub currency: Currency,
}

impl WalletKey {
    pub fn new(owner: OwnerId, currency: impl Into<Currency>) -> Self {
        Self {
            owner,
            currency: currency.into(),
        }
    }
}

impl fmt::Display for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.currency)
    }
}

/// Signed change applied to a wallet in one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub available: SignedAmount,
    pub frozen: SignedAmount,
}

impl BalanceDelta {
    pub fn available(delta: SignedAmount) -> Self {
        Self {
            available: delta,
            frozen: 0,
        }
    }

    /// Move `amount` from available into frozen (negative moves it back).
    pub fn freeze(amount: SignedAmount) -> Self {
        Self {
            available: -amount,
            frozen: amount,
        }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.available == 0 && self.frozen == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("Insufficient available funds")]
    InsufficientAvailable,

    #[error("Insufficient frozen funds")]
    InsufficientFrozen,

    #[error("Balance overflow")]
    Overflow,
}

/// Balance record of one (owner, currency) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    key: WalletKey,
    available: Amount,
    frozen: Amount,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Fresh zero-balance wallet at version 0.
    pub fn zero(key: WalletKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            available: 0,
            frozen: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a wallet from persisted columns.
    pub(crate) fn from_parts(
        key: WalletKey,
        available: Amount,
        frozen: Amount,
        version: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            available,
            frozen,
            version,
            created_at,
            updated_at,
        }
    }

    #[inline(always)]
    pub fn key(&self) -> &WalletKey {
        &self.key
    }

    #[inline(always)]
    pub const fn available(&self) -> Amount {
        self.available
    }

    #[inline(always)]
    pub const fn frozen(&self) -> Amount {
        self.frozen
    }

    /// available + frozen, `None` on overflow (data corruption)
    #[inline(always)]
    pub const fn total(&self) -> Option<Amount> {
        self.available.checked_add(self.frozen)
    }

    #[inline(always)]
    pub const fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Compute the wallet after `delta`, without touching `self`.
    ///
    /// # Errors
    /// - `InsufficientAvailable` / `InsufficientFrozen` if a side would go negative
    /// - `Overflow` if a side would exceed `u64::MAX`
    pub fn apply(&self, delta: BalanceDelta, now: DateTime<Utc>) -> Result<Wallet, BalanceError> {
        let available = self
            .available
            .checked_add_signed(delta.available)
            .ok_or(if delta.available < 0 {
                BalanceError::InsufficientAvailable
            } else {
                BalanceError::Overflow
            })?;
        let frozen = self
            .frozen
            .checked_add_signed(delta.frozen)
            .ok_or(if delta.frozen < 0 {
                BalanceError::InsufficientFrozen
            } else {
                BalanceError::Overflow
            })?;
        available.checked_add(frozen).ok_or(BalanceError::Overflow)?;

        Ok(Wallet {
            key: self.key.clone(),
            available,
            frozen,
            version: self.version.wrapping_add(1),
            created_at: self.created_at,
            updated_at: now,
        })
    }

    /// Point-in-time balance snapshot returned to callers.
    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            wallet: self.key.clone(),
            available: self.available,
            frozen: self.frozen,
            version: self.version,
        }
    }
}

/// Balance figures of a wallet right after a committed movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub wallet: WalletKey,
    pub available: Amount,
    pub frozen: Amount,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet() -> Wallet {
        Wallet::zero(WalletKey::new(1, "USD"), Utc::now())
    }

    #[test]
    fn test_credit_and_debit() {
        let now = Utc::now();
        let w = wallet().apply(BalanceDelta::available(100), now).unwrap();
        assert_eq!(w.available(), 100);
        assert_eq!(w.version(), 1);

        let w = w.apply(BalanceDelta::available(-60), now).unwrap();
        assert_eq!(w.available(), 40);
        assert_eq!(w.version(), 2);
    }

    #[test]
    fn test_debit_insufficient_leaves_original() {
        let now = Utc::now();
        let w = wallet().apply(BalanceDelta::available(50), now).unwrap();
        assert_eq!(
            w.apply(BalanceDelta::available(-100), now),
            Err(BalanceError::InsufficientAvailable)
        );
        assert_eq!(w.available(), 50);
        assert_eq!(w.version(), 1);
    }

    #[test]
    fn test_freeze_unfreeze_keeps_total() {
        let now = Utc::now();
        let w = wallet().apply(BalanceDelta::available(100), now).unwrap();

        let w = w.apply(BalanceDelta::freeze(60), now).unwrap();
        assert_eq!((w.available(), w.frozen()), (40, 60));
        assert_eq!(w.total(), Some(100));

        let w = w.apply(BalanceDelta::freeze(-20), now).unwrap();
        assert_eq!((w.available(), w.frozen()), (60, 40));

        assert_eq!(
            w.apply(BalanceDelta::freeze(-41), now),
            Err(BalanceError::InsufficientFrozen)
        );
    }

    #[test]
    fn test_overflow() {
        let now = Utc::now();
        let w = wallet()
            .apply(BalanceDelta::available(i64::MAX), now)
            .unwrap()
            .apply(BalanceDelta::available(i64::MAX), now)
            .unwrap();
        assert_eq!(
            w.apply(BalanceDelta::available(2), now),
            Err(BalanceError::Overflow)
        );
    }

    #[test]
    fn test_key_order_is_owner_then_currency() {
        let mut keys = vec![
            WalletKey::new(2, "CNY"),
            WalletKey::new(1, "USD"),
            WalletKey::new(1, "COIN"),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                WalletKey::new(1, "COIN"),
                WalletKey::new(1, "USD"),
                WalletKey::new(2, "CNY"),
            ]
        );
        assert_eq!(WalletKey::new(7, "usd").to_string(), "7/USD");
    }
}
