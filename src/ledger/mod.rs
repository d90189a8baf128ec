//! Ledger Log
//!
//! Append-only record of every balance-affecting event. Entries are never
//! updated or deleted; wallet rows are a materialized cache of them.
//!
//! For every wallet: `Σ delta == available` and `Σ frozen_delta == frozen`.

pub mod log;

pub use log::LedgerLog;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{Amount, EntrySeq, SignedAmount};
use crate::wallet::{Wallet, WalletKey};

/// Movement identifier - ULID based
///
/// Monotonic, sortable, generated without coordination. Shared by all
/// entries produced by one committed movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(ulid::Ulid);

impl TransferId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Entry kind
///
/// IDs are stable: they are persisted as SMALLINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum EntryKind {
    TransferOut = 1,
    TransferIn = 2,
    Fee = 3,
    Freeze = 4,
    Unfreeze = 5,
    Deposit = 6,
    Adjustment = 7,
}

impl EntryKind {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(EntryKind::TransferOut),
            2 => Some(EntryKind::TransferIn),
            3 => Some(EntryKind::Fee),
            4 => Some(EntryKind::Freeze),
            5 => Some(EntryKind::Unfreeze),
            6 => Some(EntryKind::Deposit),
            7 => Some(EntryKind::Adjustment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::TransferOut => "TRANSFER_OUT",
            EntryKind::TransferIn => "TRANSFER_IN",
            EntryKind::Fee => "FEE",
            EntryKind::Freeze => "FREEZE",
            EntryKind::Unfreeze => "UNFREEZE",
            EntryKind::Deposit => "DEPOSIT",
            EntryKind::Adjustment => "ADJUSTMENT",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry staged inside a storage transaction; `seq` is assigned on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub wallet: WalletKey,
    pub kind: EntryKind,
    pub delta: SignedAmount,
    pub frozen_delta: SignedAmount,
    pub counterparty: Option<WalletKey>,
    pub transfer_id: TransferId,
    pub balance_after: Amount,
    pub frozen_after: Amount,
    pub wallet_version: u64,
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewLedgerEntry {
    /// Entry describing how `after` was reached, deltas taken from the caller.
    pub fn describe(
        after: &Wallet,
        kind: EntryKind,
        delta: SignedAmount,
        frozen_delta: SignedAmount,
        transfer_id: TransferId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            wallet: after.key().clone(),
            kind,
            delta,
            frozen_delta,
            counterparty: None,
            transfer_id,
            balance_after: after.available(),
            frozen_after: after.frozen(),
            wallet_version: after.version(),
            memo: None,
            created_at,
        }
    }

    pub fn with_counterparty(mut self, counterparty: WalletKey) -> Self {
        self.counterparty = Some(counterparty);
        self
    }

    pub fn with_memo(mut self, memo: Option<String>) -> Self {
        self.memo = memo;
        self
    }

    pub fn into_entry(self, seq: EntrySeq) -> LedgerEntry {
        LedgerEntry {
            seq,
            wallet: self.wallet,
            kind: self.kind,
            delta: self.delta,
            frozen_delta: self.frozen_delta,
            counterparty: self.counterparty,
            transfer_id: self.transfer_id,
            balance_after: self.balance_after,
            frozen_after: self.frozen_after,
            wallet_version: self.wallet_version,
            memo: self.memo,
            created_at: self.created_at,
        }
    }
}

/// Committed, immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: EntrySeq,
    pub wallet: WalletKey,
    pub kind: EntryKind,
    /// Change of `available`
    pub delta: SignedAmount,
    /// Change of `frozen`
    pub frozen_delta: SignedAmount,
    pub counterparty: Option<WalletKey>,
    pub transfer_id: TransferId,
    /// `available` right after this entry
    pub balance_after: Amount,
    /// `frozen` right after this entry
    pub frozen_after: Amount,
    pub wallet_version: u64,
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Change of `available + frozen`.
    #[inline]
    pub fn total_delta(&self) -> i128 {
        self.delta as i128 + self.frozen_delta as i128
    }

    #[inline]
    pub fn is_debit(&self) -> bool {
        self.total_delta() < 0
    }
}

/// Debit and credit legs of a two-legged movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPair {
    pub debit: LedgerEntry,
    pub credit: LedgerEntry,
}

impl EntryPair {
    /// Pair up exactly two entries of opposite sign, `None` otherwise.
    pub fn from_entries(mut entries: Vec<LedgerEntry>) -> Option<Self> {
        if entries.len() != 2 {
            return None;
        }
        let second = entries.pop()?;
        let first = entries.pop()?;
        match (first.is_debit(), second.is_debit()) {
            (true, false) => Some(Self {
                debit: first,
                credit: second,
            }),
            (false, true) => Some(Self {
                debit: second,
                credit: first,
            }),
            _ => None,
        }
    }

    pub fn transfer_id(&self) -> TransferId {
        self.debit.transfer_id
    }

    /// Debit and credit cancel out and share one transfer id.
    pub fn is_balanced(&self) -> bool {
        self.debit.transfer_id == self.credit.transfer_id
            && self.debit.total_delta() + self.credit.total_delta() == 0
    }
}

/// One page request against a wallet's entries (`after` is exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryQuery {
    pub after: Option<EntrySeq>,
    pub until: Option<EntrySeq>,
    pub limit: usize,
}

/// Range of a history stream; restart it from `after = last seen seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRange {
    pub after: Option<EntrySeq>,
    /// Inclusive upper bound
    pub until: Option<EntrySeq>,
    pub page_size: usize,
}

impl EntryRange {
    pub const DEFAULT_PAGE_SIZE: usize = 100;

    pub fn all() -> Self {
        Self {
            after: None,
            until: None,
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn resume_after(self, seq: EntrySeq) -> Self {
        Self {
            after: Some(seq),
            ..self
        }
    }

    pub fn until(self, seq: EntrySeq) -> Self {
        Self {
            until: Some(seq),
            ..self
        }
    }

    pub fn with_page_size(self, page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            ..self
        }
    }
}

impl Default for EntryRange {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: EntrySeq, delta: i64, transfer_id: TransferId) -> LedgerEntry {
        LedgerEntry {
            seq,
            wallet: WalletKey::new(seq, "USD"),
            kind: if delta < 0 {
                EntryKind::TransferOut
            } else {
                EntryKind::TransferIn
            },
            delta,
            frozen_delta: 0,
            counterparty: None,
            transfer_id,
            balance_after: 0,
            frozen_after: 0,
            wallet_version: 1,
            memo: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_entry_kind_roundtrip() {
        for id in 1..=7 {
            let kind = EntryKind::from_id(id).unwrap();
            assert_eq!(kind.id(), id);
        }
        assert!(EntryKind::from_id(0).is_none());
        assert!(EntryKind::from_id(8).is_none());
        assert_eq!(EntryKind::TransferOut.to_string(), "TRANSFER_OUT");
    }

    #[test]
    fn test_transfer_id_parse() {
        let id = TransferId::new();
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<TransferId>().is_err());
    }

    #[test]
    fn test_entry_pair_orders_legs() {
        let id = TransferId::new();
        let pair = EntryPair::from_entries(vec![entry(2, 40, id), entry(1, -40, id)]).unwrap();
        assert_eq!(pair.debit.delta, -40);
        assert_eq!(pair.credit.delta, 40);
        assert!(pair.is_balanced());
        assert_eq!(pair.transfer_id(), id);
    }

    #[test]
    fn test_entry_pair_rejects_single_or_same_sign() {
        let id = TransferId::new();
        assert!(EntryPair::from_entries(vec![entry(1, 10, id)]).is_none());
        assert!(EntryPair::from_entries(vec![entry(1, 10, id), entry(2, 10, id)]).is_none());
    }

    #[test]
    fn test_range_builders() {
        let range = EntryRange::all().with_page_size(0).resume_after(9).until(20);
        assert_eq!(range.page_size, 1);
        assert_eq!(range.after, Some(9));
        assert_eq!(range.until, Some(20));
    }
}
