//! Engine request and result types

use serde::{Deserialize, Serialize};

use crate::core_types::{Amount, EntrySeq, OwnerId, SignedAmount};
use crate::currency::Currency;
use crate::ledger::{EntryKind, LedgerEntry, TransferId};
use crate::wallet::{BalanceDelta, BalanceSnapshot, WalletKey};

/// Balance-affecting request, also the fingerprint stored with its
/// idempotency key. A retried key must carry an equal operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Transfer {
        from: OwnerId,
        to: OwnerId,
        currency: Currency,
        amount: Amount,
    },
    Deposit {
        owner: OwnerId,
        currency: Currency,
        amount: Amount,
    },
    Freeze {
        owner: OwnerId,
        currency: Currency,
        amount: Amount,
    },
    Unfreeze {
        owner: OwnerId,
        currency: Currency,
        amount: Amount,
    },
    Fee {
        owner: OwnerId,
        collector: OwnerId,
        currency: Currency,
        amount: Amount,
    },
    Adjust {
        owner: OwnerId,
        currency: Currency,
        delta: SignedAmount,
        memo: Option<String>,
    },
}

/// One wallet mutation of a planned movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Leg {
    pub key: WalletKey,
    pub kind: EntryKind,
    pub delta: BalanceDelta,
    pub counterparty: Option<WalletKey>,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Transfer { .. } => "transfer",
            Operation::Deposit { .. } => "deposit",
            Operation::Freeze { .. } => "freeze",
            Operation::Unfreeze { .. } => "unfreeze",
            Operation::Fee { .. } => "fee",
            Operation::Adjust { .. } => "adjust",
        }
    }

    /// Owner whose idempotency namespace the request's key lives in: the
    /// debited owner for two-legged movements, the affected owner otherwise.
    pub fn scope_owner(&self) -> OwnerId {
        match self {
            Operation::Transfer { from, .. } => *from,
            Operation::Deposit { owner, .. }
            | Operation::Freeze { owner, .. }
            | Operation::Unfreeze { owner, .. }
            | Operation::Fee { owner, .. }
            | Operation::Adjust { owner, .. } => *owner,
        }
    }

    pub fn currency(&self) -> &Currency {
        match self {
            Operation::Transfer { currency, .. }
            | Operation::Deposit { currency, .. }
            | Operation::Freeze { currency, .. }
            | Operation::Unfreeze { currency, .. }
            | Operation::Fee { currency, .. }
            | Operation::Adjust { currency, .. } => currency,
        }
    }

    /// Whether the result is a [`TransferResult`] (two wallets).
    pub fn is_two_legged(&self) -> bool {
        matches!(self, Operation::Transfer { .. } | Operation::Fee { .. })
    }

    /// Wallet mutations in execution order (debit before credit).
    ///
    /// Callers validate amounts first: every amount here fits `i64`.
    pub(crate) fn legs(&self) -> Vec<Leg> {
        match self {
            Operation::Transfer {
                from,
                to,
                currency,
                amount,
            } => two_legs(
                WalletKey::new(*from, currency.clone()),
                WalletKey::new(*to, currency.clone()),
                *amount as SignedAmount,
                EntryKind::TransferOut,
                EntryKind::TransferIn,
            ),
            Operation::Fee {
                owner,
                collector,
                currency,
                amount,
            } => two_legs(
                WalletKey::new(*owner, currency.clone()),
                WalletKey::new(*collector, currency.clone()),
                *amount as SignedAmount,
                EntryKind::Fee,
                EntryKind::Fee,
            ),
            Operation::Deposit {
                owner,
                currency,
                amount,
            } => vec![single_leg(
                *owner,
                currency,
                EntryKind::Deposit,
                BalanceDelta::available(*amount as SignedAmount),
            )],
            Operation::Freeze {
                owner,
                currency,
                amount,
            } => vec![single_leg(
                *owner,
                currency,
                EntryKind::Freeze,
                BalanceDelta::freeze(*amount as SignedAmount),
            )],
            Operation::Unfreeze {
                owner,
                currency,
                amount,
            } => vec![single_leg(
                *owner,
                currency,
                EntryKind::Unfreeze,
                BalanceDelta::freeze(-(*amount as SignedAmount)),
            )],
            Operation::Adjust {
                owner,
                currency,
                delta,
                ..
            } => vec![single_leg(
                *owner,
                currency,
                EntryKind::Adjustment,
                BalanceDelta::available(*delta),
            )],
        }
    }

    pub(crate) fn memo(&self) -> Option<String> {
        match self {
            Operation::Adjust { memo, .. } => memo.clone(),
            _ => None,
        }
    }
}

fn two_legs(
    debit: WalletKey,
    credit: WalletKey,
    amount: SignedAmount,
    debit_kind: EntryKind,
    credit_kind: EntryKind,
) -> Vec<Leg> {
    vec![
        Leg {
            key: debit.clone(),
            kind: debit_kind,
            delta: BalanceDelta::available(-amount),
            counterparty: Some(credit.clone()),
        },
        Leg {
            key: credit,
            kind: credit_kind,
            delta: BalanceDelta::available(amount),
            counterparty: Some(debit),
        },
    ]
}

fn single_leg(owner: OwnerId, currency: &Currency, kind: EntryKind, delta: BalanceDelta) -> Leg {
    Leg {
        key: WalletKey::new(owner, currency.clone()),
        kind,
        delta,
        counterparty: None,
    }
}

/// Confirmation of a committed two-legged movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_id: TransferId,
    pub new_from_balance: BalanceSnapshot,
    pub new_to_balance: BalanceSnapshot,
}

/// Confirmation of a committed single-wallet posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingResult {
    pub transfer_id: TransferId,
    pub kind: EntryKind,
    pub balance: BalanceSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Settlement {
    Transfer(TransferResult),
    Posting(PostingResult),
}

impl Settlement {
    pub fn transfer_id(&self) -> TransferId {
        match self {
            Settlement::Transfer(r) => r.transfer_id,
            Settlement::Posting(r) => r.transfer_id,
        }
    }
}

/// Terminal business failure remembered for the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    InsufficientFunds { wallet: WalletKey },
}

/// What the first attempt under a key produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Settled(Settlement),
    Rejected(Rejection),
}

/// History page request (`after` is an exclusive cursor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub after: Option<EntrySeq>,
    pub limit: usize,
}

impl Page {
    pub const MAX_LIMIT: usize = 500;

    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }

    pub fn after(seq: EntrySeq, limit: usize) -> Self {
        Self {
            after: Some(seq),
            limit,
        }
    }

    pub(crate) fn clamped_limit(&self) -> usize {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub entries: Vec<LedgerEntry>,
    /// Cursor for the next page, `None` when this was the last one
    pub next: Option<EntrySeq>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_legs() {
        let op = Operation::Transfer {
            from: 1,
            to: 2,
            currency: Currency::new("USD"),
            amount: 40,
        };
        let legs = op.legs();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].key, WalletKey::new(1, "USD"));
        assert_eq!(legs[0].delta, BalanceDelta::available(-40));
        assert_eq!(legs[0].kind, EntryKind::TransferOut);
        assert_eq!(legs[0].counterparty, Some(WalletKey::new(2, "USD")));
        assert_eq!(legs[1].delta, BalanceDelta::available(40));
        assert_eq!(legs[1].kind, EntryKind::TransferIn);
        assert_eq!(op.scope_owner(), 1);
        assert!(op.is_two_legged());
    }

    #[test]
    fn test_freeze_legs_keep_total() {
        let key_currency = Currency::new("COIN");
        for op in [
            Operation::Freeze {
                owner: 3,
                currency: key_currency.clone(),
                amount: 5,
            },
            Operation::Unfreeze {
                owner: 3,
                currency: key_currency.clone(),
                amount: 5,
            },
        ] {
            let legs = op.legs();
            assert_eq!(legs.len(), 1);
            assert_eq!(legs[0].delta.available + legs[0].delta.frozen, 0);
            assert!(!op.is_two_legged());
        }
    }

    #[test]
    fn test_operation_fingerprint_json() {
        let op = Operation::Adjust {
            owner: 9,
            currency: Currency::new("CNY"),
            delta: -15,
            memo: Some("chargeback".into()),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"op\":\"adjust\""));
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_page_limit_clamped() {
        assert_eq!(Page::first(0).clamped_limit(), 1);
        assert_eq!(Page::first(10_000).clamped_limit(), Page::MAX_LIMIT);
        assert_eq!(Page::after(5, 20).after, Some(5));
    }
}
