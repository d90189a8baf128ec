//! Ledger audit
//!
//! The ledger is the source of truth and wallet rows are its cache. These
//! checks replay entries and report every place where the two disagree.

use std::collections::HashSet;

use futures::StreamExt;
use serde::Serialize;
use tracing::warn;

use crate::core_types::{Amount, EntrySeq};
use crate::error::LedgerError;
use crate::ledger::{EntryKind, EntryRange, LedgerEntry, LedgerLog, TransferId};
use crate::wallet::{WalletKey, WalletStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ReconcileIssue {
    /// Σ delta differs from the wallet's available balance
    AvailableMismatch { ledger: i128, wallet: Amount },
    /// Σ frozen_delta differs from the wallet's frozen balance
    FrozenMismatch { ledger: i128, wallet: Amount },
    /// Entry count differs from the wallet version (one entry per applied delta)
    VersionMismatch { entries: u64, wallet: u64 },
    /// An entry's recorded balances do not follow from its predecessors
    BrokenChain {
        seq: EntrySeq,
        expected_available: i128,
        recorded_available: Amount,
    },
    /// Entries exist for a wallet that has no balance row
    MissingWallet { entries: u64 },
    /// A movement touching this wallet fails [`verify_movement`]
    BrokenMovement {
        transfer_id: TransferId,
        problem: MovementIssue,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub wallet: WalletKey,
    pub entries: u64,
    pub last_seq: Option<EntrySeq>,
    pub ledger_available: i128,
    pub ledger_frozen: i128,
    pub issues: Vec<ReconcileIssue>,
}

impl ReconcileReport {
    #[inline]
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Replay every entry of `key` and compare with its wallet row, then check
/// the shape of every movement those entries belong to.
///
/// The wallet is read first; entries written by later commits (higher
/// `wallet_version`) are ignored so a busy wallet does not report drift.
pub async fn reconcile_wallet(
    wallets: &WalletStore,
    log: &LedgerLog,
    key: &WalletKey,
) -> Result<ReconcileReport, LedgerError> {
    let wallet = wallets.find(key).await?;
    let horizon = wallet.as_ref().map(|w| w.version()).unwrap_or(u64::MAX);

    let mut report = ReconcileReport {
        wallet: key.clone(),
        entries: 0,
        last_seq: None,
        ledger_available: 0,
        ledger_frozen: 0,
        issues: Vec::new(),
    };

    let mut movements = Vec::new();
    let mut seen = HashSet::new();
    let mut entries = log.entries_for(key.clone(), EntryRange::all());
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        if entry.wallet_version > horizon {
            break;
        }
        if seen.insert(entry.transfer_id) {
            movements.push(entry.transfer_id);
        }
        report.entries += 1;
        report.last_seq = Some(entry.seq);
        report.ledger_available += entry.delta as i128;
        report.ledger_frozen += entry.frozen_delta as i128;
        if report.ledger_available != entry.balance_after as i128
            || report.ledger_frozen != entry.frozen_after as i128
        {
            report.issues.push(ReconcileIssue::BrokenChain {
                seq: entry.seq,
                expected_available: report.ledger_available,
                recorded_available: entry.balance_after,
            });
        }
    }

    match wallet {
        Some(wallet) => {
            if report.ledger_available != wallet.available() as i128 {
                report.issues.push(ReconcileIssue::AvailableMismatch {
                    ledger: report.ledger_available,
                    wallet: wallet.available(),
                });
            }
            if report.ledger_frozen != wallet.frozen() as i128 {
                report.issues.push(ReconcileIssue::FrozenMismatch {
                    ledger: report.ledger_frozen,
                    wallet: wallet.frozen(),
                });
            }
            if report.entries != wallet.version() {
                report.issues.push(ReconcileIssue::VersionMismatch {
                    entries: report.entries,
                    wallet: wallet.version(),
                });
            }
        }
        None if report.entries > 0 => {
            report.issues.push(ReconcileIssue::MissingWallet {
                entries: report.entries,
            });
        }
        None => {}
    }

    for transfer_id in movements {
        let legs = log.entries_for_transfer(transfer_id).await?;
        if let Err(problem) = verify_movement(&legs) {
            report.issues.push(ReconcileIssue::BrokenMovement {
                transfer_id,
                problem,
            });
        }
    }

    if !report.is_consistent() {
        warn!(wallet = %key, issues = report.issues.len(), "Wallet does not reconcile with ledger");
    }
    Ok(report)
}

/// What is wrong with the entries of one movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementIssue {
    Empty,
    MixedTransferIds,
    /// Two-legged movement whose legs do not cancel out
    Unbalanced { net: i128 },
    /// Freeze/unfreeze that changed `available + frozen`
    TotalChanged { seq: EntrySeq },
    UnexpectedShape { kinds: Vec<EntryKind> },
}

/// Check the entries sharing one transfer id against their kind's shape.
pub fn verify_movement(entries: &[LedgerEntry]) -> Result<(), MovementIssue> {
    let first = entries.first().ok_or(MovementIssue::Empty)?;
    if entries.iter().any(|e| e.transfer_id != first.transfer_id) {
        return Err(MovementIssue::MixedTransferIds);
    }

    let kinds: Vec<EntryKind> = entries.iter().map(|e| e.kind).collect();
    match kinds.as_slice() {
        [EntryKind::TransferOut, EntryKind::TransferIn]
        | [EntryKind::TransferIn, EntryKind::TransferOut]
        | [EntryKind::Fee, EntryKind::Fee] => {
            let net: i128 = entries.iter().map(LedgerEntry::total_delta).sum();
            if net != 0 {
                return Err(MovementIssue::Unbalanced { net });
            }
            Ok(())
        }
        [EntryKind::Freeze] | [EntryKind::Unfreeze] => {
            if first.total_delta() != 0 {
                return Err(MovementIssue::TotalChanged { seq: first.seq });
            }
            Ok(())
        }
        [EntryKind::Deposit] | [EntryKind::Adjustment] => Ok(()),
        _ => Err(MovementIssue::UnexpectedShape { kinds }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TransferId;
    use chrono::Utc;

    fn entry(kind: EntryKind, delta: i64, frozen_delta: i64, id: TransferId) -> LedgerEntry {
        LedgerEntry {
            seq: 1,
            wallet: WalletKey::new(1, "USD"),
            kind,
            delta,
            frozen_delta,
            counterparty: None,
            transfer_id: id,
            balance_after: 0,
            frozen_after: 0,
            wallet_version: 1,
            memo: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_balanced_transfer_passes() {
        let id = TransferId::new();
        let entries = [
            entry(EntryKind::TransferOut, -40, 0, id),
            entry(EntryKind::TransferIn, 40, 0, id),
        ];
        assert_eq!(verify_movement(&entries), Ok(()));
    }

    #[test]
    fn test_unbalanced_transfer_flagged() {
        let id = TransferId::new();
        let entries = [
            entry(EntryKind::Fee, -40, 0, id),
            entry(EntryKind::Fee, 39, 0, id),
        ];
        assert_eq!(
            verify_movement(&entries),
            Err(MovementIssue::Unbalanced { net: -1 })
        );
    }

    #[test]
    fn test_freeze_must_keep_total() {
        let id = TransferId::new();
        assert_eq!(
            verify_movement(&[entry(EntryKind::Freeze, -10, 10, id)]),
            Ok(())
        );
        assert!(matches!(
            verify_movement(&[entry(EntryKind::Unfreeze, 10, -9, id)]),
            Err(MovementIssue::TotalChanged { .. })
        ));
    }

    #[tokio::test]
    async fn test_reconcile_flags_one_legged_transfer() {
        use std::sync::Arc;

        use crate::account::StaticDirectory;
        use crate::currency::{CurrencyRegistry, default_currencies};
        use crate::ledger::NewLedgerEntry;
        use crate::store::{MemoryStorage, Storage};
        use crate::wallet::BalanceDelta;

        let storage = Arc::new(MemoryStorage::new());
        let wallets = WalletStore::new(
            storage.clone(),
            Arc::new(StaticDirectory::new([1])),
            Arc::new(CurrencyRegistry::new(&default_currencies())),
        );
        let log = LedgerLog::new(storage.clone());
        let key = WalletKey::new(1, "USD");
        let wallet = wallets.get(1, &key.currency).await.unwrap();

        // a credit booked as half a transfer: balances replay, the shape does not
        let id = TransferId::new();
        let mut tx = storage.begin().await.unwrap();
        let after = wallets
            .apply_delta(tx.as_mut(), &key, BalanceDelta::available(10), wallet.version())
            .await
            .unwrap();
        log.append(
            tx.as_mut(),
            vec![NewLedgerEntry::describe(&after, EntryKind::TransferIn, 10, 0, id, Utc::now())],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let report = reconcile_wallet(&wallets, &log, &key).await.unwrap();
        assert_eq!(report.entries, 1);
        assert_eq!(
            report.issues,
            vec![ReconcileIssue::BrokenMovement {
                transfer_id: id,
                problem: MovementIssue::UnexpectedShape {
                    kinds: vec![EntryKind::TransferIn]
                },
            }]
        );
    }

    #[test]
    fn test_shape_checks() {
        let id = TransferId::new();
        assert_eq!(verify_movement(&[]), Err(MovementIssue::Empty));
        assert!(matches!(
            verify_movement(&[entry(EntryKind::TransferOut, -5, 0, id)]),
            Err(MovementIssue::UnexpectedShape { .. })
        ));
        assert_eq!(
            verify_movement(&[
                entry(EntryKind::TransferOut, -5, 0, id),
                entry(EntryKind::TransferIn, 5, 0, TransferId::new()),
            ]),
            Err(MovementIssue::MixedTransferIds)
        );
    }
}
