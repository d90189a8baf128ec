//! Transfer Engine
//!
//! Every balance-affecting operation runs the same pipeline:
//!
//! ```text
//! validate -> reserve idempotency key -> lock wallets (sorted)
//!          -> read wallets -> check funds
//!          -> one storage unit: apply_delta per leg + ledger entries + settled outcome
//!          -> commit -> release locks
//! ```
//!
//! The unit runs in a spawned task that owns the wallet locks and the
//! reservation. Once spawned it completes even if the caller's future is
//! dropped; before that point a dropped request leaves nothing behind.
//!
//! # Retry semantics
//! - `VersionConflict` keeps locks and reservation, backs off, re-reads and
//!   retries up to `max_attempts`, then surfaces `Conflict`
//! - `StorageFailure` releases the reservation and surfaces `Unavailable`;
//!   the caller may retry with the same token
//! - A settled key replays its first outcome, including recorded rejections
//! - A reservation taken over as abandoned can no longer settle; the
//!   attempt reports the taker's outcome, or `Busy` while it runs

pub mod types;


pub use types::{
    HistoryPage, Operation, Outcome, Page, PostingResult, Rejection, Settlement, TransferResult,
};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, error, info, warn};

use crate::account::AccountDirectory;
use crate::audit::{self, ReconcileReport};
use crate::core_types::{Amount, OwnerId, SignedAmount};
use crate::currency::{Currency, CurrencyRegistry};
use crate::error::LedgerError;
use crate::idempotency::{
    GuardConfig, IdempotencyGuard, IdempotencyKey, IdempotencyStatus, PendingReservation,
    Reservation,
};
use crate::ledger::{
    EntryPair, EntryQuery, EntryRange, LedgerEntry, LedgerLog, NewLedgerEntry, TransferId,
};
use crate::lock::{LockCoordinator, WalletLocks};
use crate::money;
use crate::store::{Storage, StoreError};
use crate::wallet::{BalanceError, Wallet, WalletKey, WalletStore};
use types::Leg;

/// Longest accepted adjustment memo, in bytes.
pub const MAX_MEMO_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Units attempted per request before `Conflict` is surfaced
    pub max_attempts: u32,
    /// Backoff after the n-th conflict is `retry_backoff * n`
    pub retry_backoff: Duration,
    /// Shared deadline for acquiring all wallet locks of one request
    pub lock_timeout: Duration,
    pub guard: GuardConfig,
    /// Owner credited by `charge_fee`
    pub fee_collector: Option<OwnerId>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff: Duration::from_millis(5),
            lock_timeout: Duration::from_secs(2),
            guard: GuardConfig::default(),
            fee_collector: None,
        }
    }
}

/// Wallet locks and idempotency reservation of one in-flight request.
struct Held {
    locks: WalletLocks,
    reservation: PendingReservation,
}

/// Fully checked mutation, ready to commit.
struct Plan {
    operation: Operation,
    legs: Vec<(Leg, u64)>,
    transfer_id: TransferId,
}

enum Prepared {
    Ready(Plan),
    /// Terminal business failure, recorded under the key
    Rejected(Rejection),
}

enum UnitResult {
    Committed(Settlement),
    /// Someone moved a wallet underneath us; retry with the same holds
    Retry(Held, StoreError),
    Failed(StoreError),
}

/// Components the commit task needs, cloned out of the engine.
#[derive(Clone)]
struct UnitContext {
    storage: Arc<dyn Storage>,
    wallets: WalletStore,
    log: LedgerLog,
    guard: Arc<IdempotencyGuard>,
}

pub struct LedgerEngine {
    storage: Arc<dyn Storage>,
    wallets: WalletStore,
    log: LedgerLog,
    guard: Arc<IdempotencyGuard>,
    locks: LockCoordinator,
    config: EngineConfig,
}

impl LedgerEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        accounts: Arc<dyn AccountDirectory>,
        currencies: CurrencyRegistry,
        config: EngineConfig,
    ) -> Self {
        let wallets = WalletStore::new(storage.clone(), accounts, Arc::new(currencies));
        let log = LedgerLog::new(storage.clone());
        let guard = Arc::new(IdempotencyGuard::new(storage.clone(), config.guard.clone()));
        info!(
            storage = storage.name(),
            max_attempts = config.max_attempts,
            lock_timeout_ms = config.lock_timeout.as_millis() as u64,
            "Ledger engine ready"
        );
        Self {
            storage,
            wallets,
            log,
            guard,
            locks: LockCoordinator::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn wallets(&self) -> &WalletStore {
        &self.wallets
    }

    pub fn ledger(&self) -> &LedgerLog {
        &self.log
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    // ========================================================================
    // Movements
    // ========================================================================

    /// Move `amount` from `from`'s wallet to `to`'s wallet in `currency`.
    ///
    /// The idempotency token is scoped to `from`.
    pub async fn transfer(
        &self,
        from: OwnerId,
        to: OwnerId,
        currency: &Currency,
        amount: Amount,
        token: &str,
    ) -> Result<TransferResult, LedgerError> {
        validate_amount(amount)?;
        if from == to {
            return Err(LedgerError::InvalidTransfer(
                "source and destination must differ".into(),
            ));
        }
        self.wallets.ensure_currency(currency)?;

        let operation = Operation::Transfer {
            from,
            to,
            currency: currency.clone(),
            amount,
        };
        into_transfer(self.execute(operation, token).await?)
    }

    /// Credit external value into `owner`'s available balance.
    pub async fn deposit(
        &self,
        owner: OwnerId,
        currency: &Currency,
        amount: Amount,
        token: &str,
    ) -> Result<PostingResult, LedgerError> {
        validate_amount(amount)?;
        self.wallets.ensure_currency(currency)?;
        let operation = Operation::Deposit {
            owner,
            currency: currency.clone(),
            amount,
        };
        into_posting(self.execute(operation, token).await?)
    }

    /// Move `amount` from available to frozen.
    pub async fn freeze(
        &self,
        owner: OwnerId,
        currency: &Currency,
        amount: Amount,
        token: &str,
    ) -> Result<PostingResult, LedgerError> {
        validate_amount(amount)?;
        self.wallets.ensure_currency(currency)?;
        let operation = Operation::Freeze {
            owner,
            currency: currency.clone(),
            amount,
        };
        into_posting(self.execute(operation, token).await?)
    }

    /// Move `amount` from frozen back to available.
    pub async fn unfreeze(
        &self,
        owner: OwnerId,
        currency: &Currency,
        amount: Amount,
        token: &str,
    ) -> Result<PostingResult, LedgerError> {
        validate_amount(amount)?;
        self.wallets.ensure_currency(currency)?;
        let operation = Operation::Unfreeze {
            owner,
            currency: currency.clone(),
            amount,
        };
        into_posting(self.execute(operation, token).await?)
    }

    /// Move `amount` from `owner` to the configured fee collector.
    pub async fn charge_fee(
        &self,
        owner: OwnerId,
        currency: &Currency,
        amount: Amount,
        token: &str,
    ) -> Result<TransferResult, LedgerError> {
        validate_amount(amount)?;
        let collector = self.config.fee_collector.ok_or_else(|| {
            LedgerError::InvalidTransfer("no fee collector configured".into())
        })?;
        if owner == collector {
            return Err(LedgerError::InvalidTransfer(
                "fee collector cannot pay itself".into(),
            ));
        }
        self.wallets.ensure_currency(currency)?;

        let operation = Operation::Fee {
            owner,
            collector,
            currency: currency.clone(),
            amount,
        };
        into_transfer(self.execute(operation, token).await?)
    }

    /// Out-of-band correction of `owner`'s available balance.
    pub async fn adjust(
        &self,
        owner: OwnerId,
        currency: &Currency,
        delta: SignedAmount,
        memo: Option<String>,
        token: &str,
    ) -> Result<PostingResult, LedgerError> {
        if delta == 0 {
            return Err(LedgerError::InvalidTransfer(
                "adjustment must not be zero".into(),
            ));
        }
        if delta == SignedAmount::MIN {
            return Err(LedgerError::InvalidTransfer(
                "adjustment out of range".into(),
            ));
        }
        if memo.as_ref().is_some_and(|m| m.len() > MAX_MEMO_LEN) {
            return Err(LedgerError::InvalidTransfer(format!(
                "memo longer than {} bytes",
                MAX_MEMO_LEN
            )));
        }
        self.wallets.ensure_currency(currency)?;

        let operation = Operation::Adjust {
            owner,
            currency: currency.clone(),
            delta,
            memo,
        };
        into_posting(self.execute(operation, token).await?)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_balance(
        &self,
        owner: OwnerId,
        currency: &Currency,
    ) -> Result<Wallet, LedgerError> {
        self.wallets.get(owner, currency).await
    }

    /// Every wallet of `owner`, one per recognized currency.
    pub async fn get_wallets(&self, owner: OwnerId) -> Result<Vec<Wallet>, LedgerError> {
        self.wallets.list(owner).await
    }

    /// One page of history, oldest first. Feed `next` back as `Page::after`.
    pub async fn get_history(
        &self,
        owner: OwnerId,
        currency: &Currency,
        page: Page,
    ) -> Result<HistoryPage, LedgerError> {
        let wallet = self.wallets.get(owner, currency).await?;
        let limit = page.clamped_limit();
        let query = EntryQuery {
            after: page.after,
            until: None,
            limit: limit + 1,
        };
        let mut entries = self.log.page(wallet.key(), &query).await?;
        let next = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map(|e| e.seq)
        } else {
            None
        };
        Ok(HistoryPage { entries, next })
    }

    /// Lazy history stream, see [`LedgerLog::entries_for`].
    pub fn history(
        &self,
        owner: OwnerId,
        currency: &Currency,
        range: EntryRange,
    ) -> Result<BoxStream<'static, Result<LedgerEntry, LedgerError>>, LedgerError> {
        self.wallets.ensure_currency(currency)?;
        let key = WalletKey::new(owner, currency.clone());
        Ok(self
            .log
            .entries_for(key, range)
            .map_err(LedgerError::from)
            .boxed())
    }

    /// Both legs of a committed two-legged movement.
    pub async fn get_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Option<EntryPair>, LedgerError> {
        Ok(self.log.find_by_transfer_id(transfer_id).await?)
    }

    /// Every entry of any committed movement.
    pub async fn get_postings(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.log.entries_for_transfer(transfer_id).await?)
    }

    /// Replay the wallet's entries and compare with its balance row.
    pub async fn reconcile(
        &self,
        owner: OwnerId,
        currency: &Currency,
    ) -> Result<ReconcileReport, LedgerError> {
        self.wallets.ensure_currency(currency)?;
        let key = WalletKey::new(owner, currency.clone());
        Ok(audit::reconcile_wallet(&self.wallets, &self.log, &key).await?)
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    async fn execute(&self, operation: Operation, token: &str) -> Result<Settlement, LedgerError> {
        let key = IdempotencyKey::new(operation.scope_owner(), token);
        key.validate().map_err(LedgerError::InvalidTransfer)?;

        let reserved = self
            .guard
            .check_or_reserve(key.clone(), operation.clone())
            .await?;
        let reservation = match reserved {
            Reservation::Fresh(reservation) => reservation,
            Reservation::Settled(outcome) => {
                debug!(op = operation.name(), "Replaying recorded outcome");
                return replay(outcome);
            }
            Reservation::InProgress => return Err(LedgerError::Busy),
            Reservation::KeyReused => {
                return Err(LedgerError::InvalidTransfer(
                    "idempotency key already used with different arguments".into(),
                ));
            }
        };

        let legs = operation.legs();
        let keys: Vec<WalletKey> = legs.iter().map(|leg| leg.key.clone()).collect();
        let locks = self.locks.acquire(&keys, self.config.lock_timeout).await?;
        let mut held = Held { locks, reservation };

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let plan = match self.prepare(&operation, &legs).await? {
                Prepared::Ready(plan) => plan,
                Prepared::Rejected(rejection) => {
                    debug!(op = operation.name(), rejection = ?rejection, "Rejected, recording outcome");
                    let Held { locks, reservation } = held;
                    let outcome = self.guard.settle_rejection(reservation, rejection).await;
                    drop(locks);
                    return match outcome {
                        Err(StoreError::ReservationLost(_)) => {
                            self.after_takeover(&key, &operation).await
                        }
                        outcome => replay(outcome?),
                    };
                }
            };

            let context = UnitContext {
                storage: self.storage.clone(),
                wallets: self.wallets.clone(),
                log: self.log.clone(),
                guard: self.guard.clone(),
            };
            let transfer_id = plan.transfer_id;
            let task = tokio::spawn(run_unit(context, plan, held));

            match task.await {
                Ok(UnitResult::Committed(settlement)) => {
                    info!(
                        transfer_id = %transfer_id,
                        op = operation.name(),
                        attempt,
                        "Movement committed"
                    );
                    return Ok(settlement);
                }
                Ok(UnitResult::Retry(returned, cause)) => {
                    warn!(
                        transfer_id = %transfer_id,
                        op = operation.name(),
                        attempt,
                        cause = %cause,
                        "Unit conflicted"
                    );
                    if attempt == max_attempts {
                        return Err(LedgerError::Conflict {
                            attempts: max_attempts,
                        });
                    }
                    held = returned;
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    if !self.guard.still_holds(&held.reservation).await? {
                        drop(held);
                        return self.after_takeover(&key, &operation).await;
                    }
                }
                Ok(UnitResult::Failed(StoreError::ReservationLost(_))) => {
                    return self.after_takeover(&key, &operation).await;
                }
                Ok(UnitResult::Failed(e)) => {
                    error!(
                        transfer_id = %transfer_id,
                        op = operation.name(),
                        error = %e,
                        "Unit failed"
                    );
                    return Err(e.into());
                }
                Err(join_error) => {
                    error!(
                        transfer_id = %transfer_id,
                        op = operation.name(),
                        error = %join_error,
                        "Commit task aborted"
                    );
                    return Err(LedgerError::Unknown(format!(
                        "commit task aborted: {}",
                        join_error
                    )));
                }
            }
        }

        Err(LedgerError::Conflict {
            attempts: max_attempts,
        })
    }

    /// A later attempt of the same request took the key over as abandoned.
    async fn after_takeover(
        &self,
        key: &IdempotencyKey,
        operation: &Operation,
    ) -> Result<Settlement, LedgerError> {
        warn!(key = %key, op = operation.name(), "Reservation taken over by a later attempt");
        match self.guard.lookup(key).await? {
            Some(record) if record.operation == *operation => match record.status {
                IdempotencyStatus::Settled(outcome) => replay(outcome),
                IdempotencyStatus::InProgress => Err(LedgerError::Busy),
            },
            _ => Err(LedgerError::Busy),
        }
    }

    /// Read every leg's wallet and dry-run its delta.
    async fn prepare(&self, operation: &Operation, legs: &[Leg]) -> Result<Prepared, LedgerError> {
        let now = Utc::now();
        let mut planned = Vec::with_capacity(legs.len());
        for leg in legs {
            let wallet = self.wallets.get(leg.key.owner, &leg.key.currency).await?;
            match wallet.apply(leg.delta, now) {
                Ok(_) => planned.push((leg.clone(), wallet.version())),
                Err(BalanceError::InsufficientAvailable | BalanceError::InsufficientFrozen) => {
                    return Ok(Prepared::Rejected(Rejection::InsufficientFunds {
                        wallet: leg.key.clone(),
                    }));
                }
                Err(BalanceError::Overflow) => {
                    return Err(LedgerError::InvalidTransfer(format!(
                        "balance of wallet {} would overflow",
                        leg.key
                    )));
                }
            }
        }
        Ok(Prepared::Ready(Plan {
            operation: operation.clone(),
            legs: planned,
            transfer_id: TransferId::new(),
        }))
    }
}

/// Apply, append, settle and commit one unit. Runs detached from the caller.
async fn run_unit(context: UnitContext, plan: Plan, held: Held) -> UnitResult {
    match commit_unit(&context, &plan, &held.reservation).await {
        Ok(settlement) => {
            let Held { locks, reservation } = held;
            reservation.mark_settled();
            drop(locks);
            UnitResult::Committed(settlement)
        }
        Err(
            e @ (StoreError::VersionConflict { .. } | StoreError::InsufficientFunds(_)),
        ) => UnitResult::Retry(held, e),
        Err(e) => UnitResult::Failed(e),
    }
}

async fn commit_unit(
    context: &UnitContext,
    plan: &Plan,
    reservation: &PendingReservation,
) -> Result<Settlement, StoreError> {
    let now = Utc::now();
    let memo = plan.operation.memo();
    let mut tx = context.storage.begin().await?;

    let mut after = Vec::with_capacity(plan.legs.len());
    let mut entries = Vec::with_capacity(plan.legs.len());
    for (leg, expected_version) in &plan.legs {
        let wallet = context
            .wallets
            .apply_delta(tx.as_mut(), &leg.key, leg.delta, *expected_version)
            .await?;
        let mut entry = NewLedgerEntry::describe(
            &wallet,
            leg.kind,
            leg.delta.available,
            leg.delta.frozen,
            plan.transfer_id,
            now,
        )
        .with_memo(memo.clone());
        if let Some(counterparty) = &leg.counterparty {
            entry = entry.with_counterparty(counterparty.clone());
        }
        entries.push(entry);
        after.push(wallet);
    }
    context.log.append(tx.as_mut(), entries).await?;

    let settlement = settlement_for(plan, &after)?;
    context
        .guard
        .commit(tx.as_mut(), reservation, Outcome::Settled(settlement.clone()))
        .await?;
    tx.commit().await?;
    Ok(settlement)
}

fn settlement_for(plan: &Plan, after: &[Wallet]) -> Result<Settlement, StoreError> {
    let transfer_id = plan.transfer_id;
    match (plan.operation.is_two_legged(), after) {
        (true, [from, to]) => Ok(Settlement::Transfer(TransferResult {
            transfer_id,
            new_from_balance: from.snapshot(),
            new_to_balance: to.snapshot(),
        })),
        (false, [wallet]) => Ok(Settlement::Posting(PostingResult {
            transfer_id,
            kind: plan.legs[0].0.kind,
            balance: wallet.snapshot(),
        })),
        _ => Err(StoreError::Corrupt(format!(
            "{} produced {} wallet updates",
            plan.operation.name(),
            after.len()
        ))),
    }
}

fn validate_amount(amount: Amount) -> Result<(), LedgerError> {
    if amount == 0 {
        return Err(LedgerError::InvalidTransfer("amount must be positive".into()));
    }
    if !money::fits_delta(amount) {
        return Err(LedgerError::InvalidTransfer(format!(
            "amount {} exceeds the ledger's range",
            amount
        )));
    }
    Ok(())
}

fn replay(outcome: Outcome) -> Result<Settlement, LedgerError> {
    match outcome {
        Outcome::Settled(settlement) => Ok(settlement),
        Outcome::Rejected(rejection) => Err(LedgerError::from_rejection(rejection)),
    }
}

fn into_transfer(settlement: Settlement) -> Result<TransferResult, LedgerError> {
    match settlement {
        Settlement::Transfer(result) => Ok(result),
        Settlement::Posting(p) => Err(LedgerError::Unknown(format!(
            "expected a transfer settlement, got posting {}",
            p.transfer_id
        ))),
    }
}

fn into_posting(settlement: Settlement) -> Result<PostingResult, LedgerError> {
    match settlement {
        Settlement::Posting(result) => Ok(result),
        Settlement::Transfer(t) => Err(LedgerError::Unknown(format!(
            "expected a posting settlement, got transfer {}",
            t.transfer_id
        ))),
    }
}
