//! Idempotency guard
//!
//! `check_or_reserve` either hands out a [`PendingReservation`] (the caller
//! is the first attempt), replays a settled outcome, or reports that another
//! attempt still holds the key.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus};
use crate::engine::{Operation, Outcome, Rejection};
use crate::store::{ReserveOutcome, Storage, StorageTx, StoreError};

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// How long to wait for an in-flight attempt before reporting it
    pub busy_wait: Duration,
    pub poll_interval: Duration,
    /// Reservations older than this are treated as abandoned
    pub reservation_ttl: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            busy_wait: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            reservation_ttl: Duration::from_secs(30),
        }
    }
}

/// Result of [`IdempotencyGuard::check_or_reserve`].
#[derive(Debug)]
pub enum Reservation {
    /// First attempt: proceed, then settle through the reservation
    Fresh(PendingReservation),
    /// Replay the outcome of the first completed attempt
    Settled(Outcome),
    /// Another attempt still holds the key after the wait
    InProgress,
    /// The key was first used with a different operation
    KeyReused,
}

/// In-progress claim on a key.
///
/// Dropping it without settling releases the key in the background, so a
/// cancelled or failed attempt never blocks retries for longer than it takes
/// the release to run.
#[derive(Debug)]
pub struct PendingReservation {
    record: IdempotencyRecord,
    storage: Arc<dyn Storage>,
    armed: bool,
}

impl PendingReservation {
    pub fn key(&self) -> &IdempotencyKey {
        &self.record.key
    }

    pub fn operation(&self) -> &Operation {
        &self.record.operation
    }

    /// Identity of this reservation; a takeover replaces it.
    pub fn reserved_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    fn settled_record(&self, outcome: Outcome) -> IdempotencyRecord {
        self.record.clone().settle(outcome, Utc::now())
    }

    /// The staged outcome was committed; the key stays settled.
    pub fn mark_settled(mut self) {
        self.armed = false;
    }

    /// Release the key now instead of on drop.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.armed = false;
        self.storage.release_idempotency(&self.record).await
    }
}

impl Drop for PendingReservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let record = self.record.clone();
        let key = record.key.clone();
        match Handle::try_current() {
            Ok(handle) => {
                let storage = self.storage.clone();
                handle.spawn(async move {
                    match storage.release_idempotency(&record).await {
                        Ok(()) => debug!(key = %key, "Released idempotency reservation"),
                        Err(e) => warn!(
                            key = %key,
                            error = %e,
                            "Failed to release reservation, left to expire"
                        ),
                    }
                });
            }
            Err(_) => warn!(key = %key, "No runtime to release reservation, left to expire"),
        }
    }
}

pub struct IdempotencyGuard {
    storage: Arc<dyn Storage>,
    config: GuardConfig,
}

impl IdempotencyGuard {
    pub fn new(storage: Arc<dyn Storage>, config: GuardConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Reserve `key` for `operation`, or report what already holds it.
    pub async fn check_or_reserve(
        &self,
        key: IdempotencyKey,
        operation: Operation,
    ) -> Result<Reservation, StoreError> {
        let deadline = Instant::now() + self.config.busy_wait;

        loop {
            let now = Utc::now();
            let record = IdempotencyRecord::in_progress(key.clone(), operation.clone(), now);
            let stale_before = stale_cutoff(now, self.config.reservation_ttl);

            let existing = match self.storage.reserve_idempotency(&record, stale_before).await? {
                ReserveOutcome::Reserved => {
                    debug!(key = %key, op = operation.name(), "Reserved idempotency key");
                    return Ok(Reservation::Fresh(PendingReservation {
                        record,
                        storage: self.storage.clone(),
                        armed: true,
                    }));
                }
                ReserveOutcome::Existing(existing) => existing,
            };

            if existing.operation != operation {
                warn!(
                    key = %key,
                    stored = existing.operation.name(),
                    requested = operation.name(),
                    "Idempotency key reused with different arguments"
                );
                return Ok(Reservation::KeyReused);
            }

            if let IdempotencyStatus::Settled(outcome) = existing.status {
                debug!(key = %key, "Replaying settled outcome");
                return Ok(Reservation::Settled(outcome));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Reservation::InProgress);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Whether `reservation` still holds its key, i.e. no later attempt took
    /// it over as abandoned.
    pub async fn still_holds(&self, reservation: &PendingReservation) -> Result<bool, StoreError> {
        let stored = self.storage.load_idempotency(reservation.key()).await?;
        Ok(stored.is_some_and(|r| {
            !r.is_settled() && r.created_at == reservation.reserved_at()
        }))
    }

    pub async fn lookup(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.storage.load_idempotency(key).await
    }

    /// Stage the settled outcome inside `tx`.
    ///
    /// The reservation stays armed: call [`PendingReservation::mark_settled`]
    /// once the unit committed.
    pub async fn commit(
        &self,
        tx: &mut dyn StorageTx,
        reservation: &PendingReservation,
        outcome: Outcome,
    ) -> Result<(), StoreError> {
        tx.settle_idempotency(reservation.settled_record(outcome)).await
    }

    /// Record a terminal rejection as the key's outcome.
    pub async fn settle_rejection(
        &self,
        reservation: PendingReservation,
        rejection: Rejection,
    ) -> Result<Outcome, StoreError> {
        let outcome = Outcome::Rejected(rejection);
        let record = reservation.settled_record(outcome.clone());
        match self.storage.settle_idempotency(&record).await {
            Ok(()) => {
                reservation.mark_settled();
                Ok(outcome)
            }
            Err(e @ StoreError::ReservationLost(_)) => {
                warn!(key = %record.key, "Reservation taken over before the rejection was recorded");
                reservation.mark_settled();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove settled records older than `retention`.
    pub async fn purge(&self, retention: Duration) -> Result<u64, StoreError> {
        let cutoff = stale_cutoff(Utc::now(), retention);
        let removed = self.storage.purge_idempotency(cutoff).await?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Purged settled idempotency records");
        }
        Ok(removed)
    }
}

fn stale_cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;
    use crate::engine::{PostingResult, Settlement};
    use crate::ledger::{EntryKind, TransferId};
    use crate::store::MemoryStorage;
    use crate::wallet::{BalanceSnapshot, WalletKey};

    fn guard_with(config: GuardConfig) -> (Arc<MemoryStorage>, IdempotencyGuard) {
        let storage = Arc::new(MemoryStorage::new());
        let guard = IdempotencyGuard::new(storage.clone(), config);
        (storage, guard)
    }

    fn quick() -> GuardConfig {
        GuardConfig {
            busy_wait: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
            reservation_ttl: Duration::from_secs(30),
        }
    }

    fn deposit(amount: u64) -> Operation {
        Operation::Deposit {
            owner: 1,
            currency: Currency::new("USD"),
            amount,
        }
    }

    fn posting() -> Outcome {
        Outcome::Settled(Settlement::Posting(PostingResult {
            transfer_id: TransferId::new(),
            kind: EntryKind::Deposit,
            balance: BalanceSnapshot {
                wallet: WalletKey::new(1, "USD"),
                available: 100,
                frozen: 0,
                version: 1,
            },
        }))
    }

    fn key() -> IdempotencyKey {
        IdempotencyKey::new(1, "tok")
    }

    async fn reserve(guard: &IdempotencyGuard, op: Operation) -> PendingReservation {
        match guard.check_or_reserve(key(), op).await.unwrap() {
            Reservation::Fresh(r) => r,
            other => panic!("expected fresh reservation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_settled_outcome_replayed() {
        let (storage, guard) = guard_with(quick());
        let reservation = reserve(&guard, deposit(100)).await;
        let outcome = posting();

        let mut tx = storage.begin().await.unwrap();
        guard.commit(tx.as_mut(), &reservation, outcome.clone()).await.unwrap();
        tx.commit().await.unwrap();
        reservation.mark_settled();

        match guard.check_or_reserve(key(), deposit(100)).await.unwrap() {
            Reservation::Settled(replayed) => assert_eq!(replayed, outcome),
            other => panic!("expected settled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_key_reuse_detected() {
        let (_storage, guard) = guard_with(quick());
        let reservation = reserve(&guard, deposit(100)).await;
        let result = guard.check_or_reserve(key(), deposit(200)).await.unwrap();
        assert!(matches!(result, Reservation::KeyReused));
        drop(reservation);
    }

    #[tokio::test]
    async fn test_in_flight_reports_in_progress() {
        let (_storage, guard) = guard_with(quick());
        let _held = reserve(&guard, deposit(100)).await;

        let started = Instant::now();
        let result = guard.check_or_reserve(key(), deposit(100)).await.unwrap();
        assert!(matches!(result, Reservation::InProgress));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_dropped_reservation_releases_key() {
        let (_storage, guard) = guard_with(GuardConfig {
            busy_wait: Duration::from_millis(500),
            ..quick()
        });
        let reservation = reserve(&guard, deposit(100)).await;
        drop(reservation);

        // the background release lands while the second attempt polls
        let result = guard.check_or_reserve(key(), deposit(100)).await.unwrap();
        assert!(matches!(result, Reservation::Fresh(_)));
    }

    #[tokio::test]
    async fn test_abandoned_reservation_taken_over() {
        let (_storage, guard) = guard_with(GuardConfig {
            reservation_ttl: Duration::from_millis(20),
            ..quick()
        });
        let abandoned = reserve(&guard, deposit(100)).await;
        // a crashed attempt never runs its drop
        std::mem::forget(abandoned);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let result = guard.check_or_reserve(key(), deposit(100)).await.unwrap();
        assert!(matches!(result, Reservation::Fresh(_)));
    }

    #[tokio::test]
    async fn test_taken_over_reservation_loses_the_key() {
        let (storage, guard) = guard_with(GuardConfig {
            reservation_ttl: Duration::from_millis(20),
            ..quick()
        });
        let slow = reserve(&guard, deposit(100)).await;
        assert!(guard.still_holds(&slow).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let taker = reserve(&guard, deposit(100)).await;
        assert!(!guard.still_holds(&slow).await.unwrap());
        assert!(guard.still_holds(&taker).await.unwrap());

        // the slow attempt can neither stage its outcome nor record a rejection
        let mut tx = storage.begin().await.unwrap();
        guard.commit(tx.as_mut(), &slow, posting()).await.unwrap();
        assert_eq!(
            tx.commit().await,
            Err(StoreError::ReservationLost(key()))
        );
        let rejection = Rejection::InsufficientFunds {
            wallet: WalletKey::new(1, "USD"),
        };
        assert_eq!(
            guard.settle_rejection(slow, rejection).await,
            Err(StoreError::ReservationLost(key()))
        );

        // nor release the taker's claim
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stored = guard.lookup(&key()).await.unwrap().unwrap();
        assert_eq!(stored.created_at, taker.reserved_at());
        assert!(!stored.is_settled());

        let outcome = posting();
        let mut tx = storage.begin().await.unwrap();
        guard.commit(tx.as_mut(), &taker, outcome.clone()).await.unwrap();
        tx.commit().await.unwrap();
        taker.mark_settled();
        assert_eq!(
            guard.lookup(&key()).await.unwrap().and_then(|r| r.outcome().cloned()),
            Some(outcome)
        );
    }

    #[tokio::test]
    async fn test_rejection_recorded() {
        let (_storage, guard) = guard_with(quick());
        let reservation = reserve(&guard, deposit(100)).await;
        let rejection = Rejection::InsufficientFunds {
            wallet: WalletKey::new(1, "USD"),
        };
        let outcome = guard.settle_rejection(reservation, rejection.clone()).await.unwrap();
        assert_eq!(outcome, Outcome::Rejected(rejection.clone()));

        match guard.check_or_reserve(key(), deposit(100)).await.unwrap() {
            Reservation::Settled(Outcome::Rejected(r)) => assert_eq!(r, rejection),
            other => panic!("expected recorded rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_purge_removes_only_settled() {
        let (_storage, guard) = guard_with(quick());
        let settled = reserve(&guard, deposit(100)).await;
        guard
            .settle_rejection(
                settled,
                Rejection::InsufficientFunds {
                    wallet: WalletKey::new(1, "USD"),
                },
            )
            .await
            .unwrap();
        let _in_flight = match guard
            .check_or_reserve(IdempotencyKey::new(1, "other"), deposit(5))
            .await
            .unwrap()
        {
            Reservation::Fresh(r) => r,
            other => panic!("expected fresh reservation, got {:?}", other),
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(guard.purge(Duration::ZERO).await.unwrap(), 1);
        assert!(matches!(
            guard.check_or_reserve(key(), deposit(100)).await.unwrap(),
            Reservation::Fresh(_)
        ));
    }
}
