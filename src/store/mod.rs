//! Storage context
//!
//! Backend seam shared by the wallet store, the ledger log and the
//! idempotency guard. Every component receives an `Arc<dyn Storage>` at
//! construction; there is no process-wide handle.
//!
//! # Atomic units
//!
//! All balance mutations happen inside a [`StorageTx`]. Its staged effects
//! (wallet deltas, ledger entries, idempotency outcome) become visible
//! together on [`StorageTx::commit`] or not at all. Dropping a transaction
//! without committing rolls it back.

pub mod memory;
pub mod postgres;

pub use memory::{FaultPlan, MemoryStorage};
pub use postgres::PgStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core_types::OwnerId;
use crate::idempotency::{IdempotencyKey, IdempotencyRecord};
use crate::ledger::{EntryQuery, LedgerEntry, NewLedgerEntry, TransferId};
use crate::wallet::{BalanceDelta, BalanceError, Wallet, WalletKey};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Version conflict on wallet {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: WalletKey,
        expected: u64,
        actual: u64,
    },

    #[error("Insufficient funds in wallet {0}")]
    InsufficientFunds(WalletKey),

    #[error("Balance overflow in wallet {0}")]
    Overflow(WalletKey),

    #[error("Wallet not found: {0}")]
    WalletNotFound(WalletKey),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// The key was taken over by a later attempt; this one must not settle it
    #[error("Idempotency reservation {0} no longer held")]
    ReservationLost(IdempotencyKey),
}

impl StoreError {
    pub(crate) fn from_balance(key: &WalletKey, err: BalanceError) -> Self {
        match err {
            BalanceError::InsufficientAvailable | BalanceError::InsufficientFrozen => {
                StoreError::InsufficientFunds(key.clone())
            }
            BalanceError::Overflow => StoreError::Overflow(key.clone()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::StorageFailure(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Result of trying to reserve an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    /// The key is now held by the caller (new, or taken over after expiry)
    Reserved,
    /// Someone else holds or settled the key
    Existing(IdempotencyRecord),
}

/// Persistence backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Open an atomic unit.
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError>;

    async fn load_wallet(&self, key: &WalletKey) -> Result<Option<Wallet>, StoreError>;

    /// Insert a zero-balance wallet unless one exists; returns the stored wallet.
    async fn create_wallet_if_absent(&self, key: &WalletKey) -> Result<Wallet, StoreError>;

    async fn list_wallets(&self, owner: OwnerId) -> Result<Vec<Wallet>, StoreError>;

    /// Wallet keys in key order strictly after `after`.
    async fn wallet_keys(
        &self,
        after: Option<&WalletKey>,
        limit: usize,
    ) -> Result<Vec<WalletKey>, StoreError>;

    /// Entries of one wallet in `seq` order.
    async fn entries_page(
        &self,
        key: &WalletKey,
        query: &EntryQuery,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn entries_by_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Insert `record` as in-progress unless the key exists. An in-progress
    /// record reserved before `stale_before` is taken over.
    async fn reserve_idempotency(
        &self,
        record: &IdempotencyRecord,
        stale_before: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError>;

    async fn load_idempotency(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Drop the in-progress reservation `record` made. Settled records and
    /// reservations taken over since are left alone.
    async fn release_idempotency(&self, record: &IdempotencyRecord) -> Result<(), StoreError>;

    /// Settle the reservation made at `record.created_at`, outside of any unit.
    ///
    /// # Errors
    /// - `ReservationLost` if the key is settled or held by a later reservation
    async fn settle_idempotency(&self, record: &IdempotencyRecord) -> Result<(), StoreError>;

    /// Delete settled records last updated before `settled_before`.
    async fn purge_idempotency(&self, settled_before: DateTime<Utc>) -> Result<u64, StoreError>;
}

impl std::fmt::Debug for dyn Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Storage({})", self.name())
    }
}

/// Scoped storage transaction.
#[async_trait]
pub trait StorageTx: Send {
    /// Compare-and-set balance update.
    ///
    /// # Errors
    /// - `VersionConflict` if the wallet is no longer at `expected_version`
    /// - `InsufficientFunds` if a side would go negative
    /// - `WalletNotFound` if the wallet does not exist
    async fn apply_delta(
        &mut self,
        key: &WalletKey,
        delta: BalanceDelta,
        expected_version: u64,
    ) -> Result<Wallet, StoreError>;

    async fn append_entries(&mut self, entries: Vec<NewLedgerEntry>) -> Result<(), StoreError>;

    /// Stage a settled idempotency record with this unit. The same fence as
    /// [`Storage::settle_idempotency`] applies; a lost reservation fails the
    /// unit (at the latest on commit) and nothing is published.
    async fn settle_idempotency(&mut self, record: IdempotencyRecord) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
