//! In-memory storage
//!
//! Optimistic units over one shared state. A unit reads through the shared
//! mutex, stages its writes privately, and at commit re-validates the base
//! version of every staged wallet before publishing everything at once.
//! The mutex is never held across an await point.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{ReserveOutcome, Storage, StorageTx, StoreError};
use crate::core_types::{EntrySeq, OwnerId};
use crate::idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus};
use crate::ledger::{EntryQuery, LedgerEntry, NewLedgerEntry, TransferId};
use crate::wallet::{BalanceDelta, Wallet, WalletKey};

/// Failures injected into the next units, for crash and contention tests.
#[derive(Debug, Default)]
pub struct FaultPlan {
    commit_failures: AtomicUsize,
    commit_panics: AtomicUsize,
    version_conflicts: AtomicUsize,
}

impl FaultPlan {
    /// The next `n` commits fail before publishing anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.commit_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` commits panic before touching the shared state.
    pub fn panic_next_commits(&self, n: usize) {
        self.commit_panics.store(n, Ordering::SeqCst);
    }

    /// The next `n` `apply_delta` calls report a version conflict.
    pub fn conflict_next_deltas(&self, n: usize) {
        self.version_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.fail_next_commits(0);
        self.panic_next_commits(0);
        self.conflict_next_deltas(0);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct MemoryState {
    wallets: BTreeMap<WalletKey, Wallet>,
    entries: Vec<LedgerEntry>,
    by_wallet: HashMap<WalletKey, Vec<usize>>,
    by_transfer: HashMap<TransferId, Vec<usize>>,
    idempotency: HashMap<IdempotencyKey, IdempotencyRecord>,
    next_seq: EntrySeq,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            wallets: BTreeMap::new(),
            entries: Vec::new(),
            by_wallet: HashMap::new(),
            by_transfer: HashMap::new(),
            idempotency: HashMap::new(),
            next_seq: 1,
        }
    }

    /// Whether the key is still in progress under the reservation `record` made.
    fn holds_reservation(&self, record: &IdempotencyRecord) -> bool {
        self.idempotency.get(&record.key).is_some_and(|stored| {
            matches!(stored.status, IdempotencyStatus::InProgress)
                && stored.created_at == record.created_at
        })
    }

    fn push_entry(&mut self, entry: NewLedgerEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let idx = self.entries.len();
        self.by_wallet.entry(entry.wallet.clone()).or_default().push(idx);
        self.by_transfer.entry(entry.transfer_id).or_default().push(idx);
        self.entries.push(entry.into_entry(seq));
    }
}

/// Process-local storage backend.
#[derive(Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<FaultPlan>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::new())),
            faults: Arc::new(FaultPlan::default()),
        }
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Number of committed ledger entries.
    pub fn entry_count(&self) -> Result<usize, StoreError> {
        Ok(lock(&self.state)?.entries.len())
    }

    /// Every committed wallet in key order.
    pub fn all_wallets(&self) -> Result<Vec<Wallet>, StoreError> {
        Ok(lock(&self.state)?.wallets.values().cloned().collect())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(state: &Mutex<MemoryState>) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
    state
        .lock()
        .map_err(|_| StoreError::StorageFailure("memory state poisoned".into()))
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            state: self.state.clone(),
            faults: self.faults.clone(),
            base_versions: HashMap::new(),
            staged: HashMap::new(),
            entries: Vec::new(),
            settlements: Vec::new(),
        }))
    }

    async fn load_wallet(&self, key: &WalletKey) -> Result<Option<Wallet>, StoreError> {
        Ok(lock(&self.state)?.wallets.get(key).cloned())
    }

    async fn create_wallet_if_absent(&self, key: &WalletKey) -> Result<Wallet, StoreError> {
        let mut state = lock(&self.state)?;
        let wallet = state
            .wallets
            .entry(key.clone())
            .or_insert_with(|| Wallet::zero(key.clone(), Utc::now()));
        Ok(wallet.clone())
    }

    async fn list_wallets(&self, owner: OwnerId) -> Result<Vec<Wallet>, StoreError> {
        let state = lock(&self.state)?;
        Ok(state
            .wallets
            .values()
            .filter(|w| w.key().owner == owner)
            .cloned()
            .collect())
    }

    async fn wallet_keys(
        &self,
        after: Option<&WalletKey>,
        limit: usize,
    ) -> Result<Vec<WalletKey>, StoreError> {
        let state = lock(&self.state)?;
        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        Ok(state
            .wallets
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn entries_page(
        &self,
        key: &WalletKey,
        query: &EntryQuery,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = lock(&self.state)?;
        let Some(indices) = state.by_wallet.get(key) else {
            return Ok(Vec::new());
        };
        let after = query.after.unwrap_or(0);
        let until = query.until.unwrap_or(EntrySeq::MAX);
        Ok(indices
            .iter()
            .map(|&idx| &state.entries[idx])
            .filter(|e| e.seq > after && e.seq <= until)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn entries_by_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = lock(&self.state)?;
        Ok(state
            .by_transfer
            .get(&transfer_id)
            .map(|indices| indices.iter().map(|&idx| state.entries[idx].clone()).collect())
            .unwrap_or_default())
    }

    async fn reserve_idempotency(
        &self,
        record: &IdempotencyRecord,
        stale_before: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut state = lock(&self.state)?;
        if let Some(existing) = state.idempotency.get(&record.key) {
            let abandoned = matches!(existing.status, IdempotencyStatus::InProgress)
                && existing.updated_at < stale_before;
            if !abandoned {
                return Ok(ReserveOutcome::Existing(existing.clone()));
            }
            debug!(key = %record.key, "Taking over abandoned reservation");
        }
        state.idempotency.insert(record.key.clone(), record.clone());
        Ok(ReserveOutcome::Reserved)
    }

    async fn load_idempotency(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(lock(&self.state)?.idempotency.get(key).cloned())
    }

    async fn release_idempotency(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        let mut state = lock(&self.state)?;
        if state.holds_reservation(record) {
            state.idempotency.remove(&record.key);
        }
        Ok(())
    }

    async fn settle_idempotency(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        let mut state = lock(&self.state)?;
        if !state.holds_reservation(record) {
            return Err(StoreError::ReservationLost(record.key.clone()));
        }
        state.idempotency.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn purge_idempotency(&self, settled_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = lock(&self.state)?;
        let before = state.idempotency.len();
        state
            .idempotency
            .retain(|_, r| !(r.is_settled() && r.updated_at < settled_before));
        Ok((before - state.idempotency.len()) as u64)
    }
}

struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<FaultPlan>,
    /// Committed version each staged wallet was read at
    base_versions: HashMap<WalletKey, u64>,
    staged: HashMap<WalletKey, Wallet>,
    entries: Vec<NewLedgerEntry>,
    settlements: Vec<IdempotencyRecord>,
}

#[async_trait]
impl StorageTx for MemoryTx {
    async fn apply_delta(
        &mut self,
        key: &WalletKey,
        delta: BalanceDelta,
        expected_version: u64,
    ) -> Result<Wallet, StoreError> {
        let current = match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => lock(&self.state)?
                .wallets
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::WalletNotFound(key.clone()))?,
        };

        if current.version() != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                actual: current.version(),
            });
        }
        if FaultPlan::take(&self.faults.version_conflicts) {
            return Err(StoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                actual: expected_version + 1,
            });
        }

        let next = current
            .apply(delta, Utc::now())
            .map_err(|e| StoreError::from_balance(key, e))?;
        self.base_versions
            .entry(key.clone())
            .or_insert(current.version());
        self.staged.insert(key.clone(), next.clone());
        Ok(next)
    }

    async fn append_entries(&mut self, entries: Vec<NewLedgerEntry>) -> Result<(), StoreError> {
        self.entries.extend(entries);
        Ok(())
    }

    async fn settle_idempotency(&mut self, record: IdempotencyRecord) -> Result<(), StoreError> {
        self.settlements.push(record);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        if FaultPlan::take(&this.faults.commit_panics) {
            panic!("injected commit panic");
        }
        let mut state = lock(&this.state)?;

        for (key, base) in &this.base_versions {
            let actual = state
                .wallets
                .get(key)
                .map(Wallet::version)
                .ok_or_else(|| StoreError::WalletNotFound(key.clone()))?;
            if actual != *base {
                return Err(StoreError::VersionConflict {
                    key: key.clone(),
                    expected: *base,
                    actual,
                });
            }
        }
        if let Some(lost) = this.settlements.iter().find(|r| !state.holds_reservation(r)) {
            return Err(StoreError::ReservationLost(lost.key.clone()));
        }
        if FaultPlan::take(&this.faults.commit_failures) {
            return Err(StoreError::StorageFailure("injected commit failure".into()));
        }

        for (key, wallet) in this.staged {
            state.wallets.insert(key, wallet);
        }
        for entry in this.entries {
            state.push_entry(entry);
        }
        for record in this.settlements {
            state.idempotency.insert(record.key.clone(), record);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
