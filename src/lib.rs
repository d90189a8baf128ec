//! Wallet Ledger - multi-currency wallets with an append-only ledger
//!
//! Every balance change is a ledger entry written in the same storage unit
//! as the wallet row it changes. Requests carry an idempotency token so a
//! retried call never moves money twice.
//!
//! # Modules
//!
//! - [`engine`] - Transfer engine (validate, reserve, lock, commit)
//! - [`wallet`] - Wallet rows and the wallet store
//! - [`ledger`] - Ledger entries and the log reader
//! - [`idempotency`] - Request keys and the idempotency guard
//! - [`lock`] - Per-wallet critical sections
//! - [`store`] - Storage seam with in-memory and PostgreSQL backends
//! - [`audit`] - Reconciliation of wallets against the ledger
//! - [`worker`] - Background purge and reconciliation sweep

// Core types - must be first!
pub mod core_types;

pub mod currency;
pub mod money;

// Ledger components
pub mod account;
pub mod audit;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod lock;
pub mod store;
pub mod views;
pub mod wallet;
pub mod worker;

// Service plumbing
pub mod config;
pub mod db;
pub mod logging;

// Convenient re-exports at crate root
pub use account::{AccountDirectory, PgAccountDirectory, StaticDirectory};
pub use core_types::{Amount, EntrySeq, OwnerId, SignedAmount};
pub use currency::{Currency, CurrencyRegistry, CurrencySpec};
pub use engine::{EngineConfig, HistoryPage, LedgerEngine, Page, PostingResult, TransferResult};
pub use error::LedgerError;
pub use ledger::{EntryKind, LedgerEntry, TransferId};
pub use store::{MemoryStorage, PgStorage, Storage, StoreError};
pub use wallet::{BalanceSnapshot, Wallet, WalletKey};
pub use worker::{MaintenanceWorker, WorkerConfig};
