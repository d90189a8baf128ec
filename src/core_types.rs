//! Core types used throughout the ledger
//!
//! These are fundamental type aliases used by all modules.

/// Owner ID - globally unique account identifier, immutable after assignment.
///
/// # Usage:
/// - First half of a [`crate::wallet::WalletKey`]
/// - Scope of idempotency keys
pub type OwnerId = u64;

/// Ledger entry sequence number.
///
/// Assigned by the storage backend at commit time. Strictly increasing
/// across the whole ledger, so it doubles as the entry id and as the
/// history cursor.
pub type EntrySeq = u64;

/// Amount in minor units of a currency (e.g. cents for USD).
pub type Amount = u64;

/// Signed change of an amount in minor units.
pub type SignedAmount = i64;
