//! Ledger Error Types
//!
//! Errors surfaced by the engine's public operations. Lower layers keep
//! their own enums and are mapped here at the engine boundary.

use thiserror::Error;

use crate::core_types::OwnerId;
use crate::engine::Rejection;
use crate::lock::LockError;
use crate::money::MoneyError;
use crate::store::StoreError;
use crate::wallet::WalletKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // === Caller Errors ===
    #[error("Invalid request: {0}")]
    InvalidTransfer(String),

    #[error("Unknown owner: {0}")]
    UnknownOwner(OwnerId),

    #[error("Insufficient funds in wallet {wallet}")]
    InsufficientFunds { wallet: WalletKey },

    // === Contention (retry with the same token) ===
    #[error("Concurrent modification, gave up after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("Timed out waiting for wallet locks")]
    LockTimeout,

    #[error("A request with this idempotency key is still in progress")]
    Busy,

    // === System Errors ===
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected failure: {0}")]
    Unknown(String),
}

impl LedgerError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidTransfer(_) => "INVALID_TRANSFER",
            LedgerError::UnknownOwner(_) => "UNKNOWN_OWNER",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::Conflict { .. } => "CONFLICT",
            LedgerError::LockTimeout => "LOCK_TIMEOUT",
            LedgerError::Busy => "BUSY",
            LedgerError::Unavailable(_) => "UNAVAILABLE",
            LedgerError::Unknown(_) => "UNKNOWN",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::InvalidTransfer(_) => 400,
            LedgerError::UnknownOwner(_) => 404,
            LedgerError::InsufficientFunds { .. } => 422,
            LedgerError::Conflict { .. } | LedgerError::Busy => 409,
            LedgerError::LockTimeout | LedgerError::Unavailable(_) => 503,
            LedgerError::Unknown(_) => 500,
        }
    }

    /// Whether resubmitting with the same idempotency token may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Conflict { .. }
                | LedgerError::LockTimeout
                | LedgerError::Busy
                | LedgerError::Unavailable(_)
        )
    }

    pub fn from_rejection(rejection: Rejection) -> Self {
        match rejection {
            Rejection::InsufficientFunds { wallet } => LedgerError::InsufficientFunds { wallet },
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict { .. } => LedgerError::Conflict { attempts: 1 },
            StoreError::InsufficientFunds(wallet) => LedgerError::InsufficientFunds { wallet },
            StoreError::Overflow(key) => {
                LedgerError::InvalidTransfer(format!("balance of wallet {} would overflow", key))
            }
            StoreError::StorageFailure(msg) => LedgerError::Unavailable(msg),
            StoreError::WalletNotFound(key) => {
                LedgerError::Unknown(format!("wallet {} vanished during the unit", key))
            }
            StoreError::Corrupt(msg) => LedgerError::Unknown(msg),
            StoreError::ReservationLost(_) => LedgerError::Busy,
        }
    }
}

impl From<LockError> for LedgerError {
    fn from(_: LockError) -> Self {
        LedgerError::LockTimeout
    }
}

impl From<MoneyError> for LedgerError {
    fn from(e: MoneyError) -> Self {
        LedgerError::InvalidTransfer(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::IdempotencyKey;

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerError::Busy.code(), "BUSY");
        assert_eq!(
            LedgerError::InsufficientFunds {
                wallet: WalletKey::new(1, "USD")
            }
            .code(),
            "INSUFFICIENT_FUNDS"
        );
        assert_eq!(LedgerError::UnknownOwner(9).code(), "UNKNOWN_OWNER");
    }

    #[test]
    fn test_retryable_split() {
        assert!(LedgerError::Conflict { attempts: 5 }.is_retryable());
        assert!(LedgerError::LockTimeout.is_retryable());
        assert!(LedgerError::Unavailable("down".into()).is_retryable());
        assert!(!LedgerError::InvalidTransfer("x".into()).is_retryable());
        assert!(!LedgerError::UnknownOwner(1).is_retryable());
        assert!(!LedgerError::Unknown("panic".into()).is_retryable());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(LedgerError::InvalidTransfer("x".into()).http_status(), 400);
        assert_eq!(LedgerError::Busy.http_status(), 409);
        assert_eq!(LedgerError::Unknown("x".into()).http_status(), 500);
    }

    #[test]
    fn test_store_error_mapping() {
        let key = WalletKey::new(1, "USD");
        assert_eq!(
            LedgerError::from(StoreError::InsufficientFunds(key.clone())),
            LedgerError::InsufficientFunds { wallet: key }
        );
        assert_eq!(
            LedgerError::from(StoreError::StorageFailure("io".into())),
            LedgerError::Unavailable("io".into())
        );
        assert_eq!(
            LedgerError::from(StoreError::ReservationLost(IdempotencyKey::new(1, "t"))),
            LedgerError::Busy
        );
    }

    #[test]
    fn test_display() {
        let err = LedgerError::Conflict { attempts: 3 };
        assert_eq!(
            err.to_string(),
            "Concurrent modification, gave up after 3 attempts"
        );
    }
}
