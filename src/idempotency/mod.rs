//! Idempotency records
//!
//! A caller token, scoped by owner, binds a request to the single outcome
//! of its first completed attempt. The record is settled in the same
//! storage unit as the ledger entries it describes.

pub mod guard;

pub use guard::{GuardConfig, IdempotencyGuard, PendingReservation, Reservation};

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::OwnerId;
use crate::engine::{Operation, Outcome};

/// Longest accepted caller token, in bytes.
pub const MAX_TOKEN_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub owner: OwnerId,
    pub token: String,
}

impl IdempotencyKey {
    pub fn new(owner: OwnerId, token: impl Into<String>) -> Self {
        Self {
            owner,
            token: token.into(),
        }
    }

    /// Token must be non-empty, at most [`MAX_TOKEN_LEN`] bytes, and free of
    /// control characters.
    pub fn validate(&self) -> Result<(), String> {
        if self.token.trim().is_empty() {
            return Err("idempotency token must not be empty".into());
        }
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(format!(
                "idempotency token too long: {} bytes, max {}",
                self.token.len(),
                MAX_TOKEN_LEN
            ));
        }
        if self.token.chars().any(char::is_control) {
            return Err("idempotency token contains control characters".into());
        }
        Ok(())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "outcome", rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Settled(Outcome),
}

impl IdempotencyStatus {
    /// Persisted state id (SMALLINT)
    pub fn id(&self) -> i16 {
        match self {
            IdempotencyStatus::InProgress => 1,
            IdempotencyStatus::Settled(_) => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub operation: Operation,
    pub status: IdempotencyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// `created_at` identifies the reservation. It is kept at microsecond
    /// precision so it survives a `TIMESTAMPTZ` round trip unchanged.
    pub fn in_progress(key: IdempotencyKey, operation: Operation, now: DateTime<Utc>) -> Self {
        let now = now.trunc_subsecs(6);
        Self {
            key,
            operation,
            status: IdempotencyStatus::InProgress,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn settle(self, outcome: Outcome, now: DateTime<Utc>) -> Self {
        Self {
            status: IdempotencyStatus::Settled(outcome),
            updated_at: now,
            ..self
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.status {
            IdempotencyStatus::Settled(outcome) => Some(outcome),
            IdempotencyStatus::InProgress => None,
        }
    }

    #[inline]
    pub fn is_settled(&self) -> bool {
        matches!(self.status, IdempotencyStatus::Settled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;
    use crate::engine::Rejection;
    use crate::wallet::WalletKey;

    fn deposit() -> Operation {
        Operation::Deposit {
            owner: 1,
            currency: Currency::new("USD"),
            amount: 100,
        }
    }

    #[test]
    fn test_token_validation() {
        assert!(IdempotencyKey::new(1, "tok-1").validate().is_ok());
        assert!(IdempotencyKey::new(1, "").validate().is_err());
        assert!(IdempotencyKey::new(1, "   ").validate().is_err());
        assert!(IdempotencyKey::new(1, "a\nb").validate().is_err());
        assert!(IdempotencyKey::new(1, "x".repeat(MAX_TOKEN_LEN)).validate().is_ok());
        assert!(
            IdempotencyKey::new(1, "x".repeat(MAX_TOKEN_LEN + 1))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_key_scoped_by_owner() {
        assert_ne!(IdempotencyKey::new(1, "t"), IdempotencyKey::new(2, "t"));
        assert_eq!(IdempotencyKey::new(7, "abc").to_string(), "7:abc");
    }

    #[test]
    fn test_settle_keeps_identity() {
        let now = Utc::now();
        let record = IdempotencyRecord::in_progress(IdempotencyKey::new(1, "t"), deposit(), now);
        assert!(!record.is_settled());
        assert_eq!(record.status.id(), 1);

        let outcome = Outcome::Rejected(Rejection::InsufficientFunds {
            wallet: WalletKey::new(1, "USD"),
        });
        let later = now + chrono::Duration::seconds(1);
        let settled = record.clone().settle(outcome.clone(), later);
        assert!(settled.is_settled());
        assert_eq!(settled.outcome(), Some(&outcome));
        assert_eq!(settled.created_at, record.created_at);
        assert_eq!(record.created_at.timestamp_subsec_nanos() % 1_000, 0);
        assert_eq!(settled.updated_at, later);
        assert_eq!(settled.key, record.key);
        assert_eq!(settled.status.id(), 2);
    }

    #[test]
    fn test_status_json_shape() {
        let json = serde_json::to_string(&IdempotencyStatus::InProgress).unwrap();
        assert_eq!(json, r#"{"state":"in_progress"}"#);
    }
}
