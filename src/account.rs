//! Account directory
//!
//! Owner existence is decided outside the ledger; wallets are only created
//! for owners the directory confirms.

use async_trait::async_trait;
use dashmap::DashSet;
use sqlx::postgres::PgPool;

use crate::core_types::OwnerId;
use crate::store::StoreError;

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn exists(&self, owner: OwnerId) -> Result<bool, StoreError>;
}

/// In-process directory seeded from configuration.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    owners: DashSet<OwnerId>,
}

impl StaticDirectory {
    pub fn new(owners: impl IntoIterator<Item = OwnerId>) -> Self {
        let set = DashSet::new();
        for owner in owners {
            set.insert(owner);
        }
        Self { owners: set }
    }

    /// Register an owner; returns `false` if already known.
    pub fn register(&self, owner: OwnerId) -> bool {
        self.owners.insert(owner)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[async_trait]
impl AccountDirectory for StaticDirectory {
    async fn exists(&self, owner: OwnerId) -> Result<bool, StoreError> {
        Ok(self.owners.contains(&owner))
    }
}

/// Directory backed by the user table of the account service.
pub struct PgAccountDirectory {
    pool: PgPool,
}

impl PgAccountDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountDirectory for PgAccountDirectory {
    async fn exists(&self, owner: OwnerId) -> Result<bool, StoreError> {
        let Ok(user_id) = i64::try_from(owner) else {
            return Ok(false);
        };
        let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM users_tb WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}
