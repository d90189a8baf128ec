//! Wallet store
//!
//! Resolves (owner, currency) to a wallet, creating zero-balance wallets
//! on first access for owners the account directory confirms. Balance
//! changes are only accepted inside a caller-provided storage unit.

use std::sync::Arc;

use tracing::info;

use super::{BalanceDelta, Wallet, WalletKey};
use crate::account::AccountDirectory;
use crate::core_types::OwnerId;
use crate::currency::{Currency, CurrencyRegistry};
use crate::error::LedgerError;
use crate::store::{Storage, StorageTx, StoreError};

#[derive(Clone)]
pub struct WalletStore {
    storage: Arc<dyn Storage>,
    accounts: Arc<dyn AccountDirectory>,
    currencies: Arc<CurrencyRegistry>,
}

impl WalletStore {
    pub fn new(
        storage: Arc<dyn Storage>,
        accounts: Arc<dyn AccountDirectory>,
        currencies: Arc<CurrencyRegistry>,
    ) -> Self {
        Self {
            storage,
            accounts,
            currencies,
        }
    }

    pub fn currencies(&self) -> &CurrencyRegistry {
        &self.currencies
    }

    pub fn ensure_currency(&self, currency: &Currency) -> Result<(), LedgerError> {
        if self.currencies.is_recognized(currency) {
            Ok(())
        } else {
            Err(LedgerError::InvalidTransfer(format!(
                "unrecognized currency {}",
                currency
            )))
        }
    }

    /// Wallet of `owner` in `currency`, created on first access.
    ///
    /// # Errors
    /// - `InvalidTransfer` for an unrecognized currency
    /// - `UnknownOwner` if the wallet is absent and the directory does not know the owner
    pub async fn get(&self, owner: OwnerId, currency: &Currency) -> Result<Wallet, LedgerError> {
        self.ensure_currency(currency)?;
        let key = WalletKey::new(owner, currency.clone());
        if let Some(wallet) = self.storage.load_wallet(&key).await? {
            return Ok(wallet);
        }
        self.create(&key).await
    }

    /// Plain read, never creates.
    pub async fn find(&self, key: &WalletKey) -> Result<Option<Wallet>, LedgerError> {
        Ok(self.storage.load_wallet(key).await?)
    }

    /// One wallet per recognized currency, in currency order.
    pub async fn list(&self, owner: OwnerId) -> Result<Vec<Wallet>, LedgerError> {
        let mut existing = self.storage.list_wallets(owner).await?;
        let mut wallets = Vec::with_capacity(self.currencies.len());
        let mut owner_checked = !existing.is_empty();

        for currency in self.currencies.currencies() {
            let key = WalletKey::new(owner, currency.clone());
            if let Some(pos) = existing.iter().position(|w| w.key() == &key) {
                wallets.push(existing.swap_remove(pos));
                continue;
            }
            if !owner_checked {
                self.ensure_owner(owner).await?;
                owner_checked = true;
            }
            wallets.push(self.storage.create_wallet_if_absent(&key).await?);
        }
        Ok(wallets)
    }

    /// Compare-and-set balance change inside `tx`.
    pub async fn apply_delta(
        &self,
        tx: &mut dyn StorageTx,
        key: &WalletKey,
        delta: BalanceDelta,
        expected_version: u64,
    ) -> Result<Wallet, StoreError> {
        tx.apply_delta(key, delta, expected_version).await
    }

    async fn ensure_owner(&self, owner: OwnerId) -> Result<(), LedgerError> {
        if self.accounts.exists(owner).await? {
            Ok(())
        } else {
            Err(LedgerError::UnknownOwner(owner))
        }
    }

    async fn create(&self, key: &WalletKey) -> Result<Wallet, LedgerError> {
        self.ensure_owner(key.owner).await?;
        let wallet = self.storage.create_wallet_if_absent(key).await?;
        info!(wallet = %key, "Wallet created");
        Ok(wallet)
    }
}
