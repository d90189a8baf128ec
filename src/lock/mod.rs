//! Concurrency coordinator
//!
//! Per-wallet exclusive sections. Keys are always acquired in [`WalletKey`]
//! order, so two movements touching the same wallets can never wait on each
//! other in a cycle. Movements on disjoint wallets never contend.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::wallet::WalletKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for wallet {key}")]
    Timeout { key: WalletKey, waited: Duration },
}

type Sections = DashMap<WalletKey, Arc<Mutex<()>>>;

/// Hands out ordered sets of per-wallet sections.
#[derive(Clone, Default)]
pub struct LockCoordinator {
    sections: Arc<Sections>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every key (sorted, deduplicated) under one shared deadline.
    ///
    /// On timeout the sections acquired so far are released before the
    /// error is returned.
    pub async fn acquire(
        &self,
        keys: &[WalletKey],
        timeout: Duration,
    ) -> Result<WalletLocks, LockError> {
        let mut ordered = keys.to_vec();
        ordered.sort();
        ordered.dedup();

        let deadline = Instant::now() + timeout;
        let mut locks = WalletLocks {
            keys: Vec::with_capacity(ordered.len()),
            guards: Vec::with_capacity(ordered.len()),
            sections: self.sections.clone(),
        };

        for key in ordered {
            let section = self
                .sections
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            locks.keys.push(key.clone());

            match tokio::time::timeout_at(deadline, section.lock_owned()).await {
                Ok(guard) => locks.guards.push(guard),
                Err(_) => {
                    warn!(wallet = %key, waited_ms = timeout.as_millis() as u64, "Lock acquisition timed out");
                    return Err(LockError::Timeout {
                        key,
                        waited: timeout,
                    });
                }
            }
        }

        debug!(wallets = locks.keys.len(), "Wallet locks acquired");
        Ok(locks)
    }

    /// Number of per-key sections currently tracked (held or awaited).
    pub fn active_sections(&self) -> usize {
        self.sections.len()
    }
}

/// Held wallet sections; released on drop.
pub struct WalletLocks {
    keys: Vec<WalletKey>,
    guards: Vec<OwnedMutexGuard<()>>,
    sections: Arc<Sections>,
}

impl WalletLocks {
    pub fn keys(&self) -> &[WalletKey] {
        &self.keys[..self.guards.len()]
    }

    pub fn holds(&self, key: &WalletKey) -> bool {
        self.keys().contains(key)
    }
}

impl Drop for WalletLocks {
    fn drop(&mut self) {
        // Release in reverse acquisition order, then evict idle sections.
        while self.guards.pop().is_some() {}
        for key in &self.keys {
            self.sections
                .remove_if(key, |_, section| Arc::strong_count(section) == 1);
        }
    }
}

impl std::fmt::Debug for WalletLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletLocks")
            .field("keys", &self.keys())
            .finish()
    }
}
