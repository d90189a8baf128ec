//! Ledger log access
//!
//! Appends only happen inside a storage unit; reads page through committed
//! entries by `seq`.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use super::{EntryPair, EntryQuery, EntryRange, LedgerEntry, NewLedgerEntry, TransferId};
use crate::store::{Storage, StorageTx, StoreError};
use crate::wallet::WalletKey;

#[derive(Clone)]
pub struct LedgerLog {
    storage: Arc<dyn Storage>,
}

impl LedgerLog {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Stage `entries` in `tx`; they commit or vanish with it.
    pub async fn append(
        &self,
        tx: &mut dyn StorageTx,
        entries: Vec<NewLedgerEntry>,
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Err(StoreError::Corrupt(
                "refusing to append an empty entry batch".into(),
            ));
        }
        tx.append_entries(entries).await
    }

    /// Lazy, finite stream of a wallet's entries in `seq` order.
    ///
    /// Pages are fetched on demand. To resume after an interruption, pass
    /// `range.resume_after(last_seen_seq)`.
    pub fn entries_for(
        &self,
        key: WalletKey,
        range: EntryRange,
    ) -> BoxStream<'static, Result<LedgerEntry, StoreError>> {
        let storage = self.storage.clone();
        let page_size = range.page_size.max(1);

        stream::try_unfold(
            (storage, key, range.after, false),
            move |(storage, key, after, exhausted)| async move {
                if exhausted {
                    return Ok::<_, StoreError>(None);
                }
                let query = EntryQuery {
                    after,
                    until: range.until,
                    limit: page_size,
                };
                let page = storage.entries_page(&key, &query).await?;
                let Some(last) = page.last().map(|e| e.seq) else {
                    return Ok(None);
                };
                let exhausted = page.len() < page_size;
                let items = stream::iter(page.into_iter().map(Ok::<_, StoreError>));
                Ok(Some((items, (storage, key, Some(last), exhausted))))
            },
        )
        .try_flatten()
        .boxed()
    }

    /// One page of a wallet's entries.
    pub async fn page(
        &self,
        key: &WalletKey,
        query: &EntryQuery,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.storage.entries_page(key, query).await
    }

    /// Debit and credit of a two-legged movement, `None` if the id is
    /// unknown or names a single-wallet posting.
    pub async fn find_by_transfer_id(
        &self,
        transfer_id: TransferId,
    ) -> Result<Option<EntryPair>, StoreError> {
        let entries = self.storage.entries_by_transfer(transfer_id).await?;
        Ok(EntryPair::from_entries(entries))
    }

    /// Every entry sharing `transfer_id`, in `seq` order.
    pub async fn entries_for_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.storage.entries_by_transfer(transfer_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::EntryKind;
    use crate::store::MemoryStorage;
    use crate::wallet::BalanceDelta;
    use chrono::Utc;

    async fn seeded(deposits: usize) -> (LedgerLog, WalletKey) {
        let storage = Arc::new(MemoryStorage::new());
        let log = LedgerLog::new(storage.clone());
        let key = WalletKey::new(1, "USD");
        let mut wallet = storage.create_wallet_if_absent(&key).await.unwrap();
        for _ in 0..deposits {
            let mut tx = storage.begin().await.unwrap();
            wallet = tx
                .apply_delta(&key, BalanceDelta::available(10), wallet.version())
                .await
                .unwrap();
            let entry = NewLedgerEntry::describe(
                &wallet,
                EntryKind::Deposit,
                10,
                0,
                TransferId::new(),
                Utc::now(),
            );
            log.append(tx.as_mut(), vec![entry]).await.unwrap();
            tx.commit().await.unwrap();
        }
        (log, key)
    }

    #[tokio::test]
    async fn test_stream_pages_through_everything() {
        let (log, key) = seeded(5).await;
        let entries: Vec<_> = log
            .entries_for(key, EntryRange::all().with_page_size(2))
            .try_collect()
            .await
            .unwrap();
        let seqs: Vec<_> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(entries.last().unwrap().balance_after, 50);
    }

    #[tokio::test]
    async fn test_stream_resumes_and_stops_at_until() {
        let (log, key) = seeded(6).await;
        let range = EntryRange::all().with_page_size(4).resume_after(2).until(5);
        let seqs: Vec<_> = log
            .entries_for(key, range)
            .map_ok(|e| e.seq)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_stream_of_empty_wallet() {
        let (log, _key) = seeded(0).await;
        let entries: Vec<_> = log
            .entries_for(WalletKey::new(7, "CNY"), EntryRange::all())
            .try_collect()
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_empty_append_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let log = LedgerLog::new(storage.clone());
        let mut tx = storage.begin().await.unwrap();
        assert!(log.append(tx.as_mut(), Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_single_posting_is_not_a_pair() {
        let (log, key) = seeded(1).await;
        let query = EntryQuery {
            after: None,
            until: None,
            limit: 10,
        };
        let entry = log.page(&key, &query).await.unwrap().remove(0);
        assert!(
            log.find_by_transfer_id(entry.transfer_id)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            log.entries_for_transfer(entry.transfer_id).await.unwrap(),
            vec![entry]
        );
    }
}
