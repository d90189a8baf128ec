//! External views
//!
//! Projections of ledger entities for callers, with amounts rendered as
//! decimal strings in the currency's precision.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core_types::{EntrySeq, OwnerId};
use crate::currency::{Currency, CurrencyRegistry};
use crate::engine::{PostingResult, TransferResult};
use crate::ledger::LedgerEntry;
use crate::money::{self, MoneyError};
use crate::wallet::{BalanceSnapshot, Wallet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletView {
    pub owner: OwnerId,
    pub currency: String,
    pub available: String,
    pub frozen: String,
    pub total: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceView {
    pub owner: OwnerId,
    pub currency: String,
    pub available: String,
    pub frozen: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntryView {
    pub id: EntrySeq,
    pub owner: OwnerId,
    pub currency: String,
    pub kind: &'static str,
    /// Signed change of the available balance
    pub amount: String,
    pub frozen_amount: String,
    pub balance_after: String,
    pub frozen_after: String,
    pub counterparty: Option<OwnerId>,
    pub transfer_id: String,
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResultView {
    pub transfer_id: String,
    pub from: BalanceView,
    pub to: BalanceView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostingResultView {
    pub transfer_id: String,
    pub kind: &'static str,
    pub balance: BalanceView,
}

fn decimals(currency: &Currency, registry: &CurrencyRegistry) -> Result<u32, MoneyError> {
    registry
        .decimals(currency)
        .ok_or_else(|| MoneyError::UnknownCurrency(currency.to_string()))
}

pub fn wallet_view(wallet: &Wallet, registry: &CurrencyRegistry) -> Result<WalletView, MoneyError> {
    let key = wallet.key();
    let d = decimals(&key.currency, registry)?;
    let total = wallet.total().ok_or(MoneyError::Overflow)?;
    Ok(WalletView {
        owner: key.owner,
        currency: key.currency.to_string(),
        available: money::format_amount(wallet.available(), d),
        frozen: money::format_amount(wallet.frozen(), d),
        total: money::format_amount(total, d),
        version: wallet.version(),
        updated_at: wallet.updated_at(),
    })
}

pub fn balance_view(
    snapshot: &BalanceSnapshot,
    registry: &CurrencyRegistry,
) -> Result<BalanceView, MoneyError> {
    let d = decimals(&snapshot.wallet.currency, registry)?;
    Ok(BalanceView {
        owner: snapshot.wallet.owner,
        currency: snapshot.wallet.currency.to_string(),
        available: money::format_amount(snapshot.available, d),
        frozen: money::format_amount(snapshot.frozen, d),
        version: snapshot.version,
    })
}

pub fn entry_view(
    entry: &LedgerEntry,
    registry: &CurrencyRegistry,
) -> Result<LedgerEntryView, MoneyError> {
    let d = decimals(&entry.wallet.currency, registry)?;
    Ok(LedgerEntryView {
        id: entry.seq,
        owner: entry.wallet.owner,
        currency: entry.wallet.currency.to_string(),
        kind: entry.kind.as_str(),
        amount: money::format_signed(entry.delta, d),
        frozen_amount: money::format_signed(entry.frozen_delta, d),
        balance_after: money::format_amount(entry.balance_after, d),
        frozen_after: money::format_amount(entry.frozen_after, d),
        counterparty: entry.counterparty.as_ref().map(|cp| cp.owner),
        transfer_id: entry.transfer_id.to_string(),
        memo: entry.memo.clone(),
        created_at: entry.created_at,
    })
}

pub fn transfer_view(
    result: &TransferResult,
    registry: &CurrencyRegistry,
) -> Result<TransferResultView, MoneyError> {
    Ok(TransferResultView {
        transfer_id: result.transfer_id.to_string(),
        from: balance_view(&result.new_from_balance, registry)?,
        to: balance_view(&result.new_to_balance, registry)?,
    })
}

pub fn posting_view(
    result: &PostingResult,
    registry: &CurrencyRegistry,
) -> Result<PostingResultView, MoneyError> {
    Ok(PostingResultView {
        transfer_id: result.transfer_id.to_string(),
        kind: result.kind.as_str(),
        balance: balance_view(&result.balance, registry)?,
    })
}
