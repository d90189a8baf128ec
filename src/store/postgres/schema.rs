//! PostgreSQL schema
//!
//! Amounts are BIGINT minor units. `ledger_entries_tb.seq` is the global
//! entry sequence; per wallet it follows commit order because every entry
//! insert happens after the wallet row was updated (and locked) in the same
//! transaction.

pub const WALLETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS wallets_tb (
    owner_id    BIGINT      NOT NULL,
    currency    VARCHAR(16) NOT NULL,
    available   BIGINT      NOT NULL DEFAULT 0 CHECK (available >= 0),
    frozen      BIGINT      NOT NULL DEFAULT 0 CHECK (frozen >= 0),
    version     BIGINT      NOT NULL DEFAULT 0,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (owner_id, currency)
)
"#;

pub const LEDGER_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries_tb (
    seq                    BIGSERIAL   PRIMARY KEY,
    owner_id               BIGINT      NOT NULL,
    currency               VARCHAR(16) NOT NULL,
    kind                   SMALLINT    NOT NULL,
    delta                  BIGINT      NOT NULL,
    frozen_delta           BIGINT      NOT NULL,
    counterparty_owner     BIGINT,
    counterparty_currency  VARCHAR(16),
    transfer_id            VARCHAR(26) NOT NULL,
    balance_after          BIGINT      NOT NULL,
    frozen_after           BIGINT      NOT NULL,
    wallet_version         BIGINT      NOT NULL,
    memo                   TEXT,
    created_at             TIMESTAMPTZ NOT NULL
)
"#;

pub const LEDGER_WALLET_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_ledger_entries_wallet
    ON ledger_entries_tb (owner_id, currency, seq)
"#;

pub const LEDGER_TRANSFER_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_ledger_entries_transfer
    ON ledger_entries_tb (transfer_id)
"#;

/// `state`: 1 = in progress, 2 = settled (see `IdempotencyStatus::id`)
pub const IDEMPOTENCY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_tb (
    owner_id    BIGINT       NOT NULL,
    token       VARCHAR(128) NOT NULL,
    operation   TEXT         NOT NULL,
    state       SMALLINT     NOT NULL,
    outcome     TEXT,
    created_at  TIMESTAMPTZ  NOT NULL,
    updated_at  TIMESTAMPTZ  NOT NULL,
    PRIMARY KEY (owner_id, token)
)
"#;

pub const IDEMPOTENCY_PURGE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_idempotency_state_updated
    ON idempotency_tb (state, updated_at)
"#;

/// Statements run by `PgStorage::ensure_schema`, in order.
pub const STATEMENTS: &[&str] = &[
    WALLETS_TABLE,
    LEDGER_ENTRIES_TABLE,
    LEDGER_WALLET_INDEX,
    LEDGER_TRANSFER_INDEX,
    IDEMPOTENCY_TABLE,
    IDEMPOTENCY_PURGE_INDEX,
];
