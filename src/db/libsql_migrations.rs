//! Schema for the libSQL backend.
//!
//! Every statement is idempotent so the whole script can run at each startup.
//! Ledger tables carry the dedup keys as UNIQUE constraints; `ledger_sequence`
//! hands out the global insertion order shared by all three ledger tables.
//! A partial unique index keeps at most one unrevoked token per debtor.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS debtors (
    id TEXT PRIMARY KEY,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_debtors_email ON debtors (email);
CREATE INDEX IF NOT EXISTS idx_debtors_phone ON debtors (phone);

CREATE TABLE IF NOT EXISTS access_tokens (
    token_hash TEXT PRIMARY KEY,
    sealed_token TEXT NOT NULL,
    debtor_id TEXT NOT NULL REFERENCES debtors (id),
    issued_at TEXT NOT NULL,
    revoked_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_access_tokens_debtor ON access_tokens (debtor_id, revoked_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_access_tokens_one_active
    ON access_tokens (debtor_id) WHERE revoked_at IS NULL;

CREATE TABLE IF NOT EXISTS ledger_sequence (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS communications (
    id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL UNIQUE,
    debtor_id TEXT NOT NULL REFERENCES debtors (id),
    channel TEXT NOT NULL,
    direction TEXT NOT NULL,
    provider_message_id TEXT NOT NULL,
    message_ref TEXT,
    status TEXT NOT NULL,
    provider_status TEXT NOT NULL,
    detail TEXT,
    occurred_at TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    UNIQUE (channel, provider_message_id, provider_status)
);
CREATE INDEX IF NOT EXISTS idx_communications_debtor ON communications (debtor_id, occurred_at, seq);
CREATE INDEX IF NOT EXISTS idx_communications_ref ON communications (message_ref);

CREATE TABLE IF NOT EXISTS payments (
    id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL UNIQUE,
    debtor_id TEXT NOT NULL REFERENCES debtors (id),
    provider TEXT NOT NULL,
    provider_payment_id TEXT NOT NULL,
    payment_link_id TEXT,
    amount TEXT NOT NULL,
    currency TEXT NOT NULL,
    status TEXT NOT NULL,
    provider_status TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    UNIQUE (provider, provider_payment_id, provider_status)
);
CREATE INDEX IF NOT EXISTS idx_payments_debtor ON payments (debtor_id, occurred_at, seq);
CREATE INDEX IF NOT EXISTS idx_payments_link ON payments (payment_link_id);

CREATE TABLE IF NOT EXISTS page_views (
    id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL UNIQUE,
    debtor_id TEXT NOT NULL REFERENCES debtors (id),
    token TEXT NOT NULL,
    path TEXT NOT NULL,
    event TEXT,
    user_agent TEXT,
    occurred_at TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_page_views_debtor ON page_views (debtor_id, occurred_at, seq);

CREATE TABLE IF NOT EXISTS communication_intents (
    message_ref TEXT PRIMARY KEY,
    debtor_id TEXT NOT NULL REFERENCES debtors (id),
    channel TEXT NOT NULL,
    provider_message_id TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (channel, provider_message_id)
);

CREATE TABLE IF NOT EXISTS payment_links (
    id TEXT PRIMARY KEY,
    debtor_id TEXT NOT NULL REFERENCES debtors (id),
    amount TEXT NOT NULL,
    currency TEXT NOT NULL,
    provider_link_id TEXT,
    url TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_payment_links_debtor ON payment_links (debtor_id);
"#;
