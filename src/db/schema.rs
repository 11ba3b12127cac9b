//! Database schema definitions

// === SQLITE ===

// One row per game user; updated_at is unix millis
pub const SQLITE_CREATE_INVENTORIES: &str = r#"
CREATE TABLE IF NOT EXISTS inventories (
    entity_id TEXT PRIMARY KEY,
    owner_id INTEGER,
    payload BLOB NOT NULL,
    updated_at BIGINT NOT NULL
)
"#;

// For the retention sweep
pub const SQLITE_CREATE_INDEX_UPDATED_AT: &str =
    "CREATE INDEX IF NOT EXISTS idx_inventories_updated_at ON inventories(updated_at)";

pub const SQLITE_CREATE_KEY_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS key_accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
)
"#;

pub const SQLITE_CREATE_INDEX_KEY_ACCOUNTS: &str =
    "CREATE INDEX IF NOT EXISTS idx_key_accounts_entity ON key_accounts(entity_id)";

pub const SQLITE_UPSERT: &str = r#"
INSERT INTO inventories (entity_id, owner_id, payload, updated_at)
VALUES (?, ?, ?, ?)
ON CONFLICT(entity_id) DO UPDATE SET
    owner_id = COALESCE(excluded.owner_id, inventories.owner_id),
    payload = excluded.payload,
    updated_at = excluded.updated_at
"#;

// === POSTGRES ===

pub const POSTGRES_CREATE_INVENTORIES: &str = r#"
CREATE TABLE IF NOT EXISTS inventories (
    entity_id TEXT PRIMARY KEY,
    owner_id BIGINT,
    payload JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const POSTGRES_CREATE_INDEX_UPDATED_AT: &str =
    "CREATE INDEX IF NOT EXISTS idx_inventories_updated_at ON inventories(updated_at)";

pub const POSTGRES_CREATE_INDEX_OWNER: &str =
    "CREATE INDEX IF NOT EXISTS idx_inventories_owner ON inventories(owner_id)";

pub const POSTGRES_CREATE_KEY_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS key_accounts (
    id BIGSERIAL PRIMARY KEY,
    entity_id TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE
)
"#;

pub const POSTGRES_CREATE_INDEX_KEY_ACCOUNTS: &str =
    "CREATE INDEX IF NOT EXISTS idx_key_accounts_entity ON key_accounts(entity_id)";

pub const POSTGRES_UPSERT: &str = r#"
INSERT INTO inventories (entity_id, owner_id, payload, updated_at)
VALUES ($1, $2, $3::jsonb, $4)
ON CONFLICT (entity_id) DO UPDATE SET
    owner_id = COALESCE(EXCLUDED.owner_id, inventories.owner_id),
    payload = EXCLUDED.payload,
    updated_at = EXCLUDED.updated_at
"#;
