//! Ledger and task queue tables
//!
//! Idempotent bootstrap DDL. Every statement uses `IF NOT EXISTS` so it can run
//! on each worker start.

use sqlx::PgPool;

/// Create all tables and indexes if they are missing
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    tracing::info!("Ensuring ledger schema...");

    for (name, ddl) in STATEMENTS {
        sqlx::query(ddl).execute(pool).await.map_err(|e| {
            tracing::error!(statement = name, error = %e, "Schema statement failed");
            e
        })?;
    }

    tracing::info!("Ledger schema ready");
    Ok(())
}

const STATEMENTS: &[(&str, &str)] = &[
    ("users", CREATE_USERS_TABLE),
    ("accounts", CREATE_ACCOUNTS_TABLE),
    ("accounts_owner_idx", CREATE_ACCOUNTS_OWNER_INDEX),
    ("entries", CREATE_ENTRIES_TABLE),
    ("entries_account_idx", CREATE_ENTRIES_ACCOUNT_INDEX),
    ("transfers", CREATE_TRANSFERS_TABLE),
    ("transfers_pair_idx", CREATE_TRANSFERS_PAIR_INDEX),
    ("sessions", CREATE_SESSIONS_TABLE),
    ("verify_emails", CREATE_VERIFY_EMAILS_TABLE),
    ("tasks", CREATE_TASKS_TABLE),
    ("tasks_due_idx", CREATE_TASKS_DUE_INDEX),
];

const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    username            VARCHAR PRIMARY KEY,
    hashed_password     VARCHAR NOT NULL,
    full_name           VARCHAR NOT NULL,
    email               VARCHAR UNIQUE NOT NULL,
    is_email_verified   BOOLEAN NOT NULL DEFAULT false,
    password_changed_at TIMESTAMPTZ NOT NULL DEFAULT '0001-01-01 00:00:00Z',
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

// balance >= 0 is the overdraft guard; the transfer engine relies on it
const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id         BIGSERIAL PRIMARY KEY,
    owner      VARCHAR NOT NULL REFERENCES users (username),
    balance    BIGINT NOT NULL CHECK (balance >= 0),
    currency   VARCHAR NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (owner, currency)
)
"#;

const CREATE_ACCOUNTS_OWNER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS accounts_owner_idx ON accounts (owner)";

const CREATE_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id         BIGSERIAL PRIMARY KEY,
    account_id BIGINT NOT NULL REFERENCES accounts (id),
    amount     BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_ENTRIES_ACCOUNT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS entries_account_idx ON entries (account_id)";

const CREATE_TRANSFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id              BIGSERIAL PRIMARY KEY,
    from_account_id BIGINT NOT NULL REFERENCES accounts (id),
    to_account_id   BIGINT NOT NULL REFERENCES accounts (id),
    amount          BIGINT NOT NULL CHECK (amount > 0),
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_TRANSFERS_PAIR_INDEX: &str = "CREATE INDEX IF NOT EXISTS transfers_pair_idx ON transfers (from_account_id, to_account_id)";

const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id            UUID PRIMARY KEY,
    username      VARCHAR NOT NULL REFERENCES users (username),
    refresh_token VARCHAR NOT NULL,
    user_agent    VARCHAR NOT NULL,
    client_ip     VARCHAR NOT NULL,
    is_blocked    BOOLEAN NOT NULL DEFAULT false,
    expires_at    TIMESTAMPTZ NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_VERIFY_EMAILS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS verify_emails (
    id          BIGSERIAL PRIMARY KEY,
    username    VARCHAR NOT NULL REFERENCES users (username),
    email       VARCHAR NOT NULL,
    secret_code VARCHAR NOT NULL,
    is_used     BOOLEAN NOT NULL DEFAULT false,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    expires_at  TIMESTAMPTZ NOT NULL DEFAULT (now() + interval '15 minutes')
)
"#;

// state: 0=PENDING 10=PROCESSING 20=RETRYING 30=SUCCEEDED -10=FAILED
const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id         VARCHAR(26) PRIMARY KEY,
    task_type  VARCHAR NOT NULL,
    payload    BYTEA NOT NULL,
    queue      VARCHAR NOT NULL,
    state      SMALLINT NOT NULL,
    retried    INT NOT NULL DEFAULT 0,
    max_retry  INT NOT NULL,
    last_error TEXT,
    process_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_TASKS_DUE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS tasks_due_idx ON tasks (queue, state, process_at)";
