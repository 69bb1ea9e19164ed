//! PostgreSQL Store
//!
//! One generic query implementation serves both pooled autocommit
//! connections and open transactions: anything that derefs to a
//! `PgConnection` can run the statements.

use std::ops::DerefMut;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};
use uuid::Uuid;

use super::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateSessionParams, CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry,
    ListAccountsParams, ListEntriesParams, ListTransfersParams, Queries, Session, Store,
    StoreError, Transfer, TxHandle, UpdateAccountParams, UpdateUserParams,
    UpdateVerifyEmailParams, User, VerifyEmail,
};

/// Store backed by a shared connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn acquire(&self) -> Result<Box<dyn Queries>, StoreError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgConn::new(conn)))
    }

    async fn begin(&self) -> Result<Box<dyn TxHandle>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx::new(tx)))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Query handle over any PostgreSQL connection
pub struct PgQueries<C> {
    conn: C,
}

/// Autocommit handle on a pooled connection
pub type PgConn = PgQueries<PoolConnection<Postgres>>;

/// Handle scoped to one transaction. sqlx rolls it back when dropped.
pub type PgTx = PgQueries<sqlx::Transaction<'static, Postgres>>;

impl<C> PgQueries<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl TxHandle for PgTx {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PgQueries { conn } = *self;
        conn.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let PgQueries { conn } = *self;
        conn.rollback().await?;
        Ok(())
    }
}

// ============================================================================
// Statements
// ============================================================================

const CREATE_ACCOUNT: &str = r#"
    INSERT INTO accounts (owner, balance, currency)
    VALUES ($1, $2, $3)
    RETURNING id, owner, balance, currency, created_at
"#;

const GET_ACCOUNT: &str = r#"
    SELECT id, owner, balance, currency, created_at
    FROM accounts
    WHERE id = $1
"#;

// NO KEY UPDATE does not block inserts into entries/transfers referencing the row
const GET_ACCOUNT_FOR_UPDATE: &str = r#"
    SELECT id, owner, balance, currency, created_at
    FROM accounts
    WHERE id = $1
    FOR NO KEY UPDATE
"#;

const LIST_ACCOUNTS: &str = r#"
    SELECT id, owner, balance, currency, created_at
    FROM accounts
    WHERE owner = $1
    ORDER BY id
    LIMIT $2 OFFSET $3
"#;

const UPDATE_ACCOUNT: &str = r#"
    UPDATE accounts SET balance = $2
    WHERE id = $1
    RETURNING id, owner, balance, currency, created_at
"#;

const ADD_ACCOUNT_BALANCE: &str = r#"
    UPDATE accounts SET balance = balance + $1
    WHERE id = $2
    RETURNING id, owner, balance, currency, created_at
"#;

const DELETE_ACCOUNT: &str = "DELETE FROM accounts WHERE id = $1";

const CREATE_ENTRY: &str = r#"
    INSERT INTO entries (account_id, amount)
    VALUES ($1, $2)
    RETURNING id, account_id, amount, created_at
"#;

const GET_ENTRY: &str = "SELECT id, account_id, amount, created_at FROM entries WHERE id = $1";

const LIST_ENTRIES: &str = r#"
    SELECT id, account_id, amount, created_at
    FROM entries
    WHERE account_id = $1
    ORDER BY id
    LIMIT $2 OFFSET $3
"#;

const CREATE_TRANSFER: &str = r#"
    INSERT INTO transfers (from_account_id, to_account_id, amount)
    VALUES ($1, $2, $3)
    RETURNING id, from_account_id, to_account_id, amount, created_at
"#;

const GET_TRANSFER: &str = r#"
    SELECT id, from_account_id, to_account_id, amount, created_at
    FROM transfers
    WHERE id = $1
"#;

const LIST_TRANSFERS: &str = r#"
    SELECT id, from_account_id, to_account_id, amount, created_at
    FROM transfers
    WHERE from_account_id = $1 OR to_account_id = $2
    ORDER BY id
    LIMIT $3 OFFSET $4
"#;

const USER_COLUMNS_RETURNING: &str = "RETURNING username, hashed_password, full_name, email, is_email_verified, password_changed_at, created_at";

const GET_USER: &str = r#"
    SELECT username, hashed_password, full_name, email, is_email_verified,
           password_changed_at, created_at
    FROM users
    WHERE username = $1
"#;

const GET_USER_BY_EMAIL: &str = r#"
    SELECT username, hashed_password, full_name, email, is_email_verified,
           password_changed_at, created_at
    FROM users
    WHERE email = $1
"#;

// COALESCE keeps the stored value for every NULL (not supplied) parameter
const UPDATE_USER: &str = r#"
    UPDATE users SET
        hashed_password     = COALESCE($1, hashed_password),
        password_changed_at = COALESCE($2, password_changed_at),
        full_name           = COALESCE($3, full_name),
        email               = COALESCE($4, email),
        is_email_verified   = COALESCE($5, is_email_verified)
    WHERE username = $6
"#;

const CREATE_SESSION: &str = r#"
    INSERT INTO sessions (id, username, refresh_token, user_agent, client_ip, is_blocked, expires_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    RETURNING id, username, refresh_token, user_agent, client_ip, is_blocked, expires_at, created_at
"#;

const GET_SESSION: &str = r#"
    SELECT id, username, refresh_token, user_agent, client_ip, is_blocked, expires_at, created_at
    FROM sessions
    WHERE id = $1
"#;

const BLOCK_SESSION: &str = r#"
    UPDATE sessions SET is_blocked = TRUE
    WHERE id = $1
    RETURNING id, username, refresh_token, user_agent, client_ip, is_blocked, expires_at, created_at
"#;

const CREATE_VERIFY_EMAIL: &str = r#"
    INSERT INTO verify_emails (username, email, secret_code)
    VALUES ($1, $2, $3)
    RETURNING id, username, email, secret_code, is_used, created_at, expires_at
"#;

const UPDATE_VERIFY_EMAIL: &str = r#"
    UPDATE verify_emails SET is_used = TRUE
    WHERE id = $1
      AND secret_code = $2
      AND is_used = FALSE
      AND expires_at > now()
    RETURNING id, username, email, secret_code, is_used, created_at, expires_at
"#;

// ============================================================================
// Queries
// ============================================================================

#[async_trait]
impl<C> Queries for PgQueries<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(CREATE_ACCOUNT)
            .bind(arg.owner)
            .bind(arg.balance)
            .bind(arg.currency)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(GET_ACCOUNT)
            .bind(id)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(account)
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(GET_ACCOUNT_FOR_UPDATE)
            .bind(id)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(account)
    }

    async fn list_accounts(
        &mut self,
        arg: ListAccountsParams,
    ) -> Result<Vec<Account>, StoreError> {
        let accounts = sqlx::query_as::<_, Account>(LIST_ACCOUNTS)
            .bind(arg.owner)
            .bind(arg.limit)
            .bind(arg.offset)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(accounts)
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(UPDATE_ACCOUNT)
            .bind(arg.id)
            .bind(arg.balance)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(account)
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(ADD_ACCOUNT_BALANCE)
            .bind(arg.amount)
            .bind(arg.id)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(account)
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(DELETE_ACCOUNT)
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(CREATE_ENTRY)
            .bind(arg.account_id)
            .bind(arg.amount)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(GET_ENTRY)
            .bind(id)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(entry)
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        let entries = sqlx::query_as::<_, Entry>(LIST_ENTRIES)
            .bind(arg.account_id)
            .bind(arg.limit)
            .bind(arg.offset)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(entries)
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        let transfer = sqlx::query_as::<_, Transfer>(CREATE_TRANSFER)
            .bind(arg.from_account_id)
            .bind(arg.to_account_id)
            .bind(arg.amount)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        let transfer = sqlx::query_as::<_, Transfer>(GET_TRANSFER)
            .bind(id)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(transfer)
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let transfers = sqlx::query_as::<_, Transfer>(LIST_TRANSFERS)
            .bind(arg.from_account_id)
            .bind(arg.to_account_id)
            .bind(arg.limit)
            .bind(arg.offset)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(transfers)
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        let sql = format!(
            "INSERT INTO users (username, hashed_password, full_name, email) VALUES ($1, $2, $3, $4) {}",
            USER_COLUMNS_RETURNING
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(arg.username)
            .bind(arg.hashed_password)
            .bind(arg.full_name)
            .bind(arg.email)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(GET_USER)
            .bind(username)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(user)
    }

    async fn get_user_by_email(&mut self, email: &str) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(GET_USER_BY_EMAIL)
            .bind(email)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(user)
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
        let sql = format!("{} {}", UPDATE_USER, USER_COLUMNS_RETURNING);
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(arg.hashed_password)
            .bind(arg.password_changed_at)
            .bind(arg.full_name)
            .bind(arg.email)
            .bind(arg.is_email_verified)
            .bind(arg.username)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(user)
    }

    async fn create_session(&mut self, arg: CreateSessionParams) -> Result<Session, StoreError> {
        let session = sqlx::query_as::<_, Session>(CREATE_SESSION)
            .bind(arg.id)
            .bind(arg.username)
            .bind(arg.refresh_token)
            .bind(arg.user_agent)
            .bind(arg.client_ip)
            .bind(arg.is_blocked)
            .bind(arg.expires_at)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(session)
    }

    async fn get_session(&mut self, id: Uuid) -> Result<Session, StoreError> {
        let session = sqlx::query_as::<_, Session>(GET_SESSION)
            .bind(id)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(session)
    }

    async fn block_session(&mut self, id: Uuid) -> Result<Session, StoreError> {
        let session = sqlx::query_as::<_, Session>(BLOCK_SESSION)
            .bind(id)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(session)
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        let record = sqlx::query_as::<_, VerifyEmail>(CREATE_VERIFY_EMAIL)
            .bind(arg.username)
            .bind(arg.email)
            .bind(arg.secret_code)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(record)
    }

    async fn update_verify_email(
        &mut self,
        arg: UpdateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        let record = sqlx::query_as::<_, VerifyEmail>(UPDATE_VERIFY_EMAIL)
            .bind(arg.id)
            .bind(arg.secret_code)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(record)
    }
}
