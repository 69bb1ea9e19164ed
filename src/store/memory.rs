//! In-memory Store
//!
//! Test double for [`PgStore`](super::PgStore). Transactions are serialized:
//! `begin` takes an owned lock on the whole dataset and works on a copy that
//! replaces the shared state on commit. Dropping a handle without committing
//! discards the copy.
//!
//! Constraint failures carry the same SQLSTATE codes PostgreSQL reports, so
//! callers classify them identically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateSessionParams, CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry,
    ListAccountsParams, ListEntriesParams, ListTransfersParams, Queries, Session, Store,
    StoreError, Transfer, TxHandle, UpdateAccountParams, UpdateUserParams,
    UpdateVerifyEmailParams, User, VERIFY_EMAIL_TTL_MINUTES, VerifyEmail,
};
use crate::db::error::{CHECK_VIOLATION, FOREIGN_KEY_VIOLATION, UNIQUE_VIOLATION};

#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    data: Arc<AsyncMutex<MemoryData>>,
    balance_log: Mutex<Vec<i64>>,
    fail_next_commit: AtomicBool,
    fail_next_rollback: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account ids in the order `add_account_balance` touched them
    pub fn balance_update_log(&self) -> Vec<i64> {
        self.shared
            .balance_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn clear_balance_update_log(&self) {
        if let Ok(mut log) = self.shared.balance_log.lock() {
            log.clear();
        }
    }

    /// Make the next commit fail as if the connection dropped
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next rollback fail as if the connection dropped
    pub fn fail_next_rollback(&self) {
        self.shared.fail_next_rollback.store(true, Ordering::SeqCst);
    }

    /// Push a verification record past its expiry
    pub async fn expire_verify_email(&self, id: i64) -> Result<(), StoreError> {
        let mut data = self.shared.data.lock().await;
        let record = data.verify_emails.get_mut(&id).ok_or(StoreError::NotFound)?;
        record.expires_at = Utc::now() - Duration::seconds(1);
        Ok(())
    }

    /// Number of committed rows per table: (transfers, entries)
    pub async fn ledger_counts(&self) -> (usize, usize) {
        let data = self.shared.data.lock().await;
        (data.transfers.len(), data.entries.len())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn acquire(&self) -> Result<Box<dyn Queries>, StoreError> {
        Ok(Box::new(MemoryHandle {
            shared: self.shared.clone(),
            tx: None,
        }))
    }

    async fn begin(&self) -> Result<Box<dyn TxHandle>, StoreError> {
        let guard = self.shared.data.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryHandle {
            shared: self.shared.clone(),
            tx: Some(OpenTx { guard, working }),
        }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct OpenTx {
    guard: OwnedMutexGuard<MemoryData>,
    working: MemoryData,
}

/// Autocommit handle when `tx` is `None`, transaction handle otherwise
pub struct MemoryHandle {
    shared: Arc<Shared>,
    tx: Option<OpenTx>,
}

impl MemoryHandle {
    async fn with<R, F>(&mut self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut MemoryData) -> Result<R, StoreError> + Send,
        R: Send,
    {
        match &mut self.tx {
            Some(tx) => f(&mut tx.working),
            None => {
                let mut data = self.shared.data.lock().await;
                f(&mut *data)
            }
        }
    }
}

#[async_trait]
impl TxHandle for MemoryHandle {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection lost during commit".into()));
        }
        let this = *self;
        if let Some(OpenTx { mut guard, working }) = this.tx {
            *guard = working;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        if self.shared.fail_next_rollback.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "connection lost during rollback".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Queries for MemoryHandle {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        self.with(|d| d.create_account(arg)).await
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.with(|d| d.accounts.get(&id).cloned().ok_or(StoreError::NotFound))
            .await
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        self.get_account(id).await
    }

    async fn list_accounts(
        &mut self,
        arg: ListAccountsParams,
    ) -> Result<Vec<Account>, StoreError> {
        self.with(|d| {
            let rows = d
                .accounts
                .values()
                .filter(|a| a.owner == arg.owner)
                .cloned();
            Ok(page(rows, arg.limit, arg.offset))
        })
        .await
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError> {
        self.with(|d| d.set_balance(arg.id, |_| Some(arg.balance)))
            .await
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        if let Ok(mut log) = self.shared.balance_log.lock() {
            log.push(arg.id);
        }
        self.with(|d| d.set_balance(arg.id, |balance| balance.checked_add(arg.amount)))
            .await
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError> {
        self.with(|d| d.delete_account(id)).await
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        self.with(|d| d.create_entry(arg)).await
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        self.with(|d| d.entries.get(&id).cloned().ok_or(StoreError::NotFound))
            .await
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        self.with(|d| {
            let rows = d
                .entries
                .values()
                .filter(|e| e.account_id == arg.account_id)
                .cloned();
            Ok(page(rows, arg.limit, arg.offset))
        })
        .await
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        self.with(|d| d.create_transfer(arg)).await
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.with(|d| d.transfers.get(&id).cloned().ok_or(StoreError::NotFound))
            .await
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        self.with(|d| {
            let rows = d
                .transfers
                .values()
                .filter(|t| {
                    t.from_account_id == arg.from_account_id || t.to_account_id == arg.to_account_id
                })
                .cloned();
            Ok(page(rows, arg.limit, arg.offset))
        })
        .await
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        self.with(|d| d.create_user(arg)).await
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        let username = username.to_string();
        self.with(move |d| d.users.get(&username).cloned().ok_or(StoreError::NotFound))
            .await
    }

    async fn get_user_by_email(&mut self, email: &str) -> Result<User, StoreError> {
        let email = email.to_string();
        self.with(move |d| {
            d.users
                .values()
                .find(|u| u.email == email)
                .cloned()
                .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
        self.with(|d| d.update_user(arg)).await
    }

    async fn create_session(&mut self, arg: CreateSessionParams) -> Result<Session, StoreError> {
        self.with(|d| d.create_session(arg)).await
    }

    async fn get_session(&mut self, id: Uuid) -> Result<Session, StoreError> {
        self.with(|d| d.sessions.get(&id).cloned().ok_or(StoreError::NotFound))
            .await
    }

    async fn block_session(&mut self, id: Uuid) -> Result<Session, StoreError> {
        self.with(|d| {
            let session = d.sessions.get_mut(&id).ok_or(StoreError::NotFound)?;
            session.is_blocked = true;
            Ok(session.clone())
        })
        .await
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        self.with(|d| d.create_verify_email(arg)).await
    }

    async fn update_verify_email(
        &mut self,
        arg: UpdateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        self.with(|d| {
            let now = Utc::now();
            let record = d
                .verify_emails
                .get_mut(&arg.id)
                .filter(|r| r.secret_code == arg.secret_code && !r.is_used && r.expires_at > now)
                .ok_or(StoreError::NotFound)?;
            record.is_used = true;
            Ok(record.clone())
        })
        .await
    }
}

fn page<T>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    rows.skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

// ============================================================================
// Dataset
// ============================================================================

#[derive(Debug, Clone, Default)]
struct MemoryData {
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    users: BTreeMap<String, User>,
    sessions: HashMap<Uuid, Session>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
    last_account_id: i64,
    last_entry_id: i64,
    last_transfer_id: i64,
    last_verify_email_id: i64,
}

// Every operation validates before mutating so a failed autocommit call
// leaves the dataset untouched.
impl MemoryData {
    fn require_user(&self, username: &str, constraint: &str) -> Result<(), StoreError> {
        if self.users.contains_key(username) {
            Ok(())
        } else {
            Err(StoreError::constraint(
                FOREIGN_KEY_VIOLATION,
                Some(constraint),
                format!("user {} does not exist", username),
            ))
        }
    }

    fn require_account(&self, id: i64, constraint: &str) -> Result<(), StoreError> {
        if self.accounts.contains_key(&id) {
            Ok(())
        } else {
            Err(StoreError::constraint(
                FOREIGN_KEY_VIOLATION,
                Some(constraint),
                format!("account {} does not exist", id),
            ))
        }
    }

    fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        self.require_user(&arg.owner, "accounts_owner_fkey")?;
        if self
            .accounts
            .values()
            .any(|a| a.owner == arg.owner && a.currency == arg.currency)
        {
            return Err(StoreError::constraint(
                UNIQUE_VIOLATION,
                Some("accounts_owner_currency_key"),
                "duplicate owner and currency",
            ));
        }
        if arg.balance < 0 {
            return Err(balance_check_violation(arg.balance));
        }

        self.last_account_id += 1;
        let account = Account {
            id: self.last_account_id,
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    /// Replace a balance with `f(current)`; `None` means numeric overflow
    fn set_balance(
        &mut self,
        id: i64,
        f: impl FnOnce(i64) -> Option<i64>,
    ) -> Result<Account, StoreError> {
        let account = self.accounts.get_mut(&id).ok_or(StoreError::NotFound)?;
        let balance = f(account.balance).ok_or_else(|| {
            StoreError::InvalidArgument(format!("balance of account {} out of range", id))
        })?;
        if balance < 0 {
            return Err(balance_check_violation(balance));
        }
        account.balance = balance;
        Ok(account.clone())
    }

    fn delete_account(&mut self, id: i64) -> Result<(), StoreError> {
        if !self.accounts.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        let referenced = self.entries.values().any(|e| e.account_id == id)
            || self
                .transfers
                .values()
                .any(|t| t.from_account_id == id || t.to_account_id == id);
        if referenced {
            return Err(StoreError::constraint(
                FOREIGN_KEY_VIOLATION,
                Some("entries_account_id_fkey"),
                format!("account {} is still referenced", id),
            ));
        }
        self.accounts.remove(&id);
        Ok(())
    }

    fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        self.require_account(arg.account_id, "entries_account_id_fkey")?;
        self.last_entry_id += 1;
        let entry = Entry {
            id: self.last_entry_id,
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    fn create_transfer(&mut self, arg: CreateTransferParams) -> Result<Transfer, StoreError> {
        self.require_account(arg.from_account_id, "transfers_from_account_id_fkey")?;
        self.require_account(arg.to_account_id, "transfers_to_account_id_fkey")?;
        if arg.amount <= 0 {
            return Err(StoreError::constraint(
                CHECK_VIOLATION,
                Some("transfers_amount_check"),
                format!("transfer amount {} violates check constraint", arg.amount),
            ));
        }
        self.last_transfer_id += 1;
        let transfer = Transfer {
            id: self.last_transfer_id,
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    fn email_taken(&self, email: &str, except: &str) -> bool {
        self.users
            .values()
            .any(|u| u.email == email && u.username != except)
    }

    fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        if self.users.contains_key(&arg.username) {
            return Err(StoreError::constraint(
                UNIQUE_VIOLATION,
                Some("users_pkey"),
                format!("username {} already exists", arg.username),
            ));
        }
        if self.email_taken(&arg.email, "") {
            return Err(StoreError::constraint(
                UNIQUE_VIOLATION,
                Some("users_email_key"),
                format!("email {} already exists", arg.email),
            ));
        }

        let user = User {
            username: arg.username,
            hashed_password: arg.hashed_password,
            full_name: arg.full_name,
            email: arg.email,
            is_email_verified: false,
            password_changed_at: DateTime::<Utc>::default(),
            created_at: Utc::now(),
        };
        self.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
        if let Some(email) = &arg.email {
            if self.email_taken(email, &arg.username) {
                return Err(StoreError::constraint(
                    UNIQUE_VIOLATION,
                    Some("users_email_key"),
                    format!("email {} already exists", email),
                ));
            }
        }
        let user = self
            .users
            .get_mut(&arg.username)
            .ok_or(StoreError::NotFound)?;
        arg.apply_to(user);
        Ok(user.clone())
    }

    fn create_session(&mut self, arg: CreateSessionParams) -> Result<Session, StoreError> {
        self.require_user(&arg.username, "sessions_username_fkey")?;
        if self.sessions.contains_key(&arg.id) {
            return Err(StoreError::constraint(
                UNIQUE_VIOLATION,
                Some("sessions_pkey"),
                format!("session {} already exists", arg.id),
            ));
        }
        let session = Session {
            id: arg.id,
            username: arg.username,
            refresh_token: arg.refresh_token,
            user_agent: arg.user_agent,
            client_ip: arg.client_ip,
            is_blocked: arg.is_blocked,
            expires_at: arg.expires_at,
            created_at: Utc::now(),
        };
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        self.require_user(&arg.username, "verify_emails_username_fkey")?;
        self.last_verify_email_id += 1;
        let now = Utc::now();
        let record = VerifyEmail {
            id: self.last_verify_email_id,
            username: arg.username,
            email: arg.email,
            secret_code: arg.secret_code,
            is_used: false,
            created_at: now,
            expires_at: now + Duration::minutes(VERIFY_EMAIL_TTL_MINUTES),
        };
        self.verify_emails.insert(record.id, record.clone());
        Ok(record)
    }
}

fn balance_check_violation(balance: i64) -> StoreError {
    StoreError::constraint(
        CHECK_VIOLATION,
        Some("accounts_balance_check"),
        format!("balance {} violates check constraint", balance),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_user(store: &MemoryStore, username: &str) -> User {
        let mut conn = store.acquire().await.unwrap();
        conn.create_user(CreateUserParams {
            username: username.to_string(),
            hashed_password: "hash".to_string(),
            full_name: "Seed User".to_string(),
            email: format!("{}@example.com", username),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_account_constraints() {
        let store = MemoryStore::new();
        seed_user(&store, "alice").await;
        let mut conn = store.acquire().await.unwrap();

        let err = conn
            .create_account(CreateAccountParams {
                owner: "ghost".into(),
                balance: 0,
                currency: "USD".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_foreign_key_violation());

        let account = conn
            .create_account(CreateAccountParams {
                owner: "alice".into(),
                balance: 10,
                currency: "USD".into(),
            })
            .await
            .unwrap();

        let err = conn
            .create_account(CreateAccountParams {
                owner: "alice".into(),
                balance: 0,
                currency: "USD".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());

        let err = conn
            .add_account_balance(AddAccountBalanceParams {
                id: account.id,
                amount: -11,
            })
            .await
            .unwrap_err();
        assert!(err.is_check_violation());
        assert_eq!(conn.get_account(account.id).await.unwrap().balance, 10);
    }

    #[tokio::test]
    async fn test_uncommitted_tx_is_discarded_on_drop() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.queries()
                .create_user(CreateUserParams {
                    username: "temp".into(),
                    hashed_password: "h".into(),
                    full_name: "Temp User".into(),
                    email: "temp@example.com".into(),
                })
                .await
                .unwrap();
        }
        let mut conn = store.acquire().await.unwrap();
        assert!(conn.get_user("temp").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_verify_email_consumed_once() {
        let store = MemoryStore::new();
        seed_user(&store, "bob").await;
        let mut conn = store.acquire().await.unwrap();
        let record = conn
            .create_verify_email(CreateVerifyEmailParams {
                username: "bob".into(),
                email: "bob@example.com".into(),
                secret_code: "s".repeat(32),
            })
            .await
            .unwrap();
        assert!(!record.is_used);

        let wrong = UpdateVerifyEmailParams {
            id: record.id,
            secret_code: "x".repeat(32),
        };
        assert!(conn.update_verify_email(wrong).await.unwrap_err().is_not_found());

        let right = UpdateVerifyEmailParams {
            id: record.id,
            secret_code: "s".repeat(32),
        };
        assert!(conn.update_verify_email(right.clone()).await.unwrap().is_used);
        assert!(conn.update_verify_email(right).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let store = MemoryStore::new();
        seed_user(&store, "carol").await;
        let mut conn = store.acquire().await.unwrap();
        for currency in ["USD", "EUR", "CAD"] {
            conn.create_account(CreateAccountParams {
                owner: "carol".into(),
                balance: 0,
                currency: currency.into(),
            })
            .await
            .unwrap();
        }
        let page = conn
            .list_accounts(ListAccountsParams {
                owner: "carol".into(),
                limit: 2,
                offset: 1,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].currency, "EUR");
    }
}
