//! Data Access Layer
//!
//! Typed CRUD over the ledger tables plus the composite transactions built on
//! top of them.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────────┐     ┌──────────────┐     ┌─────────────────────┐
//!  │ transfer_tx       │────▶│   exec_tx    │────▶│ TxHandle (Queries)  │
//!  │ create_user_tx    │     │ commit /     │     │ scoped to one tx    │
//!  │ verify_email_tx   │     │ rollback     │     └─────────────────────┘
//!  └───────────────────┘     └──────────────┘               │
//!                                                ┌──────────┴──────────┐
//!                                                ▼                     ▼
//!                                           PgStore (sqlx)      MemoryStore
//! ```
//!
//! Engines only see the [`Store`] / [`Queries`] traits, so a test double can
//! stand in for PostgreSQL.

pub mod exec_tx;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod tx_create_user;
pub mod tx_transfer;
pub mod tx_verify_email;

use async_trait::async_trait;
use uuid::Uuid;

pub use crate::db::error::{ErrorKind, HookError, StoreError};
pub use exec_tx::exec_tx;
pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PgStore;
pub use tx_create_user::{AfterCreateHook, CreateUserTxParams};
pub use tx_transfer::{TransferTxParams, TransferTxResult};
pub use tx_verify_email::{VerifyEmailTxParams, VerifyEmailTxResult};

/// Row-level operations.
///
/// Implemented by autocommit connections and by transaction handles alike;
/// inside a transaction every call sees that transaction's uncommitted writes.
#[async_trait]
pub trait Queries: Send {
    // === Accounts ===
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError>;
    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError>;
    /// Read an account holding a row lock until the transaction ends
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError>;
    async fn list_accounts(&mut self, arg: ListAccountsParams)
    -> Result<Vec<Account>, StoreError>;
    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError>;
    /// `balance = balance + amount` as a single conditional update
    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError>;
    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError>;

    // === Entries ===
    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError>;
    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError>;
    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError>;

    // === Transfers ===
    async fn create_transfer(&mut self, arg: CreateTransferParams)
    -> Result<Transfer, StoreError>;
    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;
    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError>;

    // === Users ===
    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError>;
    async fn get_user(&mut self, username: &str) -> Result<User, StoreError>;
    async fn get_user_by_email(&mut self, email: &str) -> Result<User, StoreError>;
    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError>;

    // === Sessions ===
    async fn create_session(&mut self, arg: CreateSessionParams) -> Result<Session, StoreError>;
    async fn get_session(&mut self, id: Uuid) -> Result<Session, StoreError>;
    async fn block_session(&mut self, id: Uuid) -> Result<Session, StoreError>;

    // === Email verification ===
    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError>;
    /// Mark a record used; NotFound unless it is unused, unexpired and the code matches
    async fn update_verify_email(
        &mut self,
        arg: UpdateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError>;
}

/// Transaction-scoped query handle.
///
/// Dropping the handle without calling [`TxHandle::commit`] discards every
/// write made through it.
#[async_trait]
pub trait TxHandle: Queries {
    fn queries(&mut self) -> &mut dyn Queries;
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Storage capability consumed by the engines, the user service and the
/// task handlers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Autocommit handle: each call is its own transaction
    async fn acquire(&self) -> Result<Box<dyn Queries>, StoreError>;

    /// Open a transaction with the backend's default isolation level
    async fn begin(&self) -> Result<Box<dyn TxHandle>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;

    /// Move funds between two accounts atomically
    async fn transfer_tx(&self, arg: TransferTxParams) -> Result<TransferTxResult, StoreError> {
        tx_transfer::transfer_tx(self, arg).await
    }

    /// Create a user and run its after-create hook in the same transaction
    async fn create_user_tx(&self, arg: CreateUserTxParams) -> Result<User, StoreError> {
        tx_create_user::create_user_tx(self, arg).await
    }

    /// Consume a verification code and flag the user verified
    async fn verify_email_tx(
        &self,
        arg: VerifyEmailTxParams,
    ) -> Result<VerifyEmailTxResult, StoreError> {
        tx_verify_email::verify_email_tx(self, arg).await
    }
}
