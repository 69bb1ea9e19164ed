//! ledgerd - Ledger Backend
//!
//! Atomic fund transfers between accounts on PostgreSQL, user provisioning,
//! and a durable task pipeline for side effects such as verification mail.
//!
//! # Modules
//!
//! - [`store`] - Typed CRUD plus the composite transactions (transfer, create user, verify email)
//! - [`db`] - Connection pool, schema bootstrap and storage errors
//! - [`user_auth`] - Input validation, password hashing and the user service
//! - [`worker`] - Task broker, distributor, processor and handlers
//! - [`mail`] - Outbound email senders
//! - [`random`] - Injectable randomness for secrets
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod db;
pub mod logging;
pub mod mail;
pub mod random;
pub mod store;
pub mod user_auth;
pub mod worker;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use store::{MemoryStore, PgStore, Queries, Store, StoreError, TxHandle};
pub use user_auth::{UserService, UserServiceError};
pub use worker::{BrokerTaskDistributor, TaskDistributor, TaskProcessor};
