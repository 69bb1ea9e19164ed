//! Durable task queue
//!
//! All state changes on a claimed task are compare-and-set against
//! `Processing`, so a task recovered by one processor cannot be completed
//! twice by another.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::BrokerError;
use super::task::{Task, TaskId, TaskInfo, TaskOptions};

pub use memory::MemoryTaskBroker;
pub use postgres::PgTaskBroker;

#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Persist a new task in `Pending`
    async fn enqueue(&self, task: Task, opts: TaskOptions) -> Result<TaskInfo, BrokerError>;

    /// Claim the oldest due task, trying `queues` in order. The returned task
    /// is in `Processing`.
    async fn dequeue(&self, queues: &[String]) -> Result<Option<TaskInfo>, BrokerError>;

    /// `Processing -> Succeeded`
    async fn complete(&self, id: TaskId) -> Result<(), BrokerError>;

    /// `Processing -> Retrying`, consuming one retry
    async fn retry(
        &self,
        id: TaskId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), BrokerError>;

    /// `Processing -> Failed`
    async fn fail(&self, id: TaskId, error: &str) -> Result<(), BrokerError>;

    /// `Processing -> Pending` without consuming a retry
    async fn requeue(&self, id: TaskId) -> Result<(), BrokerError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskInfo>, BrokerError>;

    /// Return tasks stuck in `Processing` for longer than `threshold` to
    /// `Pending`. Returns how many were recovered.
    async fn recover_stale(&self, threshold: Duration) -> Result<u64, BrokerError>;
}
