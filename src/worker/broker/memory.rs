//! In-process broker for tests and single-process development

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::TaskBroker;
use crate::worker::error::BrokerError;
use crate::worker::task::{Task, TaskId, TaskInfo, TaskOptions, TaskState};

#[derive(Default)]
pub struct MemoryTaskBroker {
    tasks: Mutex<HashMap<TaskId, TaskInfo>>,
}

impl MemoryTaskBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every task, oldest first
    pub async fn all(&self) -> Vec<TaskInfo> {
        let tasks = self.tasks.lock().await;
        let mut all: Vec<TaskInfo> = tasks.values().cloned().collect();
        all.sort_by_key(|t| t.id);
        all
    }

    pub async fn count_in_state(&self, state: TaskState) -> usize {
        let tasks = self.tasks.lock().await;
        tasks.values().filter(|t| t.state == state).count()
    }

    /// Make a delayed or backed-off task due immediately
    pub async fn make_due(&self, id: TaskId) -> Result<(), BrokerError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(&id).ok_or(BrokerError::NotFound(id))?;
        task.process_at = Utc::now();
        Ok(())
    }

    /// Apply `f` to a task currently in `Processing`
    async fn transition<F>(&self, id: TaskId, f: F) -> Result<(), BrokerError>
    where
        F: FnOnce(&mut TaskInfo, DateTime<Utc>) + Send,
    {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(&id).ok_or(BrokerError::NotFound(id))?;
        if task.state != TaskState::Processing {
            return Err(BrokerError::InvalidState {
                id,
                expected: TaskState::Processing,
                actual: task.state,
            });
        }
        let now = Utc::now();
        f(task, now);
        task.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl TaskBroker for MemoryTaskBroker {
    async fn enqueue(&self, task: Task, opts: TaskOptions) -> Result<TaskInfo, BrokerError> {
        let info = TaskInfo::new(task, &opts, Utc::now());
        let mut tasks = self.tasks.lock().await;
        tasks.insert(info.id, info.clone());
        Ok(info)
    }

    async fn dequeue(&self, queues: &[String]) -> Result<Option<TaskInfo>, BrokerError> {
        let now = Utc::now();
        let mut tasks = self.tasks.lock().await;

        for queue in queues {
            let next = tasks
                .values()
                .filter(|t| &t.queue == queue && t.state.is_ready() && t.process_at <= now)
                .min_by_key(|t| (t.process_at, t.id))
                .map(|t| t.id);

            if let Some(id) = next {
                if let Some(task) = tasks.get_mut(&id) {
                    task.state = TaskState::Processing;
                    task.updated_at = now;
                    return Ok(Some(task.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn complete(&self, id: TaskId) -> Result<(), BrokerError> {
        self.transition(id, |t, _| {
            t.state = TaskState::Succeeded;
        })
        .await
    }

    async fn retry(
        &self,
        id: TaskId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let error = error.to_string();
        self.transition(id, move |t, _| {
            t.state = TaskState::Retrying;
            t.retried += 1;
            t.last_error = Some(error);
            t.process_at = retry_at;
        })
        .await
    }

    async fn fail(&self, id: TaskId, error: &str) -> Result<(), BrokerError> {
        let error = error.to_string();
        self.transition(id, move |t, _| {
            t.state = TaskState::Failed;
            t.last_error = Some(error);
        })
        .await
    }

    async fn requeue(&self, id: TaskId) -> Result<(), BrokerError> {
        self.transition(id, |t, now| {
            t.state = TaskState::Pending;
            t.process_at = now;
        })
        .await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskInfo>, BrokerError> {
        let tasks = self.tasks.lock().await;
        Ok(tasks.get(&id).cloned())
    }

    async fn recover_stale(&self, threshold: Duration) -> Result<u64, BrokerError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(threshold)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut tasks = self.tasks.lock().await;
        let mut recovered = 0;
        for task in tasks.values_mut() {
            if task.state == TaskState::Processing && task.updated_at < cutoff {
                task.state = TaskState::Pending;
                task.process_at = now;
                task.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
