//! Task Distributor
//!
//! Publishes typed payloads onto the broker. The user service depends on the
//! [`TaskDistributor`] trait so tests can observe or fail enqueues.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::broker::TaskBroker;
use super::error::BrokerError;
use super::task::{Task, TaskInfo, TaskOptions};
use super::task_send_verify_email::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL};

#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn distribute_task_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        opts: TaskOptions,
    ) -> Result<TaskInfo, BrokerError>;
}

/// Distributor writing straight to a [`TaskBroker`]
#[derive(Clone)]
pub struct BrokerTaskDistributor {
    broker: Arc<dyn TaskBroker>,
}

impl BrokerTaskDistributor {
    pub fn new(broker: Arc<dyn TaskBroker>) -> Self {
        Self { broker }
    }

    /// Serialize `payload` as JSON and enqueue it under `task_type`
    pub async fn enqueue<T>(
        &self,
        task_type: &str,
        payload: &T,
        opts: TaskOptions,
    ) -> Result<TaskInfo, BrokerError>
    where
        T: Serialize + Sync,
    {
        let task = Task::json(task_type, payload)?;
        let info = self.broker.enqueue(task, opts).await?;

        tracing::info!(
            task_id = %info.id,
            task_type = %info.task_type,
            payload = %info.payload_str(),
            queue = %info.queue,
            max_retry = info.max_retry,
            process_at = %info.process_at,
            "Enqueued task"
        );
        Ok(info)
    }
}

#[async_trait]
impl TaskDistributor for BrokerTaskDistributor {
    async fn distribute_task_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        opts: TaskOptions,
    ) -> Result<TaskInfo, BrokerError> {
        self.enqueue(TASK_SEND_VERIFY_EMAIL, payload, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::broker::MemoryTaskBroker;
    use crate::worker::task::TaskState;
    use std::time::Duration;

    #[tokio::test]
    async fn test_distribute_verify_email_carries_options() {
        let broker = Arc::new(MemoryTaskBroker::new());
        let distributor = BrokerTaskDistributor::new(broker.clone());

        let payload = PayloadSendVerifyEmail {
            username: "alice".to_string(),
        };
        let opts = TaskOptions::default()
            .max_retry(10)
            .process_in(Duration::from_secs(10))
            .queue("critical");

        let info = distributor
            .distribute_task_send_verify_email(&payload, opts)
            .await
            .unwrap();

        assert_eq!(info.task_type, TASK_SEND_VERIFY_EMAIL);
        assert_eq!(info.queue, "critical");
        assert_eq!(info.max_retry, 10);
        assert_eq!(info.state, TaskState::Pending);
        assert!(info.process_at > info.created_at);

        let stored = broker.get(info.id).await.unwrap().unwrap();
        let decoded: PayloadSendVerifyEmail = serde_json::from_slice(&stored.payload).unwrap();
        assert_eq!(decoded, payload);
    }
}
