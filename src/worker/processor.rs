//! Task Processor
//!
//! Polls the broker, dispatches each claimed task to its handler and records
//! the outcome.
//!
//! # Scheduling
//!
//! Queues carry weights. Every poll draws a fresh queue order where a queue's
//! chance of being tried first is proportional to its weight, so `critical`
//! (10) is preferred over `default` (5) without starving it.
//!
//! # Failure handling
//!
//! | Handler result              | Next state                              |
//! |-----------------------------|-----------------------------------------|
//! | `Ok`                        | `Succeeded`                             |
//! | `SkipRetry`                 | `Failed`                                |
//! | `Retry`, panic, deadline    | `Retrying` while `retried < max_retry`, |
//! |                             | else `Failed`                           |
//!
//! # Shutdown
//!
//! Dequeuing stops first. In-flight handlers get the grace period to finish;
//! stragglers are aborted and their tasks requeued without consuming a retry.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::broker::TaskBroker;
use super::error::BrokerError;
use super::handler::ServeMux;
use super::retry::RetryPolicy;
use super::task::{TaskId, TaskInfo};
use crate::config::{ConfigError, WorkerConfig};

/// Processor tuning
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// `(queue, weight)` pairs; weights must be positive
    pub queues: Vec<(String, u32)>,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub handler_timeout: Duration,
    pub shutdown_grace: Duration,
    pub stale_after: Duration,
    pub recovery_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for ProcessorConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            queues: config
                .queues
                .iter()
                .map(|q| (q.name.clone(), q.weight))
                .collect(),
            concurrency: config.concurrency,
            poll_interval: config.poll_interval(),
            handler_timeout: config.handler_timeout(),
            shutdown_grace: config.shutdown_grace(),
            stale_after: config.stale_after(),
            recovery_interval: config.recovery_interval(),
            retry_policy: config.retry.policy(),
        }
    }
}

impl ProcessorConfig {
    /// Reject settings the run loop cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::Invalid("processor needs at least one queue".into()));
        }
        if self.queues.iter().any(|(_, weight)| *weight == 0) {
            return Err(ConfigError::Invalid("queue weights must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be positive".into()));
        }
        if self.handler_timeout.is_zero() {
            return Err(ConfigError::Invalid("handler_timeout must be positive".into()));
        }
        if self.recovery_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "recovery_interval must be positive".into(),
            ));
        }
        // Otherwise the stale scan reclaims tasks whose handlers are still running
        if self.stale_after <= self.handler_timeout {
            return Err(ConfigError::Invalid(format!(
                "stale_after ({}ms) must exceed handler_timeout ({}ms)",
                self.stale_after.as_millis(),
                self.handler_timeout.as_millis()
            )));
        }
        Ok(())
    }
}

/// What happened to one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    /// Scheduled for another attempt
    Retried,
    Failed,
}

pub struct TaskProcessor {
    runner: JobRunner,
    config: ProcessorConfig,
    rng: Mutex<StdRng>,
}

impl TaskProcessor {
    pub fn new(broker: Arc<dyn TaskBroker>, mux: ServeMux, config: ProcessorConfig) -> Self {
        Self {
            runner: JobRunner {
                broker,
                mux: Arc::new(mux),
                retry_policy: config.retry_policy,
                handler_timeout: config.handler_timeout,
            },
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Pin the queue-order generator
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Queue order for the next poll
    pub fn queue_order(&self) -> Vec<String> {
        match self.rng.lock() {
            Ok(mut rng) => weighted_order(&self.config.queues, &mut *rng),
            Err(poisoned) => weighted_order(&self.config.queues, &mut *poisoned.into_inner()),
        }
    }

    /// Claim and run at most one task on the calling task.
    pub async fn process_one(&self) -> Result<Option<(TaskId, TaskOutcome)>, BrokerError> {
        let order = self.queue_order();
        match self.runner.broker.dequeue(&order).await? {
            Some(task) => {
                let id = task.id;
                Ok(Some((id, self.runner.run(task).await)))
            }
            None => Ok(None),
        }
    }

    /// Spawn the polling loop
    pub fn start(self) -> Result<ProcessorHandle, ConfigError> {
        self.config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(Arc::new(self).run(shutdown_rx));
        Ok(ProcessorHandle {
            shutdown: shutdown_tx,
            join,
        })
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting task processor"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let in_flight: Arc<Mutex<HashSet<TaskId>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut jobs = JoinSet::new();

        let mut recovery = tokio::time::interval(self.config.recovery_interval);
        recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            while let Some(res) = jobs.try_join_next() {
                if let Err(e) = res {
                    error!(error = %e, "Task job terminated abnormally");
                }
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,

                _ = recovery.tick() => {
                    match self.runner.broker.recover_stale(self.config.stale_after).await {
                        Ok(0) => debug!("No stale tasks found"),
                        Ok(n) => info!(count = n, "Returned stale tasks to queue"),
                        Err(e) => error!(error = %e, "Stale task scan failed"),
                    }
                }

                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break };

                    let order = self.queue_order();
                    match self.runner.broker.dequeue(&order).await {
                        Ok(Some(task)) => {
                            let id = task.id;
                            track(&in_flight, id, true);

                            let runner = self.runner.clone();
                            let in_flight = in_flight.clone();
                            jobs.spawn(async move {
                                let _permit = permit;
                                runner.run(task).await;
                                track(&in_flight, id, false);
                            });
                        }
                        Ok(None) => {
                            drop(permit);
                            tokio::select! {
                                _ = tokio::time::sleep(self.config.poll_interval) => {}
                                _ = shutdown_rx.changed() => break,
                            }
                        }
                        Err(e) => {
                            drop(permit);
                            error!(error = %e, "Dequeue failed");
                            tokio::select! {
                                _ = tokio::time::sleep(self.config.poll_interval) => {}
                                _ = shutdown_rx.changed() => break,
                            }
                        }
                    }
                }
            }
        }

        self.drain(jobs, in_flight).await;
        info!("Task processor stopped");
    }

    async fn drain(&self, mut jobs: JoinSet<()>, in_flight: Arc<Mutex<HashSet<TaskId>>>) {
        info!(
            in_flight = jobs.len(),
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "Draining task processor"
        );

        let finished = tokio::time::timeout(self.config.shutdown_grace, async {
            while jobs.join_next().await.is_some() {}
        })
        .await;

        if finished.is_ok() {
            return;
        }

        warn!(remaining = jobs.len(), "Grace period elapsed, aborting handlers");
        jobs.abort_all();
        while jobs.join_next().await.is_some() {}

        let stragglers: Vec<TaskId> = match in_flight.lock() {
            Ok(mut set) => set.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        };
        for id in stragglers {
            match self.runner.broker.requeue(id).await {
                Ok(()) => info!(task_id = %id, "Requeued aborted task"),
                Err(e) => warn!(task_id = %id, error = %e, "Failed to requeue aborted task"),
            }
        }
    }
}

fn track(in_flight: &Mutex<HashSet<TaskId>>, id: TaskId, running: bool) {
    let mut set = match in_flight.lock() {
        Ok(set) => set,
        Err(poisoned) => poisoned.into_inner(),
    };
    if running {
        set.insert(id);
    } else {
        set.remove(&id);
    }
}

/// Handle to a running processor
pub struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Stop dequeuing, drain in-flight work and wait for the loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "Task processor loop panicked");
        }
    }
}

/// Runs one claimed task and records its outcome
#[derive(Clone)]
struct JobRunner {
    broker: Arc<dyn TaskBroker>,
    mux: Arc<ServeMux>,
    retry_policy: RetryPolicy,
    handler_timeout: Duration,
}

impl JobRunner {
    async fn run(&self, task: TaskInfo) -> TaskOutcome {
        let Some(handler) = self.mux.get(&task.task_type) else {
            let reason = format!("handler not found for task type {}", task.task_type);
            return self.record_failure(&task, reason, false).await;
        };

        let attempt = AssertUnwindSafe(handler.process_task(task.clone())).catch_unwind();
        match tokio::time::timeout(self.handler_timeout, attempt).await {
            Ok(Ok(Ok(()))) => {
                if let Err(e) = self.broker.complete(task.id).await {
                    error!(task_id = %task.id, error = %e, "Failed to mark task succeeded");
                }
                debug!(task_id = %task.id, task_type = %task.task_type, "Task succeeded");
                TaskOutcome::Succeeded
            }
            Ok(Ok(Err(e))) => {
                let skip = e.is_skip_retry();
                self.record_failure(&task, e.to_string(), skip).await
            }
            Ok(Err(panic)) => {
                let reason = format!("panic: {}", panic_message(panic.as_ref()));
                self.record_failure(&task, reason, false).await
            }
            Err(_) => {
                let reason = format!(
                    "handler exceeded deadline of {}ms",
                    self.handler_timeout.as_millis()
                );
                self.record_failure(&task, reason, false).await
            }
        }
    }

    async fn record_failure(
        &self,
        task: &TaskInfo,
        reason: String,
        skip_retry: bool,
    ) -> TaskOutcome {
        if !skip_retry && task.can_retry() {
            let delay = self.retry_policy.delay(task.retried);
            let retry_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            error!(
                task_id = %task.id,
                task_type = %task.task_type,
                payload = %task.payload_str(),
                retried = task.retried,
                max_retry = task.max_retry,
                retry_in_ms = delay.as_millis() as u64,
                error = %reason,
                "Task failed, will retry"
            );
            if let Err(e) = self.broker.retry(task.id, &reason, retry_at).await {
                error!(task_id = %task.id, error = %e, "Failed to schedule retry");
            }
            TaskOutcome::Retried
        } else {
            error!(
                task_id = %task.id,
                task_type = %task.task_type,
                payload = %task.payload_str(),
                retried = task.retried,
                max_retry = task.max_retry,
                skip_retry,
                error = %reason,
                "Task failed permanently"
            );
            if let Err(e) = self.broker.fail(task.id, &reason).await {
                error!(task_id = %task.id, error = %e, "Failed to mark task failed");
            }
            TaskOutcome::Failed
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Weighted random permutation of `queues`
fn weighted_order<R: Rng + ?Sized>(queues: &[(String, u32)], rng: &mut R) -> Vec<String> {
    let mut remaining: Vec<&(String, u32)> = queues.iter().collect();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let total: u64 = remaining.iter().map(|(_, w)| u64::from(*w)).sum();
        if total == 0 {
            order.extend(remaining.drain(..).map(|(name, _)| name.clone()));
            break;
        }

        let mut pick = rng.gen_range(0..total);
        let mut idx = remaining.len() - 1;
        for (i, (_, weight)) in remaining.iter().enumerate() {
            let weight = u64::from(*weight);
            if pick < weight {
                idx = i;
                break;
            }
            pick -= weight;
        }
        order.push(remaining.remove(idx).0.clone());
    }
    order
}
