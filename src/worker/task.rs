//! Task identity, options and lifecycle state
//!
//! State IDs are stored in PostgreSQL as SMALLINT.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::QUEUE_DEFAULT;

/// Task lifecycle
///
/// ```text
/// Pending ──▶ Processing ──┬──▶ Succeeded
///                ▲         ├──▶ Failed
///                │         └──▶ Retrying ──(backoff elapsed)──┐
///                └────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum TaskState {
    /// Waiting for its `process_at` to pass
    Pending = 0,

    /// Claimed by a processor
    Processing = 10,

    /// Failed at least once; scheduled for another attempt
    Retrying = 20,

    /// Terminal: handler returned Ok
    Succeeded = 30,

    /// Terminal: retries exhausted or handler asked to skip retry
    Failed = -10,
}

impl TaskState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    /// Eligible for dequeue once due
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Retrying)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TaskState::Pending),
            10 => Some(TaskState::Processing),
            20 => Some(TaskState::Retrying),
            30 => Some(TaskState::Succeeded),
            -10 => Some(TaskState::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Processing => "PROCESSING",
            TaskState::Retrying => "RETRYING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task ID, a ULID so ids sort by creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(TaskId)
    }
}

/// A typed unit of work: a type tag plus its JSON body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_type: String,
    pub payload: Vec<u8>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
        }
    }

    /// Serialize `payload` to JSON
    pub fn json<T: Serialize>(
        task_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(task_type, serde_json::to_vec(payload)?))
    }
}

/// Default retry budget when the caller sets none
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Enqueue options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    /// Retries after the first attempt; 0 means a single attempt
    pub max_retry: u32,
    /// Delay before the first attempt
    pub process_in: Duration,
    pub queue: String,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            process_in: Duration::ZERO,
            queue: QUEUE_DEFAULT.to_string(),
        }
    }
}

impl TaskOptions {
    pub fn max_retry(mut self, n: u32) -> Self {
        self.max_retry = n;
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = delay;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }
}

/// Stored task with its scheduling metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub state: TaskState,
    /// Retries consumed so far
    pub retried: u32,
    pub max_retry: u32,
    pub last_error: Option<String>,
    /// Earliest time the task may be claimed
    pub process_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskInfo {
    /// Fresh record for an enqueue at `now`
    pub fn new(task: Task, opts: &TaskOptions, now: DateTime<Utc>) -> Self {
        let delay = chrono::Duration::from_std(opts.process_in).unwrap_or(chrono::Duration::MAX);
        Self {
            id: TaskId::new(),
            task_type: task.task_type,
            payload: task.payload,
            queue: opts.queue.clone(),
            state: TaskState::Pending,
            retried: 0,
            max_retry: opts.max_retry,
            last_error: None,
            process_at: now.checked_add_signed(delay).unwrap_or(now),
            created_at: now,
            updated_at: now,
        }
    }

    /// Payload as text, for logs
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Whether a failed attempt may be retried
    pub fn can_retry(&self) -> bool {
        self.retried < self.max_retry
    }
}
