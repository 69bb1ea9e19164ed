//! Asynchronous Task Pipeline
//!
//! Side effects that must not block or fail the transactional path (mail
//! delivery) run here with at-least-once, retrying execution.
//!
//! ```text
//!   user service ──▶ TaskDistributor ──▶ TaskBroker (tasks table)
//!                                             │ dequeue (weighted queues)
//!                                             ▼
//!                                       TaskProcessor ──▶ ServeMux ──▶ TaskHandler
//!                                             │
//!                             complete / retry / fail / requeue
//! ```

pub mod broker;
pub mod distributor;
pub mod error;
pub mod handler;
pub mod processor;
pub mod retry;
pub mod task;
pub mod task_send_verify_email;

pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";

pub use broker::{MemoryTaskBroker, PgTaskBroker, TaskBroker};
pub use distributor::{BrokerTaskDistributor, TaskDistributor};
pub use error::{BoxError, BrokerError, HandlerError};
pub use handler::{HandlerFn, ServeMux, TaskHandler, handler_fn};
pub use processor::{ProcessorConfig, ProcessorHandle, TaskOutcome, TaskProcessor};
pub use retry::RetryPolicy;
pub use task::{Task, TaskId, TaskInfo, TaskOptions, TaskState};
pub use task_send_verify_email::{
    PayloadSendVerifyEmail, SECRET_CODE_LEN, SendVerifyEmailHandler, TASK_SEND_VERIFY_EMAIL,
    verify_email_url,
};
