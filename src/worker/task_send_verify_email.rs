//! Verification email task
//!
//! Enqueued when a user registers; the handler creates a one-time
//! verification record and mails its link to the user.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::HandlerError;
use super::handler::TaskHandler;
use super::task::TaskInfo;
use crate::mail::{EmailMessage, EmailSender};
use crate::random::RandomSource;
use crate::store::{CreateVerifyEmailParams, Store};

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send-verify-email";

/// Length of the verification secret
pub const SECRET_CODE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

/// Link the user follows to confirm their address
pub fn verify_email_url(host: &str, email_id: i64, secret_code: &str) -> String {
    format!(
        "{}/v1/verify_email?email_id={}&secret_code={}",
        host.trim_end_matches('/'),
        email_id,
        secret_code
    )
}

pub struct SendVerifyEmailHandler {
    store: Arc<dyn Store>,
    mailer: Arc<dyn EmailSender>,
    random: Arc<dyn RandomSource>,
    verify_host: String,
}

impl SendVerifyEmailHandler {
    pub fn new(
        store: Arc<dyn Store>,
        mailer: Arc<dyn EmailSender>,
        random: Arc<dyn RandomSource>,
        verify_host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailer,
            random,
            verify_host: verify_host.into(),
        }
    }
}

#[async_trait]
impl TaskHandler for SendVerifyEmailHandler {
    async fn process_task(&self, task: TaskInfo) -> Result<(), HandlerError> {
        // A payload that does not decode never will
        let payload: PayloadSendVerifyEmail = serde_json::from_slice(&task.payload)
            .map_err(|e| HandlerError::skip_retry(format!("failed to decode payload: {}", e)))?;

        let mut q = self.store.acquire().await.map_err(HandlerError::retry)?;

        // The user row may not be committed yet; retry until it is
        let user = q.get_user(&payload.username).await.map_err(|e| {
            if e.is_not_found() {
                HandlerError::retry(format!("user {} does not exist yet", payload.username))
            } else {
                HandlerError::retry(e)
            }
        })?;

        let verify_email = q
            .create_verify_email(CreateVerifyEmailParams {
                username: user.username.clone(),
                email: user.email.clone(),
                secret_code: self.random.random_string(SECRET_CODE_LEN),
            })
            .await
            .map_err(HandlerError::retry)?;

        let url = verify_email_url(
            &self.verify_host,
            verify_email.id,
            &verify_email.secret_code,
        );
        let content = format!(
            "Hello {},<br/>\nThank you for registering with us!<br/>\nPlease <a href=\"{}\">click here</a> to verify your email address.<br/>\n",
            user.full_name, url
        );
        let message = EmailMessage::new("Welcome to Ledger", content, vec![user.email.clone()]);

        self.mailer
            .send_email(message)
            .await
            .map_err(HandlerError::retry)?;

        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            username = %user.username,
            email = %user.email,
            email_id = verify_email.id,
            "Processed task"
        );
        Ok(())
    }
}
