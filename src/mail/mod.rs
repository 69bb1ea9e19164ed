//! Outbound email
//!
//! The task handlers only see [`EmailSender`]. Production posts to an HTTP
//! mail relay; development logs the message instead.

pub mod relay;

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

pub use relay::RelayEmailSender;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("Mail relay unreachable: {0}")]
    Connection(String),

    #[error("Mail relay rejected message: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to read attachment {path}: {source}")]
    Attachment {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

impl MailError {
    pub fn code(&self) -> &'static str {
        match self {
            MailError::Connection(_) => "MAIL_UNAVAILABLE",
            MailError::Rejected { .. } => "MAIL_REJECTED",
            MailError::Attachment { .. } => "MAIL_ATTACHMENT",
            MailError::InvalidMessage(_) => "MAIL_INVALID",
        }
    }
}

/// One outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub subject: String,
    /// HTML body
    pub content: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attach_files: Vec<PathBuf>,
}

impl EmailMessage {
    pub fn new(subject: impl Into<String>, content: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            subject: subject.into(),
            content: content.into(),
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            attach_files: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), MailError> {
        if self.to.is_empty() {
            return Err(MailError::InvalidMessage("no recipients".to_string()));
        }
        if self.subject.trim().is_empty() {
            return Err(MailError::InvalidMessage("empty subject".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, message: EmailMessage) -> Result<(), MailError>;
}

/// Writes messages to the log instead of delivering them
#[derive(Debug, Clone, Default)]
pub struct LogEmailSender {
    pub from_address: String,
}

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_email(&self, message: EmailMessage) -> Result<(), MailError> {
        message.validate()?;
        tracing::info!(
            from = %self.from_address,
            to = ?message.to,
            cc = ?message.cc,
            bcc = ?message.bcc,
            attachments = message.attach_files.len(),
            subject = %message.subject,
            "Email (log only)"
        );
        tracing::debug!(content = %message.content, "Email body");
        Ok(())
    }
}

/// Keeps every message in memory; can be told to fail the next sends
#[derive(Debug, Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<EmailMessage>>,
    failures_left: Mutex<usize>,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` sends with a connection error
    pub fn fail_next(&self, n: usize) {
        if let Ok(mut left) = self.failures_left.lock() {
            *left = n;
        }
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send_email(&self, message: EmailMessage) -> Result<(), MailError> {
        message.validate()?;
        if let Ok(mut left) = self.failures_left.lock() {
            if *left > 0 {
                *left -= 1;
                return Err(MailError::Connection("simulated relay outage".to_string()));
            }
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message);
        }
        Ok(())
    }
}
