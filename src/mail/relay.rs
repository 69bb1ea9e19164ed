//! HTTP mail relay client
//!
//! Posts each message as one JSON document to the relay endpoint.
//! Attachments are read from disk and inlined as base64.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use super::{EmailMessage, EmailSender, MailError};
use crate::config::EmailConfig;

pub struct RelayEmailSender {
    client: reqwest::Client,
    relay_url: String,
    api_key: Option<String>,
    from_name: String,
    from_address: String,
}

#[derive(Serialize)]
struct RelayAddress<'a> {
    name: &'a str,
    address: &'a str,
}

#[derive(Serialize)]
struct RelayAttachment {
    filename: String,
    content_base64: String,
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    from: RelayAddress<'a>,
    to: &'a [String],
    cc: &'a [String],
    bcc: &'a [String],
    subject: &'a str,
    html: &'a str,
    attachments: Vec<RelayAttachment>,
}

impl RelayEmailSender {
    pub fn new(config: &EmailConfig) -> Result<Self, MailError> {
        let relay_url = config
            .relay_url
            .clone()
            .ok_or_else(|| MailError::InvalidMessage("email.relay_url is not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MailError::Connection(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!(relay_url = %relay_url, "Mail relay configured");

        Ok(Self {
            client,
            relay_url,
            api_key: config.api_key.clone(),
            from_name: config.sender_name.clone(),
            from_address: config.sender_address.clone(),
        })
    }

    async fn load_attachments(message: &EmailMessage) -> Result<Vec<RelayAttachment>, MailError> {
        let mut attachments = Vec::with_capacity(message.attach_files.len());
        for path in &message.attach_files {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|source| MailError::Attachment {
                    path: path.display().to_string(),
                    source,
                })?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string());
            attachments.push(RelayAttachment {
                filename,
                content_base64: STANDARD.encode(bytes),
            });
        }
        Ok(attachments)
    }
}

#[async_trait]
impl EmailSender for RelayEmailSender {
    async fn send_email(&self, message: EmailMessage) -> Result<(), MailError> {
        message.validate()?;
        let attachments = Self::load_attachments(&message).await?;

        let request = RelayRequest {
            from: RelayAddress {
                name: &self.from_name,
                address: &self.from_address,
            },
            to: &message.to,
            cc: &message.cc,
            bcc: &message.bcc,
            subject: &message.subject,
            html: &message.content,
            attachments,
        };

        let mut builder = self.client.post(&self.relay_url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| MailError::Connection(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(to = ?message.to, subject = %message.subject, "Email handed to relay");
        Ok(())
    }
}
