//! Dispatchers: SMTP via lettre, and a dry-run sink that never sends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use uuid::Uuid;

use super::{Dispatcher, EmailDraft, SendReceipt};
use crate::error::SendError;

/// SMTP reply codes that mean the credentials were refused.
const AUTH_FAILURE_CODES: &[&str] = &["530", "534", "535"];

/// SMTP connection settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub from_name: String,
    pub timeout: Duration,
}

impl SmtpConfig {
    /// Whether enough is configured to attempt a real send.
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
            && !self.username.is_empty()
            && !self.password.expose_secret().is_empty()
            && !self.from_address.is_empty()
    }
}

/// Sends drafts through an authenticated SMTP relay.
pub struct SmtpDispatcher {
    config: SmtpConfig,
}

impl SmtpDispatcher {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    /// Build and send one message. Blocking; run on the blocking pool.
    fn send_blocking(
        config: &SmtpConfig,
        draft: &EmailDraft,
        recipient: &str,
    ) -> Result<String, SendError> {
        let from: Mailbox = if config.from_name.is_empty() {
            config.from_address.parse::<Mailbox>()
        } else {
            format!("{} <{}>", config.from_name, config.from_address).parse::<Mailbox>()
        }
        .map_err(|e| SendError::AuthError(format!("invalid sender address: {e}")))?;

        let to: Mailbox = recipient
            .trim()
            .parse::<Mailbox>()
            .map_err(|e| SendError::RecipientRejected(format!("invalid recipient {recipient}: {e}")))?;

        let domain = config
            .from_address
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or("localhost");
        let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(draft.subject.as_str())
            .message_id(Some(message_id.clone()))
            .body(draft.body.clone())
            .map_err(|e| SendError::RecipientRejected(format!("failed to build message: {e}")))?;

        let builder = if config.port == 465 {
            SmtpTransport::relay(&config.host)
        } else {
            SmtpTransport::starttls_relay(&config.host)
        }
        .map_err(|e| SendError::TransientNetwork(format!("SMTP relay error: {e}")))?;

        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ))
            .timeout(Some(config.timeout))
            .build();

        transport.send(&email).map_err(classify_smtp_error)?;
        Ok(message_id)
    }
}

/// Map a transport failure onto the send classifications.
fn classify_smtp_error(e: lettre::transport::smtp::Error) -> SendError {
    let code = e.status().map(|c| c.to_string());
    if code
        .as_deref()
        .is_some_and(|c| AUTH_FAILURE_CODES.contains(&c))
    {
        SendError::AuthError(format!("SMTP authentication failed: {e}"))
    } else if e.is_permanent() {
        SendError::RecipientRejected(format!("SMTP permanent failure: {e}"))
    } else {
        SendError::TransientNetwork(format!("SMTP send failed: {e}"))
    }
}

#[async_trait]
impl Dispatcher for SmtpDispatcher {
    async fn send(&self, draft: &EmailDraft, recipient: &str) -> Result<SendReceipt, SendError> {
        let config = self.config.clone();
        let draft_owned = draft.clone();
        let to = recipient.to_string();

        let message_id =
            tokio::task::spawn_blocking(move || Self::send_blocking(&config, &draft_owned, &to))
                .await
                .map_err(|e| SendError::TransientNetwork(format!("send task failed: {e}")))??;

        info!(recipient, message_id = %message_id, "Email sent");
        Ok(SendReceipt {
            message_id,
            recipient: recipient.to_string(),
            sent_at: Utc::now(),
        })
    }
}

/// Accepts every draft without contacting a transport.
#[derive(Debug, Default)]
pub struct DryRunDispatcher {
    sent: AtomicUsize,
}

impl DryRunDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of drafts "sent" so far.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for DryRunDispatcher {
    async fn send(&self, draft: &EmailDraft, recipient: &str) -> Result<SendReceipt, SendError> {
        if !recipient.contains('@') {
            return Err(SendError::RecipientRejected(format!(
                "invalid recipient {recipient}"
            )));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        warn!(recipient, subject = %draft.subject, "Dry run: email not sent");
        Ok(SendReceipt {
            message_id: format!("dry-run-{}", Uuid::new_v4()),
            recipient: recipient.to_string(),
            sent_at: Utc::now(),
        })
    }
}
