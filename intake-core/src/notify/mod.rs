//! Outbound notification surface: the minimum reply/alert path used by
//! approval workflows and operator holds.

use std::sync::Mutex;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

use intake_config::SmtpConfig;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// SMTP-backed notifier.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| CoreError::Internal(e.to_string()))?
                .port(config.port);
        if !config.user.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.user.clone(),
                config.password.clone(),
            ));
        }
        let from: Mailbox = config.from.parse().map_err(|e| {
            CoreError::Internal(format!("bad SMTP from address: {e}"))
        })?;
        Ok(Self { transport: builder.build(), from })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let to: Mailbox = notification.to.parse().map_err(|e| {
            CoreError::Internal(format!(
                "bad recipient {}: {e}",
                notification.to
            ))
        })?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(notification.subject.clone())
            .body(notification.body.clone())
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| CoreError::Internal(format!("smtp send: {e}")))?;
        info!(to = %notification.to, subject = %notification.subject, "notification sent");
        Ok(())
    }
}

/// Swallows notifications when no SMTP relay is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        warn!(
            to = %notification.to,
            subject = %notification.subject,
            "notification dropped: no SMTP relay configured"
        );
        Ok(())
    }
}

/// Capturing notifier for tests.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    fail_times: Mutex<u32>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` notify calls fail, to exercise retry policies.
    pub fn fail_next(&self, n: u32) {
        *self.fail_times.lock().unwrap() = n;
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        {
            let mut fail_times = self.fail_times.lock().unwrap();
            if *fail_times > 0 {
                *fail_times -= 1;
                return Err(CoreError::Internal(
                    "injected notify failure".into(),
                ));
            }
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
