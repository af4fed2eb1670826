//! Notification transport port.
//!
//! Email, SMS, and push transports live outside the engine. Each send carries
//! an idempotency key; transports must treat a repeated key as the same
//! message and answer with the original [`Delivery`].

use crate::error::IntegrationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haulflow_core::TenantScope;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsMessage {
    pub to: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub user_id: String,
    pub title: String,
    pub body: Option<String>,
}

/// One outbound notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum Notification {
    Email(EmailMessage),
    Sms(SmsMessage),
    Push(PushMessage),
}

impl Notification {
    #[must_use]
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Email(_) => "email",
            Self::Sms(_) => "sms",
            Self::Push(_) => "push",
        }
    }
}

/// Acknowledgement of an accepted notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub message_id: String,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        tenant: &TenantScope,
        notification: &Notification,
        idempotency_key: &str,
    ) -> Result<Delivery, IntegrationError>;
}
