//! Notification actions: email, SMS, webhook and push.

use super::data::check_status;
use super::{OneOrMany, non_empty};
use crate::context::ExecutionContext;
use crate::error::RegistryError;
use crate::handler::{ActionHandler, HandlerError};
use crate::registry::{ActionRegistry, ConfigSchema, FieldType};
use async_trait::async_trait;
use haulflow_integration::{
    ConcurrencyLimiter, EmailMessage, HttpClient, HttpMethod, HttpRequest, Notification, Notifier,
    Ports, PushMessage, SmsMessage,
};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub(crate) fn register(
    registry: &mut ActionRegistry,
    ports: &Ports,
    limiter: &Arc<ConcurrencyLimiter>,
) -> Result<(), RegistryError> {
    registry.register(
        "notification.send_email",
        ConfigSchema::new()
            .required("to", FieldType::Any)
            .required("subject", FieldType::String)
            .required("body", FieldType::String),
        Arc::new(SendEmail {
            notifier: Arc::clone(&ports.notifier),
        }),
    )?;
    registry.register(
        "notification.send_sms",
        ConfigSchema::new()
            .required("to", FieldType::String)
            .required("message", FieldType::String),
        Arc::new(SendSms {
            notifier: Arc::clone(&ports.notifier),
        }),
    )?;
    registry.register(
        "notification.send_webhook",
        ConfigSchema::new()
            .required("url", FieldType::String)
            .optional("payload", FieldType::Any)
            .optional("headers", FieldType::Object),
        Arc::new(SendWebhook {
            http: Arc::clone(&ports.http),
            limiter: Arc::clone(limiter),
        }),
    )?;
    registry.register(
        "notification.send_push",
        ConfigSchema::new()
            .required("user_id", FieldType::String)
            .required("title", FieldType::String)
            .optional("body", FieldType::String),
        Arc::new(SendPush {
            notifier: Arc::clone(&ports.notifier),
        }),
    )
}

async fn deliver(
    notifier: &dyn Notifier,
    ctx: &ExecutionContext,
    notification: Notification,
) -> Result<JsonValue, HandlerError> {
    let key = ctx.idempotency_key();
    let delivery = ctx
        .call(notifier.send(&ctx.tenant, &notification, &key))
        .await?;
    debug!(
        instance = %ctx.instance,
        channel = notification.channel(),
        message_id = %delivery.message_id,
        "notification sent"
    );
    Ok(json!({
        "message_id": delivery.message_id,
        "sent_at": delivery.sent_at,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SendEmailConfig {
    to: OneOrMany,
    subject: String,
    body: String,
}

struct SendEmail {
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl ActionHandler for SendEmail {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: SendEmailConfig = ctx.config()?;
        let mut to = Vec::new();
        for address in config.to.into_vec() {
            let address = non_empty("to", &address)?;
            if !address.contains('@') {
                return Err(HandlerError::invalid_input(format!(
                    "'{address}' is not an email address"
                )));
            }
            to.push(address.to_string());
        }
        if to.is_empty() {
            return Err(HandlerError::invalid_input("to must name a recipient"));
        }
        let message = EmailMessage {
            to,
            subject: config.subject,
            body: config.body,
        };
        deliver(self.notifier.as_ref(), ctx, Notification::Email(message)).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SendSmsConfig {
    to: String,
    message: String,
}

struct SendSms {
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl ActionHandler for SendSms {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: SendSmsConfig = ctx.config()?;
        let message = SmsMessage {
            to: non_empty("to", &config.to)?.to_string(),
            message: config.message,
        };
        deliver(self.notifier.as_ref(), ctx, Notification::Sms(message)).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SendPushConfig {
    user_id: String,
    title: String,
    body: Option<String>,
}

struct SendPush {
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl ActionHandler for SendPush {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: SendPushConfig = ctx.config()?;
        let message = PushMessage {
            user_id: non_empty("user_id", &config.user_id)?.to_string(),
            title: config.title,
            body: config.body,
        };
        deliver(self.notifier.as_ref(), ctx, Notification::Push(message)).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SendWebhookConfig {
    url: String,
    #[serde(default)]
    payload: Option<JsonValue>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

struct SendWebhook {
    http: Arc<dyn HttpClient>,
    limiter: Arc<ConcurrencyLimiter>,
}

#[async_trait]
impl ActionHandler for SendWebhook {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: SendWebhookConfig = ctx.config()?;
        let url = non_empty("url", &config.url)?;

        let _permit = ctx.acquire_permit(&self.limiter).await?;
        let mut request = HttpRequest::new(HttpMethod::Post, url)
            .with_body(config.payload.unwrap_or_else(|| json!({})))
            .with_timeout(ctx.remaining())
            .with_idempotency_key(ctx.idempotency_key());
        for (name, value) in config.headers {
            request = request.with_header(name, value);
        }

        let response = ctx.call(self.http.send(request)).await?;
        check_status(url, &response)?;
        Ok(json!({
            "status_code": response.status,
            "delivered_at": ctx.now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{context, tenant};
    use crate::handler::HandlerErrorKind;
    use haulflow_integration::LimitConfig;
    use haulflow_integration::memory::{RecordingNotifier, ScriptedHttpClient};

    #[tokio::test]
    async fn email_accepts_one_or_many_recipients() {
        let notifier = Arc::new(RecordingNotifier::default());
        let handler = SendEmail {
            notifier: notifier.clone(),
        };

        let single = context(
            tenant(),
            "notification.send_email",
            json!({"to": "manager@example.com", "subject": "Big load", "body": "Check it"}),
        );
        handler.invoke(&single).await.expect("single");

        let many = context(
            tenant(),
            "notification.send_email",
            json!({"to": ["a@example.com", "manager@example.com"], "subject": "s", "body": "b"}),
        );
        let result = handler.invoke(&many).await.expect("many");
        assert!(result["message_id"].is_string());
        assert_eq!(notifier.emails_to("manager@example.com"), 2);
    }

    #[tokio::test]
    async fn malformed_address_is_invalid_input() {
        let handler = SendEmail {
            notifier: Arc::new(RecordingNotifier::default()),
        };
        let ctx = context(
            tenant(),
            "notification.send_email",
            json!({"to": "", "subject": "s", "body": "b"}),
        );
        let err = handler.invoke(&ctx).await.unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn webhook_posts_with_idempotency_key() {
        let http = Arc::new(ScriptedHttpClient::default());
        http.push_status(202, json!({}));
        let handler = SendWebhook {
            http: http.clone(),
            limiter: Arc::new(ConcurrencyLimiter::default()),
        };
        let ctx = context(
            tenant(),
            "notification.send_webhook",
            json!({"url": "https://hooks.example.com/x", "headers": {"X-Token": "t"}}),
        );

        let result = handler.invoke(&ctx).await.expect("invoke");
        assert_eq!(result["status_code"], 202);
        let requests = http.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, HttpMethod::Post);
        assert_eq!(requests[0].idempotency_key.as_deref(), Some(ctx.idempotency_key().as_str()));
        assert_eq!(requests[0].headers.get("X-Token").map(String::as_str), Some("t"));
    }

    #[tokio::test]
    async fn webhook_server_errors_are_upstream() {
        let http = Arc::new(ScriptedHttpClient::default());
        http.push_status(503, json!("busy"));
        let handler = SendWebhook {
            http,
            limiter: Arc::new(ConcurrencyLimiter::new(
                LimitConfig::default().with_limit("notification.send_webhook", 1),
            )),
        };
        let ctx = context(
            tenant(),
            "notification.send_webhook",
            json!({"url": "https://hooks.example.com/x"}),
        );
        let err = handler.invoke(&ctx).await.unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::Upstream);
        assert_eq!(handler.limiter.available("notification.send_webhook"), 1);
    }
}
