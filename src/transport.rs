//! Channel transports. Each channel queue talks to exactly one of these.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::Channel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub provider_id: String,
}

/// One outbound send. Transports are not assumed to be idempotent, so the
/// job id is passed along for providers that can deduplicate on it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, job_id: Uuid, destination: &str, content: &Content) -> Result<Receipt>;
}

/// Posts each message as JSON to a relay service (an email or SMS gateway
/// bridge). Any non-success status is a transport error. A success status
/// with an unreadable body is a protocol error, since the relay may already
/// have sent the message.
pub struct WebhookTransport {
    channel: Channel,
    endpoint: url::Url,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct WebhookRequest<'a> {
    channel: Channel,
    destination: &'a str,
    subject: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct WebhookResponse {
    id: String,
}

impl WebhookTransport {
    pub fn new(channel: Channel, endpoint: url::Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|_| Error::Configuration(channel))?;
        Ok(Self {
            channel,
            endpoint,
            client,
        })
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn send(&self, job_id: Uuid, destination: &str, content: &Content) -> Result<Receipt> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Idempotency-Key", job_id.to_string())
            .json(&WebhookRequest {
                channel: self.channel,
                destination,
                subject: &content.subject,
                body: &content.body,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "{} relay returned {status}: {}",
                self.channel,
                detail.trim()
            )));
        }

        let WebhookResponse { id } = response.json().await.map_err(|err| {
            Error::Protocol(format!("{} relay returned {status}: {err}", self.channel))
        })?;
        tracing::debug!(channel = %self.channel, provider_id = %id, "relay accepted message");
        Ok(Receipt { provider_id: id })
    }
}
