use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use super::subscription::NotificationPayload;
use crate::error::{AppResult, PushError};

#[async_trait]
pub trait PushSender: Send + Sync {
    /// Deliver one notification to one subscription
    async fn deliver(&self, subscription: &Value, notification: &NotificationPayload)
        -> AppResult<()>;
}

/// Body expected by the push server
#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    subs: &'a Value,
    notif: &'a NotificationPayload,
}

/// Push client that relays to the configured push server over HTTP
pub struct HttpPushSender {
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl HttpPushSender {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl PushSender for HttpPushSender {
    async fn deliver(
        &self,
        subscription: &Value,
        notification: &NotificationPayload,
    ) -> AppResult<()> {
        let endpoint = self.endpoint.as_deref().ok_or(PushError::EndpointMissing)?;

        let response = self
            .client
            .post(endpoint)
            .json(&PushRequest {
                subs: subscription,
                notif: notification,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Rejected { status, body }.into());
        }

        debug!("Push server accepted delivery ({})", response.status());
        info!("🔔 Push notification relayed: {}", notification.title);
        Ok(())
    }
}
