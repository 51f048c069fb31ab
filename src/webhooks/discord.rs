use crate::error::{OrchestratorError, Result};
use crate::webhooks::{Alert, AlertLevel, AlertSink};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

pub struct DiscordWebhook {
    client: Client,
    webhook_url: String,
    rate_limiter: tokio::sync::Semaphore,
}

impl DiscordWebhook {
    pub fn new(webhook_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OrchestratorError::ExternalCall(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            webhook_url,
            rate_limiter: tokio::sync::Semaphore::new(5), // Discord allows 5 requests per 2 seconds
        })
    }

    async fn send_webhook(&self, payload: &Value) -> Result<()> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| OrchestratorError::ExternalCall(format!("Rate limiter error: {}", e)))?;

        let mut attempt = 0;
        loop {
            let response = self
                .client
                .post(&self.webhook_url)
                .json(payload)
                .send()
                .await
                .map_err(|e| OrchestratorError::ExternalCall(format!("Failed to send webhook: {}", e)))?;

            if response.status().is_success() {
                debug!("Discord webhook sent successfully");
                break;
            } else if response.status().as_u16() == 429 && attempt < MAX_RATE_LIMIT_RETRIES {
                attempt += 1;
                warn!("Discord webhook rate limited, waiting...");
                sleep(Duration::from_secs(2)).await;
            } else {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(OrchestratorError::ExternalCall(format!(
                    "Discord webhook failed with status {}: {}",
                    status, body
                )));
            }
        }

        // respect discord rate limits
        sleep(Duration::from_millis(400)).await;
        Ok(())
    }

    fn create_alert_embed(&self, alert: &Alert) -> Value {
        let (color, emoji) = match alert.level {
            AlertLevel::Critical => (0xFF0000, "🚨"),
            AlertLevel::Warning => (0xFFFF00, "⚠️"),
            AlertLevel::Info => (0x0099FF, "ℹ️"),
        };

        let mut fields = Vec::new();
        if let Some(ref agent) = alert.agent {
            fields.push(json!({
                "name": "Agent",
                "value": format!("`{}`", agent),
                "inline": true
            }));
        }
        fields.push(json!({
            "name": "Level",
            "value": alert.level.to_string(),
            "inline": true
        }));

        json!({
            "embeds": [{
                "title": format!("{} {}", emoji, alert.title),
                "description": alert.message,
                "color": color,
                "fields": fields,
                "timestamp": alert.raised_at.to_rfc3339(),
                "footer": {
                    "text": "Recovery Orchestrator"
                }
            }]
        })
    }
}

#[async_trait::async_trait]
impl AlertSink for DiscordWebhook {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        let payload = self.create_alert_embed(alert);
        self.send_webhook(&payload).await
    }
}
