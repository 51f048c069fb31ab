use crate::error::{OrchestratorError, Result};
use crate::webhooks::{Alert, AlertSink};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Posts the alert itself as the JSON body.
pub struct JsonWebhook {
    client: Client,
    url: String,
}

impl JsonWebhook {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OrchestratorError::ExternalCall(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait::async_trait]
impl AlertSink for JsonWebhook {
    fn name(&self) -> &str {
        "json"
    }

    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(OrchestratorError::ExternalCall(format!(
                "Webhook {} returned {}",
                self.url,
                response.status()
            )));
        }
        debug!("Alert '{}' delivered to {}", alert.title, self.url);
        Ok(())
    }
}
