pub mod discord;
pub mod json;

pub use discord::DiscordWebhook;
pub use json::JsonWebhook;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AlertConfig;
use crate::error::Result;

const SEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Info => f.write_str("info"),
            AlertLevel::Warning => f.write_str("warning"),
            AlertLevel::Critical => f.write_str("critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub agent: Option<String>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
            agent: None,
            raised_at: Utc::now(),
        }
    }

    pub fn for_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send_alert(&self, alert: &Alert) -> Result<()>;
}

/// Fans alerts out to every sink without waiting for delivery.
#[derive(Clone, Default)]
pub struct AlertManager {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn from_config(config: &AlertConfig) -> Result<Self> {
        let mut manager = Self::new();
        if let Some(ref url) = config.discord_webhook_url {
            manager.add_sink(Arc::new(DiscordWebhook::new(url.clone())?));
        }
        if let Some(ref url) = config.webhook_url {
            manager.add_sink(Arc::new(JsonWebhook::new(url.clone())?));
        }
        Ok(manager)
    }

    pub fn add_sink(&mut self, sink: Arc<dyn AlertSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Delivery failures are logged and never reach the caller.
    pub fn notify(&self, alert: Alert) {
        if self.sinks.is_empty() {
            tracing::debug!("No alert sinks configured, dropping alert: {}", alert.title);
            return;
        }

        let alert = Arc::new(alert);
        for sink in &self.sinks {
            let sink = sink.clone();
            let alert = alert.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(SEND_TIMEOUT, sink.send_alert(&alert)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("Alert sink {} failed to send '{}': {}", sink.name(), alert.title, e),
                    Err(_) => tracing::warn!("Alert sink {} timed out sending '{}'", sink.name(), alert.title),
                }
            });
        }
    }
}
