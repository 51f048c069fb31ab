use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::ErrorKind;
use crate::config::ReasonerConfig;
use crate::error::{OrchestratorError, Result};

/// The only shape accepted back from a reasoning backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReasonedCause {
    pub root_cause: String,
    pub confidence: f64,
    pub solution: String,
    pub error_keywords: Vec<String>,
}

impl ReasonedCause {
    pub fn parse(text: &str) -> Result<Self> {
        let cause: ReasonedCause = serde_json::from_str(text.trim())
            .map_err(|e| OrchestratorError::ExternalCall(format!("Reasoner returned malformed output: {}", e)))?;
        if cause.root_cause.trim().is_empty() {
            return Err(OrchestratorError::ExternalCall("Reasoner returned an empty root cause".into()));
        }
        if !(0.0..=1.0).contains(&cause.confidence) {
            return Err(OrchestratorError::ExternalCall(format!(
                "Reasoner confidence {} is outside [0, 1]",
                cause.confidence
            )));
        }
        Ok(cause)
    }
}

#[async_trait]
pub trait ExternalReasoner: Send + Sync {
    async fn reason(&self, prompt: &str) -> Result<ReasonedCause>;
}

/// Prompt with the log excerpt cut to `max_chars`, keeping the newest text.
pub fn build_prompt(agent: &str, kind: ErrorKind, log_text: &str, max_chars: usize) -> String {
    let excerpt: String = {
        let chars: Vec<char> = log_text.chars().collect();
        let start = chars.len().saturating_sub(max_chars);
        chars[start..].iter().collect()
    };
    format!(
        "Analyze this failure and identify the root cause.\n\
         Agent: {agent}\n\
         Classified as: {kind}\n\
         Error log:\n{excerpt}\n\n\
         Reply with only a JSON object with exactly these fields:\n\
         {{\"root_cause\": string (snake_case label), \"confidence\": number between 0 and 1, \
         \"solution\": string (one sentence), \"error_keywords\": [string]}}"
    )
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageOwned,
}

#[derive(Deserialize)]
struct ChatMessageOwned {
    content: Option<String>,
}

/// OpenAI-compatible chat completions backend.
pub struct HttpReasoner {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl HttpReasoner {
    pub fn from_config(config: &ReasonerConfig) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.clone() else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OrchestratorError::ExternalCall(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Some(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }))
    }
}

#[async_trait]
impl ExternalReasoner for HttpReasoner {
    async fn reason(&self, prompt: &str) -> Result<ReasonedCause> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You are a site reliability engineer performing root cause analysis. Answer in JSON.",
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            response_format: ResponseFormat { kind: "json_object" },
            max_tokens: 500,
            temperature: 0.0,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::ExternalCall(format!(
                "Reasoner returned {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OrchestratorError::ExternalCall("Reasoner returned no choices".into()))?;

        debug!("Reasoner replied with {} bytes", content.len());
        ReasonedCause::parse(&content)
    }
}
