//! External decision service for model-driven play.
//!
//! A service takes the latest capture plus an instruction and returns raw
//! text. [`parse_decision`] turns that text into a [`ModelDecision`] and
//! never falls back to a default action.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions::{Action, ActionTable};

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Decision service timed out after {0:?}")]
    Timeout(Duration),

    #[error("Decision request failed: {0}")]
    Request(String),

    #[error("Decision service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Decision service returned no content")]
    EmptyReply,

    #[error("Invalid decision command template '{0}'")]
    InvalidCommand(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Submit a capture and an instruction; get the model's raw reply.
#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn submit(&self, image: &Path, instruction: &str) -> Result<String, DecisionError>;
}

/// The structured answer a model must give.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ModelDecision {
    /// One of the selection keys listed in the instruction.
    pub action: String,
    /// Short explanation shown next to the capture.
    pub rationale: String,
}

/// Fixed instruction enumerating the legal vocabulary.
pub fn build_instruction(actions: &ActionTable) -> String {
    let vocabulary = actions.vocabulary().join(", ");
    let schema = serde_json::to_string(&schemars::schema_for!(ModelDecision))
        .unwrap_or_else(|_| r#"{"action":"string","rationale":"string"}"#.to_string());
    format!(
        "Look at this DOOM game screenshot and choose the best next move. \
         Legal actions: {vocabulary}. \
         Respond with a single JSON object and nothing else, for example \
         {{\"action\": \"Up\", \"rationale\": \"corridor ahead is clear\"}}. \
         The object must match this JSON schema: {schema}"
    )
}

/// First JSON object embedded in `raw`, ignoring anything around it.
fn first_object(raw: &str) -> Option<serde_json::Value> {
    raw.match_indices('{').find_map(|(start, _)| {
        let mut stream =
            serde_json::Deserializer::from_str(&raw[start..]).into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(value)) if value.is_object() => Some(value),
            _ => None,
        }
    })
}

/// Extract and validate the decision from a model reply.
///
/// The reply may wrap the object in prose or a code fence. The object must
/// carry exactly `action` and `rationale`, and the action must name an entry
/// of `actions`.
pub fn parse_decision(raw: &str, actions: &ActionTable) -> Result<(Action, String), String> {
    let object = first_object(raw).ok_or_else(|| "no JSON object in reply".to_string())?;
    let decision: ModelDecision =
        serde_json::from_value(object).map_err(|e| format!("malformed decision: {e}"))?;
    let action = actions
        .lookup(&decision.action)
        .ok_or_else(|| format!("unknown action '{}'", decision.action))?;
    let rationale = decision.rationale.trim();
    if rationale.is_empty() {
        return Err("empty rationale".to_string());
    }
    Ok((action, rationale.to_string()))
}

/// OpenAI-compatible chat endpoint with image input.
#[derive(Debug, Clone)]
pub struct ChatDecisionService {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatDecisionService {
    /// `base_url` is the API root (e.g. `http://localhost:8317/v1`).
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DecisionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DecisionError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key,
            timeout,
        })
    }
}

#[async_trait]
impl DecisionService for ChatDecisionService {
    async fn submit(&self, image: &Path, instruction: &str) -> Result<String, DecisionError> {
        let bytes = tokio::fs::read(image).await?;
        let data_url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        );
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 300,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": instruction },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DecisionError::Timeout(self.timeout)
            } else {
                DecisionError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DecisionError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| DecisionError::Request(format!("undecodable response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(DecisionError::EmptyReply)
    }
}

/// External CLI, e.g. `claude -p {prompt} {image}`.
///
/// The template is split first and placeholders are substituted per
/// argument, so a prompt with spaces stays one argument.
#[derive(Debug, Clone)]
pub struct CommandDecisionService {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandDecisionService {
    pub fn new(template: &str, timeout: Duration) -> Result<Self, DecisionError> {
        match shlex::split(template) {
            Some(argv) if !argv.is_empty() => Ok(Self { argv, timeout }),
            _ => Err(DecisionError::InvalidCommand(template.to_string())),
        }
    }
}

#[async_trait]
impl DecisionService for CommandDecisionService {
    async fn submit(&self, image: &Path, instruction: &str) -> Result<String, DecisionError> {
        let image = image.to_string_lossy();
        let args: Vec<String> = self
            .argv
            .iter()
            .map(|a| a.replace("{prompt}", instruction).replace("{image}", &image))
            .collect();
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| DecisionError::InvalidCommand(String::new()))?;

        let run = tokio::process::Command::new(program)
            .args(rest)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| DecisionError::Timeout(self.timeout))??;
        if !output.status.success() {
            return Err(DecisionError::Request(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if reply.is_empty() {
            return Err(DecisionError::EmptyReply);
        }
        Ok(reply)
    }
}
