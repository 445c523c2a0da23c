use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::http_client::build_http_client;

/// The generation vendor, inferred from the model identifier: OpenRouter
/// model ids are namespaced ("vendor/model"), plain OpenAI ids are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenRouter,
    OpenAi,
}

impl Provider {
    pub fn infer(model: &str) -> Self {
        if model.contains('/') {
            Provider::OpenRouter
        } else {
            Provider::OpenAi
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenParams {
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// One dialogue entry in a generated turn. The model may address a speaker
/// by story-character id or by display name; unresolved names are kept as
/// raw `speaker` text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DialogueLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_story_character_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub text: String,
}

/// One character-state mutation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDelta {
    #[serde(default)]
    pub story_character_id: Option<String>,
    #[serde(default)]
    pub character: Option<String>,
    pub schema_key: String,
    pub value: serde_json::Value,
}

/// Structured output contract for one generated turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutput {
    pub narrative_text: String,
    #[serde(default)]
    pub dialogue: Vec<DialogueLine>,
    #[serde(default)]
    pub state_deltas: Vec<StateDelta>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Marker error for model output that could not be parsed into the turn
/// contract. Recoverable: the caller surfaces the raw text and nothing is
/// persisted.
#[derive(Debug)]
pub struct MalformedOutput {
    pub raw: String,
}

impl fmt::Display for MalformedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model returned output that does not match the turn contract: {}",
            self.raw.chars().take(300).collect::<String>()
        )
    }
}

impl std::error::Error for MalformedOutput {}

/// What the engine hands to a generator for a single turn.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub api_key: String,
    pub model: String,
    pub params: GenParams,
    pub messages: Vec<Message>,
}

/// Seam between the engine and the generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate_turn(&self, request: &GenerationRequest) -> Result<TurnOutput>;
}

#[derive(Clone)]
pub struct LlmClient {
    openai_api_url: String,
    openrouter_api_url: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            openai_api_url: config.openai_api_url.clone(),
            openrouter_api_url: config.openrouter_api_url.clone(),
            client: build_http_client(Some(Duration::from_secs(config.request_timeout_secs))),
        }
    }

    fn base_url(&self, provider: Provider) -> &str {
        match provider {
            Provider::OpenRouter => &self.openrouter_api_url,
            Provider::OpenAi => &self.openai_api_url,
        }
    }

    /// Generate a completion using the OpenAI API format. Exactly one request.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let provider = Provider::infer(&request.model);
        let url = format!("{}/chat/completions", self.base_url(provider));

        let body = ChatCompletionRequest {
            model: request.model.clone(),
            messages: request.messages.clone(),
            temperature: request.params.temperature,
            max_tokens: request.params.max_tokens,
            top_p: request.params.top_p,
        };

        let mut req = self.client.post(&url).json(&body);

        // Not needed for local OpenAI-compatible servers
        if !request.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", request.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        // Include the response body for debugging bad keys / quota errors
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(content)
    }
}

#[async_trait]
impl Generator for LlmClient {
    async fn generate_turn(&self, request: &GenerationRequest) -> Result<TurnOutput> {
        let raw = self.generate(request).await?;
        extract_json::<TurnOutput>(&raw)
    }
}

/// Parse a structured response, tolerating reasoning preambles, markdown
/// fences, and surrounding prose before failing with the raw text attached.
pub fn extract_json<T>(response: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response) {
        return Ok(parsed);
    }

    let cleaned = if let Some(think_end) = response.rfind("</think>") {
        &response[think_end + 8..]
    } else {
        response
    };

    if let Ok(parsed) = serde_json::from_str::<T>(cleaned.trim()) {
        return Ok(parsed);
    }

    let json_content = if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + 7..];
        if let Some(end) = after_start.find("```") {
            after_start[..end].trim()
        } else {
            cleaned
        }
    } else if let Some(start) = cleaned.find('{') {
        if let Some(end) = cleaned.rfind('}') {
            &cleaned[start..=end]
        } else {
            cleaned
        }
    } else {
        cleaned
    };

    serde_json::from_str::<T>(json_content.trim()).map_err(|_| {
        anyhow::Error::new(MalformedOutput {
            raw: response.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_inferred_from_model_namespace() {
        assert_eq!(
            Provider::infer("anthropic/claude-3.5-sonnet"),
            Provider::OpenRouter
        );
        assert_eq!(Provider::infer("gpt-4o-mini"), Provider::OpenAi);
    }

    #[test]
    fn extract_json_parses_direct_object() {
        let output: TurnOutput =
            extract_json(r#"{"narrative_text":"The door creaks open."}"#).expect("direct parse");
        assert_eq!(output.narrative_text, "The door creaks open.");
        assert!(output.dialogue.is_empty());
        assert!(output.state_deltas.is_empty());
        assert!(output.summary.is_none());
    }

    #[test]
    fn extract_json_handles_markdown_fence() {
        let raw = "Here is the turn:\n```json\n{\"narrative_text\":\"Rain falls.\",\"dialogue\":[{\"speaker\":\"Mira\",\"text\":\"We should hurry.\"}]}\n```";
        let output: TurnOutput = extract_json(raw).expect("fenced parse");
        assert_eq!(output.narrative_text, "Rain falls.");
        assert_eq!(output.dialogue.len(), 1);
        assert_eq!(output.dialogue[0].speaker.as_deref(), Some("Mira"));
    }

    #[test]
    fn extract_json_handles_surrounding_prose_and_think_block() {
        let raw = "<think>planning the scene</think>Sure! {\"narrative_text\":\"Dawn breaks.\",\"state_deltas\":[{\"character\":\"Mira\",\"schema_key\":\"hp\",\"value\":12}]} hope that works";
        let output: TurnOutput = extract_json(raw).expect("embedded parse");
        assert_eq!(output.narrative_text, "Dawn breaks.");
        assert_eq!(output.state_deltas.len(), 1);
        assert_eq!(output.state_deltas[0].schema_key, "hp");
    }

    #[test]
    fn extract_json_failure_is_malformed_output() {
        let err = extract_json::<TurnOutput>("no json here at all").unwrap_err();
        let malformed = err
            .downcast_ref::<MalformedOutput>()
            .expect("malformed marker");
        assert_eq!(malformed.raw, "no json here at all");
    }
}
