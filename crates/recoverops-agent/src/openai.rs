use anyhow::Result;
use async_trait::async_trait;
use recoverops_core::llm::{Completion, CompletionParams, LlmBackend};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// OpenAI-compatible chat completions endpoint (`{base_url}/chat/completions`).
pub struct OpenAiBackend {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl OpenAiBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout_secs: 60,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        params: CompletionParams,
    ) -> Result<Completion> {
        let request_body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        info!(model = %self.model, "calling chat completions API");

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()?;

        let response = match client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(timeout_secs = self.timeout_secs, "chat completions request timed out");
                return Ok(Completion::failed(format!(
                    "OpenAI request timed out after {}s",
                    self.timeout_secs
                )));
            },
            Err(e) => {
                warn!("chat completions request failed: {}", e);
                return Ok(Completion::failed(format!("OpenAI request failed: {}", e)));
            },
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "chat completions returned non-200: {}", body);
            return Ok(Completion::failed(format!("OpenAI error {}: {}", status, body)));
        }

        let parsed: ChatResponse = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to parse chat completions response: {}", e);
                return Ok(Completion::failed(format!(
                    "Failed to parse OpenAI response: {}",
                    e
                )));
            },
        };

        let Some(text) = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
        else {
            warn!("chat completions response had no content");
            return Ok(Completion::failed("OpenAI response had no choices"));
        };

        info!(
            output_len = text.len(),
            prompt_tokens = parsed.usage.prompt_tokens,
            completion_tokens = parsed.usage.completion_tokens,
            "chat completions response received"
        );

        Ok(Completion {
            text,
            success: true,
            prompt_tokens: parsed.usage.prompt_tokens,
            completion_tokens: parsed.usage.completion_tokens,
        })
    }
}
