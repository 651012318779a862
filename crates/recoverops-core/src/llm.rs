use anyhow::Result;
use async_trait::async_trait;

/// Result of one model call. Transport failures are reported as
/// `success == false` rather than as errors so callers can fall back.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub success: bool,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Completion {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            text: reason.into(),
            success: false,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        params: CompletionParams,
    ) -> Result<Completion>;
}
