pub mod ollama;
pub mod openai;
pub mod prompt;
pub mod reasoner;

use std::sync::Arc;
use std::time::Duration;

use recoverops_core::{
    config::Config,
    llm::LlmBackend,
    reasoner::{HeuristicReasoner, Reasoner},
};
use tracing::warn;

pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
pub use reasoner::LlmReasoner;

/// The model backend named by `LLM_BACKEND`, if it is usable.
pub fn backend_from_config(config: &Config) -> Option<Arc<dyn LlmBackend>> {
    match config.llm_backend.as_str() {
        "" => None,
        "openai" if config.openai_api_key.is_empty() => {
            warn!("LLM_BACKEND=openai but OPENAI_API_KEY is empty, using heuristics");
            None
        },
        "openai" => Some(Arc::new(
            OpenAiBackend::new(
                &config.openai_base_url,
                &config.openai_api_key,
                &config.openai_model,
            )
            .with_timeout(config.llm_timeout_s),
        )),
        "ollama" => Some(Arc::new(
            OllamaBackend::new(&config.ollama_url, &config.ollama_model)
                .with_timeout(config.llm_timeout_s),
        )),
        other => {
            warn!(backend = other, "unknown LLM_BACKEND, using heuristics");
            None
        },
    }
}

pub fn reasoner_from_config(config: &Config) -> Arc<dyn Reasoner> {
    match backend_from_config(config) {
        Some(backend) => Arc::new(
            LlmReasoner::new(backend, config.ai_confidence_threshold)
                .with_timeout(Duration::from_secs(config.llm_timeout_s)),
        ),
        None => Arc::new(HeuristicReasoner),
    }
}
