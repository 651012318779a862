use recoverops_agent::{prompt::ANALYSIS_PARAMS, OllamaBackend, OpenAiBackend};
use recoverops_core::llm::LlmBackend;

// Nothing listens on port 1; the connection is refused immediately.
const DEAD_URL: &str = "http://127.0.0.1:1";

#[tokio::test]
async fn ollama_unreachable_is_an_unsuccessful_completion() {
    let backend = OllamaBackend::new(DEAD_URL, "llama3").with_timeout(5);
    let c = backend
        .complete("system", "prompt", ANALYSIS_PARAMS)
        .await
        .unwrap();
    assert!(!c.success);
    assert!(c.text.starts_with("Ollama request"));
}

#[tokio::test]
async fn openai_unreachable_is_an_unsuccessful_completion() {
    let backend = OpenAiBackend::new(format!("{DEAD_URL}/v1/"), "sk-test", "gpt-4").with_timeout(5);
    assert_eq!(backend.name(), "openai");
    assert_eq!(backend.model(), "gpt-4");
    let c = backend
        .complete("system", "prompt", ANALYSIS_PARAMS)
        .await
        .unwrap();
    assert!(!c.success);
    assert!(c.text.starts_with("OpenAI request"));
}
