use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recoverops_core::{
    llm::{CompletionParams, LlmBackend},
    reasoner::{AnalysisContext, HeuristicReasoner, Reasoner},
    types::{FixRequest, GeneratedFix, Incident, RootCauseAnalysis},
};
use tracing::{debug, info, warn};

use crate::prompt::{
    build_analysis_prompt, build_fix_prompt, parse_analysis, parse_fixes, ANALYSIS_PARAMS,
    ANALYSIS_SYSTEM, FIX_PARAMS, FIX_SYSTEM,
};

/// Model-backed reasoning. Every failure path (transport error, timeout,
/// unusable reply) lands on the heuristic answer.
pub struct LlmReasoner {
    backend: Arc<dyn LlmBackend>,
    fallback: HeuristicReasoner,
    confidence_threshold: f64,
    timeout: Duration,
    name: String,
}

impl LlmReasoner {
    pub fn new(backend: Arc<dyn LlmBackend>, confidence_threshold: f64) -> Self {
        let name = format!("{}:{}", backend.name(), backend.model());
        Self {
            backend,
            fallback: HeuristicReasoner,
            confidence_threshold,
            timeout: Duration::from_secs(60),
            name,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call(
        &self,
        incident_id: i64,
        system: &str,
        prompt: &str,
        params: CompletionParams,
    ) -> Option<String> {
        let res =
            tokio::time::timeout(self.timeout, self.backend.complete(system, prompt, params)).await;
        match res {
            Ok(Ok(c)) if c.success => {
                debug!(
                    incident_id,
                    prompt_tokens = c.prompt_tokens,
                    completion_tokens = c.completion_tokens,
                    "model call succeeded"
                );
                Some(c.text)
            },
            Ok(Ok(c)) => {
                warn!(incident_id, "model call unsuccessful: {}", c.text);
                None
            },
            Ok(Err(e)) => {
                warn!(incident_id, "model call failed: {e:#}");
                None
            },
            Err(_) => {
                warn!(
                    incident_id,
                    timeout_secs = self.timeout.as_secs(),
                    "model call timed out"
                );
                None
            },
        }
    }
}

#[async_trait]
impl Reasoner for LlmReasoner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn explain(&self, incident: &Incident, ctx: &AnalysisContext) -> RootCauseAnalysis {
        let prompt = build_analysis_prompt(incident, ctx);
        match self
            .call(incident.id, ANALYSIS_SYSTEM, &prompt, ANALYSIS_PARAMS)
            .await
        {
            Some(text) => parse_analysis(&text),
            None => {
                info!(incident_id = incident.id, "falling back to pattern analysis");
                self.fallback.explain(incident, ctx).await
            },
        }
    }

    async fn propose_fixes(&self, incident: &Incident, request: &FixRequest) -> Vec<GeneratedFix> {
        if incident.confidence_score <= self.confidence_threshold {
            debug!(
                incident_id = incident.id,
                confidence = incident.confidence_score,
                threshold = self.confidence_threshold,
                "confidence below model threshold, using templates"
            );
            return self.fallback.propose_fixes(incident, request).await;
        }
        let prompt = build_fix_prompt(incident, request);
        let fixes = self
            .call(incident.id, FIX_SYSTEM, &prompt, FIX_PARAMS)
            .await
            .and_then(|text| parse_fixes(&text));
        match fixes {
            Some(fixes) => fixes,
            None => {
                info!(incident_id = incident.id, "no usable model fixes, using templates");
                self.fallback.propose_fixes(incident, request).await
            },
        }
    }
}
