use async_trait::async_trait;
use serde::Serialize;

use crate::{
    analyzer::heuristic_analysis,
    fixer::template_fixes,
    types::{Commit, FixRequest, GeneratedFix, Incident, LogEntry, RootCauseAnalysis},
};

/// Evidence gathered around an incident before analysis.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisContext {
    pub logs: Vec<LogEntry>,
    pub recent_changes: Vec<Commit>,
    pub similar_incidents: Vec<Incident>,
}

/// Root-cause reasoning and fix proposal. Implementations never fail outright:
/// anything that goes wrong degrades to a deterministic answer.
#[async_trait]
pub trait Reasoner: Send + Sync {
    fn name(&self) -> &str;

    async fn explain(&self, incident: &Incident, ctx: &AnalysisContext) -> RootCauseAnalysis;

    async fn propose_fixes(&self, incident: &Incident, request: &FixRequest) -> Vec<GeneratedFix>;
}

/// Pattern analysis and fix templates; no external calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicReasoner;

#[async_trait]
impl Reasoner for HeuristicReasoner {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn explain(&self, incident: &Incident, _ctx: &AnalysisContext) -> RootCauseAnalysis {
        heuristic_analysis(incident)
    }

    async fn propose_fixes(&self, incident: &Incident, _request: &FixRequest) -> Vec<GeneratedFix> {
        template_fixes(incident)
    }
}
