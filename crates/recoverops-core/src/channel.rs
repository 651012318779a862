use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::types::{ChannelKind, FixSpec, FixType, Incident, RollbackData};

/// What a channel reports after applying one fix.
#[derive(Debug, Clone)]
pub struct ChannelOutcome {
    pub message: String,
    pub details: Value,
    pub rollback: RollbackData,
}

/// An external system that can apply, undo and re-check a remediation.
#[async_trait]
pub trait RemediationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, incident: &Incident, fix: &FixSpec) -> Result<ChannelOutcome>;

    async fn rollback(&self, data: &RollbackData) -> Result<()>;

    /// Whether the applied change is still in place.
    async fn verify(&self, data: &RollbackData) -> Result<bool>;
}

/// One adapter per `ChannelKind`, fixed at startup.
#[derive(Clone)]
pub struct Channels {
    pub vcs: Arc<dyn RemediationChannel>,
    pub infra: Arc<dyn RemediationChannel>,
}

impl Channels {
    pub fn new(vcs: Arc<dyn RemediationChannel>, infra: Arc<dyn RemediationChannel>) -> Self {
        Self { vcs, infra }
    }

    pub fn for_kind(&self, kind: ChannelKind) -> &Arc<dyn RemediationChannel> {
        match kind {
            ChannelKind::VersionControl => &self.vcs,
            ChannelKind::Infrastructure => &self.infra,
        }
    }

    pub fn for_fix(&self, fix_type: FixType) -> &Arc<dyn RemediationChannel> {
        self.for_kind(fix_type.channel())
    }

    /// `None` when there is nothing to undo.
    pub fn for_rollback(&self, data: &RollbackData) -> Option<&Arc<dyn RemediationChannel>> {
        match data {
            RollbackData::GitPr { .. } => Some(&self.vcs),
            RollbackData::Infra { .. } => Some(&self.infra),
            RollbackData::None => None,
        }
    }
}
