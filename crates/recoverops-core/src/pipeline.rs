use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    analyzer::Analyzer,
    channel::Channels,
    classifier::Classifier,
    config::Config,
    db::Db,
    executor::{Executor, ExecutorSettings},
    fixer::FixGenerator,
    gateway::Gateway,
    infra::InfraChannel,
    queue::Queues,
    reasoner::Reasoner,
    types::PipelineEvent,
    validator::Validator,
    vcs::GitHubChannel,
};

pub const CLASSIFIER_BACKOFF: Duration = Duration::from_secs(5);
pub const ANALYZER_BACKOFF: Duration = Duration::from_secs(10);
pub const FIXER_BACKOFF: Duration = Duration::from_secs(15);
pub const VALIDATOR_BACKOFF: Duration = Duration::from_secs(20);

/// One consumer stage. `step` blocks until a unit of work is available and
/// processes it to completion.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn step(&self) -> Result<()>;
}

/// Drives a stage forever. Errors are logged and followed by a fixed sleep;
/// they never end the loop.
pub fn spawn_stage<S: Stage + 'static>(stage: Arc<S>, backoff: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(stage = stage.name(), "stage started");
        loop {
            if let Err(e) = stage.step().await {
                error!(stage = stage.name(), "stage step failed: {e:#}");
                tokio::time::sleep(backoff).await;
            }
        }
    })
}

/// Every pipeline component, built once at startup and shared by reference.
pub struct Registry {
    pub db: Arc<Db>,
    pub queues: Arc<Queues>,
    pub gateway: Arc<Gateway>,
    pub classifier: Arc<Classifier>,
    pub analyzer: Arc<Analyzer>,
    pub fixer: Arc<FixGenerator>,
    pub executor: Arc<Executor>,
    pub validator: Arc<Validator>,
    pub reasoner: Arc<dyn Reasoner>,
    pub event_tx: broadcast::Sender<PipelineEvent>,
}

impl Registry {
    /// Wires the GitHub and infra channels from config.
    pub fn new(
        config: &Config,
        db: Arc<Db>,
        reasoner: Arc<dyn Reasoner>,
    ) -> Result<(Self, broadcast::Receiver<PipelineEvent>)> {
        let auto_enabled = Arc::new(AtomicBool::new(config.auto_remediation_enabled));
        let vcs = GitHubChannel::new(
            config.github_api_url.clone(),
            config.github_token.clone(),
            config.fix_branch_prefix.clone(),
            config.auto_merge_confidence,
            Arc::clone(&auto_enabled),
        )?;
        let infra = InfraChannel::new(config.infra_api_url.clone(), config.infra_api_token.clone())?;
        let channels = Channels::new(Arc::new(vcs), Arc::new(infra));
        Self::with_channels(config, db, reasoner, channels, auto_enabled)
    }

    pub fn with_channels(
        config: &Config,
        db: Arc<Db>,
        reasoner: Arc<dyn Reasoner>,
        channels: Channels,
        auto_enabled: Arc<AtomicBool>,
    ) -> Result<(Self, broadcast::Receiver<PipelineEvent>)> {
        let (event_tx, event_rx) = broadcast::channel(256);
        let queues = Arc::new(Queues::new(Arc::clone(&db)));

        let gateway = Gateway::new(
            Arc::clone(&db),
            Arc::clone(&queues),
            config.github_webhook_secret.clone(),
            config.gitlab_webhook_secret.clone(),
        );
        let classifier = Classifier::new(
            Arc::clone(&db),
            Arc::clone(&queues),
            event_tx.clone(),
            config.dedup_window_s,
        )?;
        let analyzer = Analyzer::new(
            Arc::clone(&db),
            Arc::clone(&queues),
            Arc::clone(&reasoner),
            event_tx.clone(),
        );
        let fixer = FixGenerator::new(
            Arc::clone(&db),
            Arc::clone(&queues),
            Arc::clone(&reasoner),
            event_tx.clone(),
        );
        let executor = Executor::new(
            Arc::clone(&db),
            Arc::clone(&queues),
            channels.clone(),
            event_tx.clone(),
            ExecutorSettings::from_config(config),
            auto_enabled,
        );
        let validator = Validator::new(Arc::clone(&db), Arc::clone(&queues), channels);

        let registry = Self {
            db,
            queues,
            gateway: Arc::new(gateway),
            classifier: Arc::new(classifier),
            analyzer: Arc::new(analyzer),
            fixer: Arc::new(fixer),
            executor: Arc::new(executor),
            validator: Arc::new(validator),
            reasoner,
            event_tx,
        };
        Ok((registry, event_rx))
    }

    /// Starts every consumer loop, cadence increasing downstream.
    pub fn spawn_stages(&self) -> Vec<JoinHandle<()>> {
        vec![
            spawn_stage(Arc::clone(&self.classifier), CLASSIFIER_BACKOFF),
            spawn_stage(Arc::clone(&self.analyzer), ANALYZER_BACKOFF),
            spawn_stage(Arc::clone(&self.fixer), FIXER_BACKOFF),
            spawn_stage(Arc::clone(&self.validator), VALIDATOR_BACKOFF),
            tokio::spawn(Arc::clone(&self.executor).run()),
        ]
    }
}
