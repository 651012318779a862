#[cfg(test)]
mod api_tests;
mod logging;
mod routes;
mod webhooks;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use recoverops_core::{config::Config, db::Db, notify::SlackNotifier, pipeline::Registry};
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::logging::BroadcastLayer;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Arc<Db>,
    pub registry: Arc<Registry>,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<Mutex<VecDeque<String>>>,
}

// ── Router ────────────────────────────────────────────────────────────────

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Webhooks
        .route("/webhooks/github", post(webhooks::github))
        .route("/webhooks/gitlab", post(webhooks::gitlab))
        .route("/webhooks/jenkins", post(webhooks::jenkins))
        .route("/webhooks/generic", post(webhooks::generic))
        .route("/webhooks/health", get(webhooks::health))
        // Incidents
        .route("/api/incidents", get(routes::list_incidents))
        .route("/api/incidents/stats/summary", get(routes::stats_summary))
        .route("/api/incidents/trends/daily", get(routes::daily_trends))
        .route(
            "/api/incidents/:id",
            get(routes::get_incident).put(routes::update_incident),
        )
        .route("/api/incidents/:id/remediations", get(routes::list_remediations))
        .route("/api/incidents/:id/remediate", post(routes::remediate))
        .route("/api/incidents/:id/rollback", post(routes::rollback))
        // Operator controls
        .route(
            "/api/emergency-stop",
            post(routes::emergency_stop).delete(routes::clear_emergency_stop),
        )
        .route("/api/status", get(routes::get_status))
        .route("/api/health", get(routes::health))
        // Settings
        .route(
            "/api/settings",
            get(routes::get_settings).put(routes::put_settings),
        )
        // SSE logs
        .route("/api/logs", get(routes::sse_logs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _log_rx) = broadcast::channel::<String>(256);
    let log_ring = Arc::new(Mutex::new(VecDeque::new()));

    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recoverops=info,tower_http=debug".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let mut db = Db::open(&config.db_path())?;
    db.migrate()?;
    config.seed_db(&db)?;
    let config = config.load_from_db(&db);
    for w in config.warnings() {
        warn!("{w}");
    }
    let db = Arc::new(db);

    let reasoner = recoverops_agent::reasoner_from_config(&config);
    info!(reasoner = reasoner.name(), "reasoner selected");

    let (registry, pipeline_rx) = Registry::new(&config, Arc::clone(&db), reasoner)?;
    let registry = Arc::new(registry);
    registry.spawn_stages();

    if !config.slack_webhook_url.is_empty() {
        let notifier = SlackNotifier::new(&config.slack_webhook_url)?;
        tokio::spawn(notifier.run(registry.event_tx.subscribe()));
    }

    // Forward pipeline events to the SSE log stream
    {
        let log_tx_fwd = log_tx.clone();
        tokio::spawn(async move {
            let mut rx = pipeline_rx;
            loop {
                match rx.recv().await {
                    Ok(evt) => {
                        let data = serde_json::json!({
                            "type": evt.kind(),
                            "incident_id": evt.incident_id(),
                            "message": evt.message(),
                            "category": "pipeline",
                        })
                        .to_string();
                        let _ = log_tx_fwd.send(data);
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        });
    }

    let state = Arc::new(AppState {
        db,
        registry,
        start_time: Instant::now(),
        log_tx,
        log_ring,
    });

    let app = router(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);

    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
