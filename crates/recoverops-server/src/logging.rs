use std::{collections::VecDeque, sync::Arc};

use tokio::sync::broadcast;

pub(crate) const RING_CAPACITY: usize = 500;

/// Fans every log event out to the `/api/logs` stream and keeps the most
/// recent ones for clients that connect late.
pub(crate) struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    incident_id: Option<i64>,
}

impl tracing::field::Visit for EventVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        if field.name() == "incident_id" {
            self.incident_id = Some(value);
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.clear();
            use std::fmt::Write;
            let _ = write!(self.message, "{value:?}");
            // Strip surrounding quotes added by Debug on &str
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }
}

/// Pipeline stage a log line belongs to, from the emitting module path.
pub(crate) fn category(target: &str) -> &'static str {
    if target.contains("gateway") || target.contains("webhooks") {
        "gateway"
    } else if target.contains("classifier") {
        "classifier"
    } else if target.contains("analyzer") || target.contains("reasoner") || target.contains("agent") {
        "analyzer"
    } else if target.contains("fixer") {
        "fixer"
    } else if target.contains("executor")
        || target.contains("vcs")
        || target.contains("infra")
        || target.contains("validator")
    {
        "executor"
    } else {
        "system"
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let json = serde_json::json!({
            "ts": chrono::Utc::now().timestamp(),
            "level": level,
            "message": visitor.message,
            "category": category(event.metadata().target()),
            "incident_id": visitor.incident_id,
        })
        .to_string();

        let _ = self.tx.send(json.clone());
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(json);
            if ring.len() > RING_CAPACITY {
                ring.pop_front();
            }
        }
    }
}
