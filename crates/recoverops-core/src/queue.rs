use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Notify;
use tracing::warn;

use crate::db::Db;

/// The stage-to-stage queues. Each has exactly one logical consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueName {
    RawSignal,
    Incident,
    Fix,
    Remediation,
    Validation,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        Self::RawSignal,
        Self::Incident,
        Self::Fix,
        Self::Remediation,
        Self::Validation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawSignal => "raw_signal",
            Self::Incident => "incident",
            Self::Fix => "fix",
            Self::Remediation => "remediation",
            Self::Validation => "validation",
        }
    }
}

/// Durable FIFO queues backed by the `queue_messages` table.
///
/// Producers wake the consumer through a per-queue `Notify`; consumers also
/// re-check the table after an idle interval so rows written by another
/// process are picked up.
pub struct Queues {
    db: Arc<Db>,
    notify: HashMap<QueueName, Arc<Notify>>,
    idle_recheck: Duration,
}

impl Queues {
    pub fn new(db: Arc<Db>) -> Self {
        let notify = QueueName::ALL
            .iter()
            .map(|q| (*q, Arc::new(Notify::new())))
            .collect();
        Self {
            db,
            notify,
            idle_recheck: Duration::from_secs(5),
        }
    }

    pub fn with_idle_recheck(mut self, interval: Duration) -> Self {
        self.idle_recheck = interval;
        self
    }

    fn waker(&self, queue: QueueName) -> Arc<Notify> {
        self.notify
            .get(&queue)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    pub fn push<T: Serialize>(&self, queue: QueueName, msg: &T) -> Result<i64> {
        let payload = serde_json::to_string(msg)
            .with_context(|| format!("serialize {} message", queue.as_str()))?;
        let id = self.db.queue_push(queue.as_str(), &payload)?;
        self.waker(queue).notify_one();
        Ok(id)
    }

    /// Removes and decodes the oldest message. Undecodable messages are logged and dropped.
    pub fn try_pop<T: DeserializeOwned>(&self, queue: QueueName) -> Result<Option<T>> {
        while let Some(payload) = self.db.queue_pop(queue.as_str())? {
            match serde_json::from_str(&payload) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => {
                    warn!(queue = queue.as_str(), "dropping malformed message: {e}");
                }
            }
        }
        Ok(None)
    }

    /// Blocks until a message is available.
    pub async fn recv<T: DeserializeOwned>(&self, queue: QueueName) -> Result<T> {
        let waker = self.waker(queue);
        loop {
            if let Some(msg) = self.try_pop(queue)? {
                return Ok(msg);
            }
            let _ = tokio::time::timeout(self.idle_recheck, waker.notified()).await;
        }
    }

    /// Like `recv`, but gives up after `wait` with `None`.
    pub async fn recv_timeout<T: DeserializeOwned>(
        &self,
        queue: QueueName,
        wait: Duration,
    ) -> Result<Option<T>> {
        match tokio::time::timeout(wait, self.recv(queue)).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn depth(&self, queue: QueueName) -> Result<i64> {
        self.db.queue_depth(queue.as_str())
    }

    pub fn depths(&self) -> Result<BTreeMap<&'static str, i64>> {
        QueueName::ALL
            .iter()
            .map(|q| Ok((q.as_str(), self.depth(*q)?)))
            .collect()
    }
}
