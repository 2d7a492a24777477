//! Worker status snapshot and the background heartbeat reporter.
//!
//! The poller and a running task module write the snapshot; the reporter
//! task only ever reads it and POSTs it to the control plane on its own
//! schedule. Delivery is best-effort: a failed POST is logged once per
//! failure streak, swallowed, and retried unconditionally on the next tick.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::api::ApiClient;
use crate::error::NetworkError;

/// Reported worker activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Startup,
    Idle,
    InProgress,
}

/// The record POSTed to the control plane on every heartbeat tick.
///
/// `job_id`/`job_title` are set exactly while `status` is `InProgress`;
/// every transition to `Idle` or `Startup` clears them along with any
/// progress fields a module pushed.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    pub hostname: String,
    pub version: String,
    pub online_since: DateTime<Utc>,
    /// Module-reported progress (current_frame, percent, ...), flattened
    /// into the message body.
    #[serde(flatten)]
    pub progress: serde_json::Map<String, serde_json::Value>,
}

/// Shared status reporter, handed to the poller and to every task module.
///
/// All setters replace the snapshot under one lock and return immediately;
/// the main loop never waits on the network for a status change.
pub struct Heartbeat {
    snapshot: Mutex<StatusSnapshot>,
    api: ApiClient,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(api: ApiClient, hostname: String, version: &str, interval: Duration) -> Self {
        let snapshot = StatusSnapshot {
            status: WorkerStatus::Startup,
            job_id: None,
            job_title: None,
            hostname,
            version: version.to_string(),
            online_since: Utc::now(),
            progress: serde_json::Map::new(),
        };
        Self {
            snapshot: Mutex::new(snapshot),
            api,
            interval,
        }
    }

    /// Spawn the background reporter. Call exactly once, at startup.
    ///
    /// The task runs for the rest of the process lifetime and never blocks
    /// shutdown; process exit simply drops it.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let heartbeat = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(heartbeat.interval);
            let mut failing = false;
            loop {
                tick.tick().await;
                match heartbeat.beat_once().await {
                    Ok(()) => failing = false,
                    Err(e) => {
                        if !failing {
                            tracing::warn!(error = %e, "Heartbeat delivery failing");
                            failing = true;
                        }
                    }
                }
            }
        })
    }

    /// Serialize the current snapshot and POST it: one reporter tick.
    pub async fn beat_once(&self) -> Result<(), NetworkError> {
        let message = self.snapshot();
        tracing::debug!(status = ?message.status, "Sending status message");
        self.api.post_status(&message).await
    }

    pub fn set_idle(&self) {
        let mut snapshot = self.lock();
        snapshot.status = WorkerStatus::Idle;
        snapshot.job_id = None;
        snapshot.job_title = None;
        snapshot.progress.clear();
    }

    pub fn set_startup(&self) {
        let mut snapshot = self.lock();
        snapshot.status = WorkerStatus::Startup;
        snapshot.job_id = None;
        snapshot.job_title = None;
        snapshot.progress.clear();
    }

    pub fn set_in_progress(&self, job_id: &str, job_title: &str) {
        let mut snapshot = self.lock();
        snapshot.status = WorkerStatus::InProgress;
        snapshot.job_id = Some(job_id.to_string());
        snapshot.job_title = Some(job_title.to_string());
        snapshot.progress.clear();
    }

    /// Merge module progress fields into the snapshot.
    ///
    /// Dropped unless a job is in progress, so stale module updates can
    /// never re-attach job data to an idle snapshot.
    pub fn update_progress(&self, fields: serde_json::Map<String, serde_json::Value>) {
        let mut snapshot = self.lock();
        if snapshot.status != WorkerStatus::InProgress {
            return;
        }
        for (key, value) in fields {
            snapshot.progress.insert(key, value);
        }
    }

    /// Current snapshot, cloned under the lock.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, StatusSnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
