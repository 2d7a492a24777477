//! Wire models for jobs claimed from the queue and results reported back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of work claimed from the queue.
///
/// Lives exactly from a successful poll until its result is reported; it is
/// never carried across polling iterations.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    pub job_title: String,
    /// Ordered pipeline; tasks execute strictly in sequence.
    #[serde(default)]
    pub tasks: Vec<TaskDescriptor>,
}

/// One step of a job: a registry module name plus its opaque payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDescriptor {
    pub module: String,
    /// Module-specific data; the agent never interprets it.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Completion report for a finished job, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Whole-job wall clock, in seconds.
    pub runtime_secs: f64,
    pub completed: bool,
    /// Module of the task that aborted the job, absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub worker_id: Uuid,
    pub worker_hostname: String,
    pub agent_version: String,
}

/// Envelope for the completion PATCH body.
#[derive(Debug, Serialize)]
pub struct CompletionReport<'a> {
    pub failed: bool,
    pub info: &'a JobResult,
}
