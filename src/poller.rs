//! Top-level queue polling state machine.
//!
//! One pass checks the queue and worker enablement flags, claims a job if
//! one is waiting, runs it through the executor, and reports the result.
//! Identical consecutive blocking conditions (disabled flags, empty queue,
//! the same class of network failure) log exactly once until the condition
//! changes, so a multi-hour empty queue does not flood the log.

use std::sync::Arc;

use chrono::Utc;

use crate::api::ApiClient;
use crate::config::{Config, VERSION};
use crate::error::{NetworkError, NetworkErrorKind};
use crate::executor::TaskExecutor;
use crate::heartbeat::Heartbeat;
use crate::job::{JobDescriptor, JobResult};
use crate::modules::ModuleRegistry;

/// A condition that stops the current polling iteration before a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollBlock {
    QueueDisabled,
    WorkerDisabled,
    QueueEmpty,
    Network(NetworkErrorKind),
}

/// What a single pass through the state machine did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The iteration stopped before claiming a job.
    Blocked(PollBlock),
    /// A job was claimed, executed, and reported.
    Completed { failed: bool },
}

/// Edge-triggered log gate.
///
/// Remembers the last blocking condition; a repeat of the same condition
/// is not logged again until something else happens in between.
#[derive(Debug, Default)]
pub struct LogGate {
    last: Option<PollBlock>,
}

impl LogGate {
    /// Record the condition. `true` when it differs from the previous one
    /// and should therefore be logged.
    pub fn observe(&mut self, block: PollBlock) -> bool {
        if self.last == Some(block) {
            false
        } else {
            self.last = Some(block);
            true
        }
    }

    /// Forget the streak; the loop progressed past the failure point.
    pub fn clear(&mut self) {
        self.last = None;
    }
}

pub struct QueuePoller {
    api: ApiClient,
    heartbeat: Arc<Heartbeat>,
    executor: TaskExecutor,
    config: Config,
    gate: LogGate,
}

impl QueuePoller {
    pub fn new(
        api: ApiClient,
        heartbeat: Arc<Heartbeat>,
        registry: Arc<ModuleRegistry>,
        config: Config,
    ) -> Self {
        Self {
            executor: TaskExecutor::new(registry, Arc::clone(&heartbeat)),
            api,
            heartbeat,
            config,
            gate: LogGate::default(),
        }
    }

    /// Run the polling loop for the rest of the process lifetime.
    pub async fn run(mut self) {
        loop {
            self.heartbeat.set_idle();
            tokio::time::sleep(self.config.poll_interval).await;

            if let PollOutcome::Blocked(PollBlock::Network(_)) = self.poll_once().await {
                tokio::time::sleep(self.config.network_retry_interval).await;
            }
        }
    }

    /// One pass through the state machine: enablement gates → claim →
    /// execute → report.
    pub async fn poll_once(&mut self) -> PollOutcome {
        match self.api.queue_disabled().await {
            Err(error) => return self.network_block(error),
            Ok(true) => {
                if self.gate.observe(PollBlock::QueueDisabled) {
                    tracing::info!("The server queue is disabled");
                }
                return PollOutcome::Blocked(PollBlock::QueueDisabled);
            }
            Ok(false) => {}
        }

        match self.api.worker_disabled().await {
            Err(error) => return self.network_block(error),
            Ok(true) => {
                if self.gate.observe(PollBlock::WorkerDisabled) {
                    tracing::info!("This worker is disabled on the server");
                }
                return PollOutcome::Blocked(PollBlock::WorkerDisabled);
            }
            Ok(false) => {}
        }

        let job = match self.api.poll_job().await {
            Err(error) => return self.network_block(error),
            Ok(None) => {
                if self.gate.observe(PollBlock::QueueEmpty) {
                    tracing::info!("No jobs waiting on the queue");
                }
                return PollOutcome::Blocked(PollBlock::QueueEmpty);
            }
            Ok(Some(job)) => job,
        };
        self.gate.clear();

        let result = self.execute_job(&job).await;
        let failed = !result.completed;

        // At-most-once acknowledgment: the PATCH is never retried.
        if let Err(error) = self.api.report_completion(&job.job_id, &result).await {
            tracing::warn!(job_id = %job.job_id, %error, "Could not report job completion");
        }

        PollOutcome::Completed { failed }
    }

    fn network_block(&mut self, error: NetworkError) -> PollOutcome {
        let block = PollBlock::Network(error.kind());
        if self.gate.observe(block) {
            tracing::warn!(%error, "Control plane unreachable");
        }
        PollOutcome::Blocked(block)
    }

    /// Run one claimed job and build its completion report. Timestamps
    /// bound the whole job, not individual tasks.
    async fn execute_job(&self, job: &JobDescriptor) -> JobResult {
        self.heartbeat.set_in_progress(&job.job_id, &job.job_title);
        tracing::info!(job_id = %job.job_id, job_title = %job.job_title, "Starting job");

        let start_time = Utc::now();
        let outcome = self.executor.execute(job).await;
        let end_time = Utc::now();
        let runtime = end_time.signed_duration_since(start_time);

        if outcome.completed {
            tracing::info!(job_id = %job.job_id, %runtime, "Job finished");
        } else {
            tracing::warn!(job_id = %job.job_id, %runtime, "Job failed");
        }

        JobResult {
            start_time,
            end_time,
            runtime_secs: runtime.num_milliseconds() as f64 / 1000.0,
            completed: outcome.completed,
            failing_module: outcome.failing_module,
            message: outcome.message,
            worker_id: self.api.worker_id(),
            worker_hostname: self.config.hostname.clone(),
            agent_version: VERSION.to_string(),
        }
    }
}
