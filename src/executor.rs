//! Ordered task pipeline execution for one job.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::error::TaskError;
use crate::heartbeat::Heartbeat;
use crate::job::JobDescriptor;
use crate::modules::{ModuleRegistry, TaskModule};

/// What one job's pipeline produced.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub completed: bool,
    /// Module of the task that stopped the pipeline, absent on success.
    pub failing_module: Option<String>,
    pub message: Option<String>,
}

impl JobOutcome {
    fn success() -> Self {
        Self {
            completed: true,
            failing_module: None,
            message: None,
        }
    }

    fn failure(module: &str, error: &TaskError) -> Self {
        Self {
            completed: false,
            failing_module: Some(module.to_string()),
            message: Some(error.to_string()),
        }
    }
}

/// Runs one job's task list strictly in order, stopping at the first
/// failure. Tasks after the failing one are never constructed.
pub struct TaskExecutor {
    registry: Arc<ModuleRegistry>,
    heartbeat: Arc<Heartbeat>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<ModuleRegistry>, heartbeat: Arc<Heartbeat>) -> Self {
        Self {
            registry,
            heartbeat,
        }
    }

    /// Drive every task through resolve → validate → run → cleanup.
    ///
    /// Never fails outright: any error, including a panic inside module
    /// code, is folded into the outcome so the polling loop always gets a
    /// result to report.
    pub async fn execute(&self, job: &JobDescriptor) -> JobOutcome {
        let names: Vec<&str> = job.tasks.iter().map(|t| t.module.as_str()).collect();
        tracing::info!(job_id = %job.job_id, tasks = %names.join(", "), "Found tasks in job");

        let total = job.tasks.len();
        for (idx, task) in job.tasks.iter().enumerate() {
            tracing::info!(
                module = %task.module,
                "Starting task [{} of {}]",
                idx + 1,
                total
            );

            let mut module = match self.registry.resolve(
                &task.module,
                task.data.clone(),
                Arc::clone(&self.heartbeat),
            ) {
                Ok(module) => module,
                Err(error) => {
                    tracing::warn!(job_id = %job.job_id, module = %task.module, %error, "Aborting job");
                    return JobOutcome::failure(&task.module, &error);
                }
            };

            if let Err(error) = drive(module.as_mut()).await {
                tracing::warn!(
                    job_id = %job.job_id,
                    module = %task.module,
                    %error,
                    runtime = ?module.elapsed(),
                    "Aborting job"
                );
                return JobOutcome::failure(&task.module, &error);
            }

            tracing::info!(module = %task.module, runtime = ?module.elapsed(), "Task finished");
        }

        JobOutcome::success()
    }
}

/// validate → run → cleanup for a single module instance.
async fn drive(module: &mut dyn TaskModule) -> Result<(), TaskError> {
    guard(module.validate()).await?;
    guard(module.run()).await?;
    guard(module.cleanup()).await?;
    Ok(())
}

/// Convert a panicking phase into [`TaskError::Unknown`] so a module bug
/// never takes the agent down.
async fn guard<F>(phase: F) -> Result<(), TaskError>
where
    F: Future<Output = Result<(), TaskError>>,
{
    match AssertUnwindSafe(phase).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(TaskError::Unknown(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;

    use crate::job::TaskDescriptor;

    /// Which phase a scripted module should fail in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FailPhase {
        None,
        Validate,
        Run,
        Cleanup,
        PanicInRun,
    }

    struct ScriptedModule {
        name: String,
        fail: FailPhase,
        message: String,
        started: Instant,
    }

    #[async_trait]
    impl TaskModule for ScriptedModule {
        fn name(&self) -> &str {
            &self.name
        }

        async fn validate(&mut self) -> Result<(), TaskError> {
            match self.fail {
                FailPhase::Validate => Err(TaskError::Validation(self.message.clone())),
                _ => Ok(()),
            }
        }

        async fn run(&mut self) -> Result<(), TaskError> {
            match self.fail {
                FailPhase::Run => Err(TaskError::Run(self.message.clone())),
                FailPhase::PanicInRun => panic!("{}", self.message.clone()),
                _ => Ok(()),
            }
        }

        async fn cleanup(&mut self) -> Result<(), TaskError> {
            match self.fail {
                FailPhase::Cleanup => Err(TaskError::Cleanup(self.message.clone())),
                _ => Ok(()),
            }
        }

        fn elapsed(&self) -> Duration {
            self.started.elapsed()
        }
    }

    fn heartbeat() -> Arc<Heartbeat> {
        let api = crate::api::ApiClient::new(
            "http://127.0.0.1:1",
            uuid::Uuid::new_v4(),
            Duration::from_secs(1),
        )
        .unwrap();
        Arc::new(Heartbeat::new(
            api,
            "test-host".into(),
            "0.0.0",
            Duration::from_secs(5),
        ))
    }

    /// Registry where each module records how many times it was built and
    /// fails in the phase its payload asks for.
    fn scripted_registry(counters: &[(&str, Arc<AtomicUsize>)]) -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        for (name, counter) in counters {
            let name = name.to_string();
            let counter = Arc::clone(counter);
            registry.register(name.clone(), move |data, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                let fail = match data.get("fail").and_then(|v| v.as_str()) {
                    Some("validate") => FailPhase::Validate,
                    Some("run") => FailPhase::Run,
                    Some("cleanup") => FailPhase::Cleanup,
                    Some("panic") => FailPhase::PanicInRun,
                    _ => FailPhase::None,
                };
                let message = data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("boom")
                    .to_string();
                Ok(Box::new(ScriptedModule {
                    name: name.clone(),
                    fail,
                    message,
                    started: Instant::now(),
                }))
            });
        }
        registry
    }

    fn job(tasks: Vec<(&str, serde_json::Value)>) -> JobDescriptor {
        JobDescriptor {
            job_id: "j-1".into(),
            job_title: "test job".into(),
            tasks: tasks
                .into_iter()
                .map(|(module, data)| TaskDescriptor {
                    module: module.into(),
                    data,
                })
                .collect(),
        }
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test]
    async fn all_tasks_succeeding_completes_the_job() {
        let c = counter();
        let registry = Arc::new(scripted_registry(&[("extract", Arc::clone(&c))]));
        let executor = TaskExecutor::new(registry, heartbeat());

        let outcome = executor
            .execute(&job(vec![
                ("extract", serde_json::json!({})),
                ("extract", serde_json::json!({})),
            ]))
            .await;

        assert!(outcome.completed);
        assert!(outcome.failing_module.is_none());
        assert!(outcome.message.is_none());
        assert_eq!(c.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_failure_stops_the_pipeline_mid_job() {
        let ok = counter();
        let failing = counter();
        let never = counter();
        let registry = Arc::new(scripted_registry(&[
            ("ok", Arc::clone(&ok)),
            ("transcode", Arc::clone(&failing)),
            ("never", Arc::clone(&never)),
        ]));
        let executor = TaskExecutor::new(registry, heartbeat());

        let outcome = executor
            .execute(&job(vec![
                ("ok", serde_json::json!({})),
                (
                    "transcode",
                    serde_json::json!({"fail": "run", "message": "disk full"}),
                ),
                ("never", serde_json::json!({})),
            ]))
            .await;

        assert!(!outcome.completed);
        assert_eq!(outcome.failing_module.as_deref(), Some("transcode"));
        assert_eq!(
            outcome.message.as_deref(),
            Some("Failed to run task: disk full")
        );
        // The task after the failure was never constructed.
        assert_eq!(never.load(Ordering::SeqCst), 0);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validation_failure_aborts_before_run() {
        let c = counter();
        let registry = Arc::new(scripted_registry(&[("check", Arc::clone(&c))]));
        let executor = TaskExecutor::new(registry, heartbeat());

        let outcome = executor
            .execute(&job(vec![(
                "check",
                serde_json::json!({"fail": "validate", "message": "bad shape"}),
            )]))
            .await;

        assert!(!outcome.completed);
        assert_eq!(
            outcome.message.as_deref(),
            Some("Could not validate task data: bad shape")
        );
    }

    #[tokio::test]
    async fn cleanup_failure_still_fails_the_job() {
        let c = counter();
        let registry = Arc::new(scripted_registry(&[("tidy", Arc::clone(&c))]));
        let executor = TaskExecutor::new(registry, heartbeat());

        let outcome = executor
            .execute(&job(vec![(
                "tidy",
                serde_json::json!({"fail": "cleanup", "message": "lock held"}),
            )]))
            .await;

        assert!(!outcome.completed);
        assert_eq!(
            outcome.message.as_deref(),
            Some("Failed to cleanup task: lock held")
        );
    }

    #[tokio::test]
    async fn unknown_module_aborts_without_constructing_anything() {
        let after = counter();
        let registry = Arc::new(scripted_registry(&[("after", Arc::clone(&after))]));
        let executor = TaskExecutor::new(registry, heartbeat());

        let outcome = executor
            .execute(&job(vec![
                ("unknown_module", serde_json::json!({})),
                ("after", serde_json::json!({})),
            ]))
            .await;

        assert!(!outcome.completed);
        assert_eq!(outcome.failing_module.as_deref(), Some("unknown_module"));
        assert_eq!(
            outcome.message.as_deref(),
            Some("Could not initialize module: no module registered under 'unknown_module'")
        );
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panic_in_module_code_becomes_an_unknown_failure() {
        let c = counter();
        let never = counter();
        let registry = Arc::new(scripted_registry(&[
            ("buggy", Arc::clone(&c)),
            ("never", Arc::clone(&never)),
        ]));
        let executor = TaskExecutor::new(registry, heartbeat());

        let outcome = executor
            .execute(&job(vec![
                (
                    "buggy",
                    serde_json::json!({"fail": "panic", "message": "index out of bounds"}),
                ),
                ("never", serde_json::json!({})),
            ]))
            .await;

        assert!(!outcome.completed);
        assert_eq!(outcome.failing_module.as_deref(), Some("buggy"));
        assert_eq!(
            outcome.message.as_deref(),
            Some("Unknown failure on task: index out of bounds")
        );
        assert_eq!(never.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_task_list_is_a_completed_job() {
        let registry = Arc::new(ModuleRegistry::new());
        let executor = TaskExecutor::new(registry, heartbeat());

        let outcome = executor.execute(&job(vec![])).await;
        assert!(outcome.completed);
    }
}
