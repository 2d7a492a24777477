//! Muxing module backed by the external `mkvmerge` binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::TaskError;
use crate::heartbeat::Heartbeat;
use crate::modules::TaskModule;

#[derive(Debug, Clone, Deserialize)]
struct MkvmergePayload {
    #[serde(default)]
    sources: Vec<PathBuf>,
    destination: PathBuf,
    #[serde(default)]
    extra_args: Vec<String>,
}

pub struct MkvmergeModule {
    data: serde_json::Value,
    payload: Option<MkvmergePayload>,
    heartbeat: Arc<Heartbeat>,
    started: Instant,
}

impl MkvmergeModule {
    pub fn new(data: serde_json::Value, heartbeat: Arc<Heartbeat>) -> Result<Self, TaskError> {
        Ok(Self {
            data,
            payload: None,
            heartbeat,
            started: Instant::now(),
        })
    }

    fn payload(&self) -> Result<&MkvmergePayload, TaskError> {
        self.payload
            .as_ref()
            .ok_or_else(|| TaskError::Run("task was not validated".into()))
    }
}

fn build_command(payload: &MkvmergePayload) -> Command {
    let mut cmd = Command::new("mkvmerge");
    cmd.arg("-o").arg(&payload.destination);
    for arg in &payload.extra_args {
        cmd.arg(arg);
    }
    for source in &payload.sources {
        cmd.arg(source);
    }
    cmd
}

#[async_trait]
impl TaskModule for MkvmergeModule {
    fn name(&self) -> &str {
        "mkvmerge"
    }

    async fn validate(&mut self) -> Result<(), TaskError> {
        let payload: MkvmergePayload = serde_json::from_value(self.data.clone())
            .map_err(|e| TaskError::Validation(e.to_string()))?;

        if payload.sources.is_empty() {
            return Err(TaskError::Validation(
                "'sources' must list at least one input".into(),
            ));
        }
        if payload.destination.as_os_str().is_empty() {
            return Err(TaskError::Validation(
                "'destination' must not be empty".into(),
            ));
        }

        self.payload = Some(payload);
        tracing::debug!("Task data validated");
        Ok(())
    }

    async fn run(&mut self) -> Result<(), TaskError> {
        let payload = self.payload()?.clone();
        let mut fields = serde_json::Map::new();
        fields.insert("task".into(), self.name().into());
        self.heartbeat.update_progress(fields);

        // Sources are re-checked at run time; another task in the pipeline
        // may have been expected to produce them.
        for source in &payload.sources {
            if !source.exists() {
                return Err(TaskError::Run(format!(
                    "source file does not exist: {source:?}"
                )));
            }
        }

        let mut cmd = build_command(&payload);
        tracing::info!(destination = ?payload.destination, "Running mkvmerge muxing task");
        tracing::debug!(command = ?cmd, "Spawning mkvmerge");

        let output = cmd
            .output()
            .await
            .map_err(|e| TaskError::Run(format!("could not spawn mkvmerge: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaskError::Run(format!(
                "mkvmerge exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
