//! Track-extraction module backed by the external `mkvextract` binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::TaskError;
use crate::heartbeat::Heartbeat;
use crate::modules::TaskModule;

/// What to pull out of the Matroska container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ExtractMode {
    Tracks,
    Attachments,
    Chapters,
}

impl ExtractMode {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Tracks => "tracks",
            Self::Attachments => "attachments",
            Self::Chapters => "chapters",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MkvextractPayload {
    source: PathBuf,
    mode: ExtractMode,
    /// `TID:destination` pairs for tracks/attachments; unused for chapters.
    #[serde(default)]
    specs: Vec<String>,
}

pub struct MkvextractModule {
    data: serde_json::Value,
    payload: Option<MkvextractPayload>,
    heartbeat: Arc<Heartbeat>,
    started: Instant,
}

impl MkvextractModule {
    pub fn new(data: serde_json::Value, heartbeat: Arc<Heartbeat>) -> Result<Self, TaskError> {
        Ok(Self {
            data,
            payload: None,
            heartbeat,
            started: Instant::now(),
        })
    }

    fn payload(&self) -> Result<&MkvextractPayload, TaskError> {
        self.payload
            .as_ref()
            .ok_or_else(|| TaskError::Run("task was not validated".into()))
    }
}

fn build_command(payload: &MkvextractPayload) -> Command {
    let mut cmd = Command::new("mkvextract");
    cmd.arg(&payload.source);
    cmd.arg(payload.mode.as_arg());
    for spec in &payload.specs {
        cmd.arg(spec);
    }
    cmd
}

#[async_trait]
impl TaskModule for MkvextractModule {
    fn name(&self) -> &str {
        "mkvextract"
    }

    async fn validate(&mut self) -> Result<(), TaskError> {
        let payload: MkvextractPayload = serde_json::from_value(self.data.clone())
            .map_err(|e| TaskError::Validation(e.to_string()))?;

        if payload.source.as_os_str().is_empty() {
            return Err(TaskError::Validation("'source' must not be empty".into()));
        }
        if payload.mode != ExtractMode::Chapters && payload.specs.is_empty() {
            return Err(TaskError::Validation(format!(
                "'specs' must not be empty for mode '{}'",
                payload.mode.as_arg()
            )));
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

        if !payload.source.exists() {
            return Err(TaskError::Run(format!(
                "source file does not exist: {:?}",
                payload.source
            )));
        }

        let mut cmd = build_command(&payload);
        tracing::info!(source = ?payload.source, mode = payload.mode.as_arg(), "Running mkvextract task");
        tracing::debug!(command = ?cmd, "Spawning mkvextract");

        let output = cmd
            .output()
            .await
            .map_err(|e| TaskError::Run(format!("could not spawn mkvextract: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaskError::Run(format!(
                "mkvextract exited with {}: {}",
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
