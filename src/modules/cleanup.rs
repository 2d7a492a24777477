//! File-operations module: deletes, moves, and copies job artifacts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::TaskError;
use crate::heartbeat::Heartbeat;
use crate::modules::TaskModule;

#[derive(Debug, Clone, Deserialize)]
struct CleanupPayload {
    #[serde(default)]
    delete: Vec<PathBuf>,
    #[serde(default, rename = "move")]
    move_ops: Vec<TransferSpec>,
    #[serde(default, rename = "copy")]
    copy_ops: Vec<TransferSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct TransferSpec {
    source: PathBuf,
    destination: PathBuf,
}

impl CleanupPayload {
    fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.move_ops.is_empty() && self.copy_ops.is_empty()
    }
}

pub struct CleanupModule {
    data: serde_json::Value,
    payload: Option<CleanupPayload>,
    heartbeat: Arc<Heartbeat>,
    started: Instant,
}

impl CleanupModule {
    pub fn new(data: serde_json::Value, heartbeat: Arc<Heartbeat>) -> Result<Self, TaskError> {
        Ok(Self {
            data,
            payload: None,
            heartbeat,
            started: Instant::now(),
        })
    }

    fn payload(&self) -> Result<&CleanupPayload, TaskError> {
        self.payload
            .as_ref()
            .ok_or_else(|| TaskError::Run("task was not validated".into()))
    }

    async fn delete(&self, targets: &[PathBuf]) -> Result<(), TaskError> {
        for target in targets {
            if target.is_file() {
                tokio::fs::remove_file(target)
                    .await
                    .map_err(|e| TaskError::Run(format!("could not delete {target:?}: {e}")))?;
                tracing::debug!(path = ?target, "Deleted file");
            } else if target.is_dir() {
                // Only empty directories; a populated one is a run failure.
                tokio::fs::remove_dir(target)
                    .await
                    .map_err(|e| TaskError::Run(format!("could not remove {target:?}: {e}")))?;
                tracing::debug!(path = ?target, "Removed empty directory");
            } else {
                tracing::debug!(path = ?target, "Skipping missing target");
            }
        }
        Ok(())
    }

    async fn move_files(&self, ops: &[TransferSpec]) -> Result<(), TaskError> {
        for op in ops {
            ensure_parent(&op.destination).await?;
            tokio::fs::rename(&op.source, &op.destination)
                .await
                .map_err(|e| {
                    TaskError::Run(format!(
                        "could not move {:?} -> {:?}: {e}",
                        op.source, op.destination
                    ))
                })?;
            tracing::debug!(source = ?op.source, destination = ?op.destination, "Moved file");
        }
        Ok(())
    }

    async fn copy_files(&self, ops: &[TransferSpec]) -> Result<(), TaskError> {
        for op in ops {
            ensure_parent(&op.destination).await?;
            tokio::fs::copy(&op.source, &op.destination)
                .await
                .map_err(|e| {
                    TaskError::Run(format!(
                        "could not copy {:?} -> {:?}: {e}",
                        op.source, op.destination
                    ))
                })?;
            tracing::debug!(source = ?op.source, destination = ?op.destination, "Copied file");
        }
        Ok(())
    }
}

async fn ensure_parent(path: &PathBuf) -> Result<(), TaskError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TaskError::Run(format!("could not create {parent:?}: {e}")))?;
    }
    Ok(())
}

#[async_trait]
impl TaskModule for CleanupModule {
    fn name(&self) -> &str {
        "cleanup"
    }

    async fn validate(&mut self) -> Result<(), TaskError> {
        let payload: CleanupPayload = serde_json::from_value(self.data.clone())
            .map_err(|e| TaskError::Validation(e.to_string()))?;

        if payload.is_empty() {
            return Err(TaskError::Validation(
                "at least one of 'delete', 'move', 'copy' must be present".into(),
            ));
        }
        for op in payload.move_ops.iter().chain(payload.copy_ops.iter()) {
            if op.source.as_os_str().is_empty() || op.destination.as_os_str().is_empty() {
                return Err(TaskError::Validation(
                    "transfer entries need both 'source' and 'destination'".into(),
                ));
            }
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

        tracing::info!("Running cleanup operations");
        self.delete(&payload.delete).await?;
        self.move_files(&payload.move_ops).await?;
        self.copy_files(&payload.copy_ops).await?;
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
