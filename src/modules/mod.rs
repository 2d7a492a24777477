//! Task module contract and the compile-time module registry.

pub mod cleanup;
pub mod ffmpeg;
pub mod mkvextract;
pub mod mkvmerge;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::heartbeat::Heartbeat;

pub use cleanup::CleanupModule;
pub use ffmpeg::FfmpegModule;
pub use mkvextract::MkvextractModule;
pub use mkvmerge::MkvmergeModule;

/// Capability set every pluggable task module implements.
///
/// One instance is constructed per task, driven through
/// validate → run → cleanup by the executor, then discarded. Modules run
/// synchronously from the poller's perspective; a module that supervises
/// an external process does so with its own cooperative polling loop.
#[async_trait]
pub trait TaskModule: Send {
    /// Stable module name, as listed in the registry.
    fn name(&self) -> &str;

    /// Check the task payload before any side effect.
    async fn validate(&mut self) -> Result<(), TaskError>;

    /// Perform the task's actual work.
    async fn run(&mut self) -> Result<(), TaskError>;

    /// Release whatever the run left behind.
    async fn cleanup(&mut self) -> Result<(), TaskError>;

    /// Wall-clock time since the instance was constructed. Used for
    /// logging and reporting only.
    fn elapsed(&self) -> Duration;
}

/// Constructs a module instance from its task payload and the shared
/// heartbeat handle.
pub type ModuleFactory = Box<
    dyn Fn(serde_json::Value, Arc<Heartbeat>) -> Result<Box<dyn TaskModule>, TaskError>
        + Send
        + Sync,
>;

/// Maps queue module names to constructors.
///
/// Populated once at startup and never mutated afterwards. Resolution is
/// lazy, immediately before a task's `validate()`; an unknown name aborts
/// the job with an initialization failure at that point, after any earlier
/// tasks have already run.
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding every built-in module under its queue name.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("ffmpeg", |data, hb| {
            FfmpegModule::new(data, hb).map(into_module)
        });
        registry.register("mkvmerge", |data, hb| {
            MkvmergeModule::new(data, hb).map(into_module)
        });
        registry.register("mkvextract", |data, hb| {
            MkvextractModule::new(data, hb).map(into_module)
        });
        registry.register("cleanup", |data, hb| {
            CleanupModule::new(data, hb).map(into_module)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(serde_json::Value, Arc<Heartbeat>) -> Result<Box<dyn TaskModule>, TaskError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered module names, sorted for stable log output.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct the named module for one task.
    pub fn resolve(
        &self,
        name: &str,
        data: serde_json::Value,
        heartbeat: Arc<Heartbeat>,
    ) -> Result<Box<dyn TaskModule>, TaskError> {
        match self.factories.get(name) {
            Some(factory) => factory(data, heartbeat),
            None => Err(TaskError::Initialization(format!(
                "no module registered under '{name}'"
            ))),
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn into_module<M: TaskModule + 'static>(module: M) -> Box<dyn TaskModule> {
    Box::new(module)
}
