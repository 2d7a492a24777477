use std::sync::Arc;

use anyhow::Result;

use pipewright::api::ApiClient;
use pipewright::config::{Config, VERSION};
use pipewright::heartbeat::Heartbeat;
use pipewright::modules::ModuleRegistry;
use pipewright::poller::QueuePoller;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pipewright=info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env();

    tracing::info!("Starting pipewright, version {}", VERSION);
    tracing::info!("Worker ID..........: {}", config.worker_id);
    tracing::info!("Hostname...........: {}", config.hostname);
    tracing::info!("Queue server.......: {}", config.api_url);

    let api = ApiClient::new(&config.api_url, config.worker_id, config.http_timeout)?;

    let heartbeat = Arc::new(Heartbeat::new(
        api.clone(),
        config.hostname.clone(),
        VERSION,
        config.heartbeat_interval,
    ));
    heartbeat.set_startup();
    let _heartbeat_task = heartbeat.start();
    tracing::debug!("Heartbeat started, reporting to {}", config.api_url);

    let registry = Arc::new(ModuleRegistry::builtin());
    tracing::info!("Modules............: {}", registry.names().join(", "));

    let poller = QueuePoller::new(api, heartbeat, registry, config);
    poller.run().await;

    Ok(())
}
