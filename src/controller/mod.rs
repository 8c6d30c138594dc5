pub mod docker_manager;
pub mod gateway;
pub mod lab_manager;
pub mod monitor;
pub mod port_allocator;
pub mod provisioner;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod workspace;

pub use docker_manager::DockerManager;
pub use lab_manager::LabOrchestrator;

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::shared::config::OrchestratorConfig;

pub async fn run(config: OrchestratorConfig, bind_addr: &str) -> Result<()> {
    tracing::info!("Starting lab environment controller...");

    let docker = DockerManager::connect()?;
    docker.ping().await?;
    tracing::info!("Connected to Docker daemon");

    let orchestrator = Arc::new(LabOrchestrator::new(config, Arc::new(docker))?);
    orchestrator.start().await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received");
        signal.cancel();
    })?;

    crate::api::rest::api::run_rest_server(orchestrator, bind_addr, shutdown).await
}
