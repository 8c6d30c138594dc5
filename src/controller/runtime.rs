//! Container runtime seam.
//!
//! The provisioner, gateway and reaper only talk to containers through
//! [`ContainerRuntime`]. [`super::docker_manager::DockerManager`] implements it
//! against the Docker daemon; tests use the in-memory [`fake::FakeRuntime`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::shared::error::LabError;
use crate::shared::models::IdeType;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("runtime daemon error: {0}")]
    Daemon(String),
    #[error("runtime call timed out: {0}")]
    Timeout(String),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            other => RuntimeError::Daemon(other.to_string()),
        }
    }
}

impl From<RuntimeError> for LabError {
    fn from(err: RuntimeError) -> Self {
        LabError::ContainerRuntime(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub ide: IdeType,
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything the runtime needs to create one lab container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub hostname: String,
    pub user: Option<String>,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub port_bindings: Vec<PortBinding>,
    pub volumes: Vec<VolumeBinding>,
    pub cpu_limit: f64,
    pub memory_limit: u64,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub lab_id: Option<String>,
    pub running: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container; returns its runtime id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Send the graceful termination signal and wait up to `grace`.
    async fn stop_container(&self, container_id: &str, grace: Duration)
        -> Result<(), RuntimeError>;

    /// Force-remove the container.
    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn pause_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn unpause_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        working_dir: Option<&str>,
    ) -> Result<ExecOutput, RuntimeError>;

    async fn is_running(&self, container_id: &str) -> Result<bool, RuntimeError>;

    /// Containers carrying the managed label, running or not.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;
}
