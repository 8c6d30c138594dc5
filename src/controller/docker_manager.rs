use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::{CreateImageOptions, ListImagesOptions},
    models::{HostConfig, Mount, MountTypeEnum, PortBinding as DockerPortBinding},
    Docker,
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, ManagedContainer, RuntimeError};
use crate::shared::models::constants::{LABEL_LAB_ID, LABEL_MANAGED};

const CPU_PERIOD: i64 = 100_000;

/// Docker-backed [`ContainerRuntime`].
pub struct DockerManager {
    docker: Docker,
}

impl DockerManager {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker))
    }

    /// Verify the daemon answers before the controller starts serving.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![image.to_string()]);
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await?;
        if !images.is_empty() {
            return Ok(());
        }

        info!("Pulling image {}", image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                debug!("pull {}: {}", image, status);
            }
        }
        info!("Image {} pulled", image);
        Ok(())
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for binding in &spec.port_bindings {
            let key = format!("{}/tcp", binding.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![DockerPortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
        }

        let mounts: Vec<Mount> = spec
            .volumes
            .iter()
            .map(|v| Mount {
                target: Some(v.container_path.clone()),
                source: Some(v.host_path.to_string_lossy().to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(v.read_only),
                ..Default::default()
            })
            .collect();

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let memory = i64::try_from(spec.memory_limit).unwrap_or(i64::MAX);

        Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            user: spec.user.clone(),
            labels: Some(labels),
            env: Some(env),
            working_dir: Some(spec.working_dir.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                cpu_quota: Some((spec.cpu_limit * CPU_PERIOD as f64) as i64),
                cpu_period: Some(CPU_PERIOD),
                memory: Some(memory),
                memory_swap: Some(memory),
                network_mode: spec.network.clone(),
                mounts: Some(mounts),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.ensure_image(&spec.image).await?;

        info!(
            "Creating container {} from image {} ({} port bindings)",
            spec.name,
            spec.image,
            spec.port_bindings.len()
        );
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let container = self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await?;
        for warning in &container.warnings {
            warn!("Container {} create warning: {}", spec.name, warning);
        }
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        grace: Duration,
    ) -> Result<(), RuntimeError> {
        info!("Stopping container {} (grace {:?})", container_id, grace);
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await?;
        info!("Container {} removed", container_id);
        Ok(())
    }

    async fn pause_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker.pause_container(container_id).await?;
        Ok(())
    }

    async fn unpause_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker.unpause_container(container_id).await?;
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        working_dir: Option<&str>,
    ) -> Result<ExecOutput, RuntimeError> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: working_dir.map(str::to_string),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container_id, exec_config).await?;

        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(frame) = output.next().await {
                match frame? {
                    LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    LogOutput::Console { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(0),
            stdout,
            stderr,
        })
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, RuntimeError> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", LABEL_MANAGED)]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let lab_id = c.labels.and_then(|mut l| l.remove(LABEL_LAB_ID));
                let running = c.state.as_deref() == Some("running");
                Some(ManagedContainer {
                    id,
                    name,
                    lab_id,
                    running,
                })
            })
            .collect())
    }
}
