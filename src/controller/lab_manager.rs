use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::gateway::IdeGateway;
use super::monitor::TimeoutMonitor;
use super::port_allocator::PortAllocator;
use super::provisioner::ContainerProvisioner;
use super::reaper::{CleanupReaper, ReapOutcome, ReapRequest, StopReason};
use super::registry::{LabEvent, SessionRegistry, StopDisposition};
use super::runtime::ContainerRuntime;
use super::workspace::WorkspaceFileManager;
use crate::shared::config::OrchestratorConfig;
use crate::shared::error::{LabError, LabResult};
use crate::shared::models::{IdeType, LabConfig, LabConfigRequest, LabEnvironment, LabStatus};

#[derive(Debug, Clone, Serialize)]
pub struct CreatedLab {
    pub lab_id: String,
    pub status: LabStatus,
    pub ide_urls: BTreeMap<IdeType, String>,
}

/// Composition root: owns the registry, port pool, provisioner, workspace
/// manager, gateway, monitor and reaper, and exposes the inbound lab API.
pub struct LabOrchestrator {
    config: Arc<OrchestratorConfig>,
    registry: Arc<SessionRegistry>,
    ports: Arc<PortAllocator>,
    provisioner: Arc<ContainerProvisioner>,
    files: Arc<WorkspaceFileManager>,
    gateway: IdeGateway,
    reaper: Arc<CleanupReaper>,
    monitor: Arc<TimeoutMonitor>,
    provisioning: Semaphore,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LabOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let cancel = CancellationToken::new();

        let registry = Arc::new(SessionRegistry::new());
        let ports = Arc::new(PortAllocator::new(
            config.port_range_start,
            config.port_range_end,
        ));
        let provisioner = Arc::new(ContainerProvisioner::new(runtime, config.clone()));
        let files = Arc::new(WorkspaceFileManager::new(
            registry.clone(),
            config.workspace_root.clone(),
            config.container_workspace_path.clone(),
        )
        .with_owner(config.workspace_owner));
        let gateway = IdeGateway::new(registry.clone(), files.clone(), provisioner.clone());
        let reaper = Arc::new(CleanupReaper::new(
            registry.clone(),
            provisioner.clone(),
            ports.clone(),
            config.clone(),
            cancel.clone(),
        ));
        let monitor = Arc::new(TimeoutMonitor::new(
            registry.clone(),
            reaper.clone(),
            provisioner.clone(),
            config.clone(),
        ));

        Ok(Self {
            provisioning: Semaphore::new(config.max_concurrent_provisioning),
            config,
            registry,
            ports,
            provisioner,
            files,
            gateway,
            reaper,
            monitor,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Sweep orphaned containers, then start the reaper workers and the
    /// timeout monitor.
    pub async fn start(&self) -> LabResult<()> {
        let known: Vec<String> = self.registry.list().await.into_iter().map(|l| l.id).collect();
        match self.provisioner.remove_orphans(&known).await {
            Ok(0) => {}
            Ok(n) => info!("Removed {} orphaned lab containers", n),
            Err(e) => warn!("Orphan sweep failed: {}", e),
        }

        let mut tasks = self.tasks.lock().await;
        tasks.extend(self.reaper.spawn_workers().await);
        let monitor = self.monitor.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move { monitor.run(cancel).await }));
        info!(
            "Lab orchestrator started (ports {}-{}, {} provisioning slots)",
            self.config.port_range_start,
            self.config.port_range_end,
            self.config.max_concurrent_provisioning
        );
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LabEvent> {
        self.registry.subscribe()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn create_lab(
        &self,
        student_id: &str,
        course_id: &str,
        request: LabConfigRequest,
    ) -> LabResult<CreatedLab> {
        if student_id.trim().is_empty() || course_id.trim().is_empty() {
            return Err(LabError::Validation(
                "student_id and course_id are required".into(),
            ));
        }
        let config = LabConfig::from_request(
            request,
            self.config.default_cpu_limit,
            self.config.default_memory_limit,
            &self.config.images,
        )?;

        let lab_id = self.registry.create(student_id, course_id, config).await;

        let permit = match tokio::time::timeout(
            self.config.start_timeout,
            self.provisioning.acquire(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                let err = LabError::ContainerRuntime("orchestrator is shutting down".into());
                self.fail(&lab_id, &err).await;
                return Err(err);
            }
            Err(_) => {
                let lab = self.registry.get(&lab_id).await?;
                let err = LabError::ContainerStartTimeout {
                    container: lab.container_name,
                    timeout: self.config.start_timeout,
                };
                self.fail(&lab_id, &err).await;
                return Err(err);
            }
        };

        let mut lab = self.provision(&lab_id).await?;
        if lab.stop_requested {
            info!("Lab {} was stopped while provisioning, tearing down", lab_id);
            match self
                .reaper
                .reap(ReapRequest::new(&lab_id, StopReason::Manual))
                .await?
            {
                ReapOutcome::Stopped(stopped) | ReapOutcome::Failed(stopped) => lab = stopped,
                ReapOutcome::Skipped | ReapOutcome::RetryScheduled => {}
            }
        }
        // Held through the deferred teardown so shutdown waits for it too
        drop(permit);
        Ok(CreatedLab {
            lab_id,
            status: lab.status,
            ide_urls: lab.ide_urls,
        })
    }

    async fn provision(&self, lab_id: &str) -> LabResult<LabEnvironment> {
        let lab = self.registry.get(lab_id).await?;
        let ides = lab.config.ides();

        let allocated = match self.ports.allocate(ides.len()).await {
            Ok(ports) => ports,
            Err(e) => {
                self.fail(lab_id, &e).await;
                return Err(e);
            }
        };
        let port_map: BTreeMap<IdeType, u16> = ides.iter().copied().zip(allocated.iter().copied()).collect();

        let prepared = async {
            let urls = self.ide_urls(&port_map)?;
            let workspace = self.files.prepare(lab_id).await?;
            self.registry
                .set_endpoints(lab_id, port_map.clone(), urls, workspace.clone())
                .await?;
            self.registry
                .transition(lab_id, &[LabStatus::Creating], LabStatus::Starting, None)
                .await?;
            Ok::<_, LabError>(workspace)
        }
        .await;
        let workspace = match prepared {
            Ok(workspace) => workspace,
            Err(e) => {
                self.ports.release(&allocated).await;
                self.fail(lab_id, &e).await;
                return Err(e);
            }
        };

        let lab = self.registry.get(lab_id).await?;
        let container_id = match self.provisioner.start(&lab, &port_map, &workspace).await {
            Ok(id) => id,
            Err(e) => {
                error!("Provisioning lab {} failed: {}", lab_id, e);
                self.ports.release(&allocated).await;
                self.fail(lab_id, &e).await;
                return Err(e);
            }
        };

        self.registry.set_container_id(lab_id, &container_id).await?;
        let lab = self
            .registry
            .transition(lab_id, &[LabStatus::Starting], LabStatus::Running, None)
            .await?;
        info!(
            "Lab {} running for {} ({} IDEs)",
            lab_id,
            lab.student_id,
            lab.ide_urls.len()
        );
        Ok(lab)
    }

    fn ide_urls(&self, ports: &BTreeMap<IdeType, u16>) -> LabResult<BTreeMap<IdeType, String>> {
        let mut urls = BTreeMap::new();
        for (ide, port) in ports {
            let url = Url::parse(&format!("http://{}:{}/", self.config.public_host, port))
                .map_err(|e| LabError::Validation(format!("invalid public host: {}", e)))?;
            urls.insert(*ide, url.to_string());
        }
        Ok(urls)
    }

    async fn fail(&self, lab_id: &str, err: &LabError) {
        let message = format!("{}: {}", err.kind(), err);
        if let Err(e) = self
            .registry
            .transition(
                lab_id,
                &[LabStatus::Creating, LabStatus::Starting],
                LabStatus::Error,
                Some(&message),
            )
            .await
        {
            warn!("Could not mark lab {} as failed: {}", lab_id, e);
        }
    }

    pub async fn get_lab(&self, lab_id: &str) -> LabResult<LabEnvironment> {
        self.registry.get(lab_id).await
    }

    pub async fn list_labs(&self) -> Vec<LabEnvironment> {
        self.registry.list().await
    }

    /// Stop a lab. Repeated calls are no-ops that return the current state.
    pub async fn stop_lab(&self, lab_id: &str) -> LabResult<LabEnvironment> {
        match self.registry.request_stop(lab_id).await? {
            StopDisposition::Enqueue => {
                match self
                    .reaper
                    .reap(ReapRequest::new(lab_id, StopReason::Manual))
                    .await?
                {
                    ReapOutcome::Stopped(lab) | ReapOutcome::Failed(lab) => return Ok(lab),
                    ReapOutcome::Skipped | ReapOutcome::RetryScheduled => {}
                }
            }
            StopDisposition::Deferred => {
                info!("Lab {} still provisioning, stop deferred", lab_id);
            }
            StopDisposition::AlreadyHandled => {}
        }
        self.registry.get(lab_id).await
    }

    pub async fn pause_lab(&self, lab_id: &str) -> LabResult<LabEnvironment> {
        let lab = self
            .registry
            .transition(lab_id, &[LabStatus::Running], LabStatus::Paused, None)
            .await?;
        if let Some(container_id) = lab.container_id.as_deref() {
            if let Err(e) = self.provisioner.pause(container_id).await {
                error!("Pausing lab {} failed: {}", lab_id, e);
                self.rollback(lab_id, LabStatus::Paused, LabStatus::Running)
                    .await;
                return Err(e);
            }
        }
        Ok(lab)
    }

    pub async fn resume_lab(&self, lab_id: &str) -> LabResult<LabEnvironment> {
        let lab = self
            .registry
            .transition(lab_id, &[LabStatus::Paused], LabStatus::Running, None)
            .await?;
        if let Some(container_id) = lab.container_id.as_deref() {
            if let Err(e) = self.provisioner.unpause(container_id).await {
                error!("Resuming lab {} failed: {}", lab_id, e);
                self.rollback(lab_id, LabStatus::Running, LabStatus::Paused)
                    .await;
                return Err(e);
            }
        }
        Ok(lab)
    }

    async fn rollback(&self, lab_id: &str, from: LabStatus, to: LabStatus) {
        if let Err(e) = self.registry.transition(lab_id, &[from], to, None).await {
            warn!("Rollback of lab {} to {} lost a race: {}", lab_id, to, e);
        }
    }

    pub async fn proxy_action(
        &self,
        lab_id: &str,
        ide_type: &str,
        action: &str,
        payload: Value,
    ) -> LabResult<Value> {
        self.gateway.dispatch(lab_id, ide_type, action, payload).await
    }

    pub async fn download_workspace(&self, lab_id: &str) -> LabResult<Bytes> {
        self.files.zip(lab_id).await
    }

    pub async fn download_file(&self, lab_id: &str, path: &str) -> LabResult<Vec<u8>> {
        self.files.read(lab_id, path).await
    }

    /// Wait for in-flight provisioning, stop the background tasks, then tear
    /// down every live lab inline so nothing is left to a worker that has
    /// already exited.
    pub async fn shutdown(&self) {
        info!("Shutting down lab orchestrator");
        let slots = self.config.max_concurrent_provisioning as u32;
        let settle = self.config.start_timeout * 2;
        match tokio::time::timeout(settle, self.provisioning.acquire_many(slots)).await {
            Ok(Ok(permits)) => permits.forget(),
            Ok(Err(_)) => debug!("Provisioning already closed"),
            Err(_) => warn!("Provisioning still busy after {:?}, shutting down anyway", settle),
        }
        self.provisioning.close();

        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        for lab in self.registry.list_active().await {
            match lab.status {
                LabStatus::Running | LabStatus::Paused => self.reap_for_shutdown(&lab.id, 0).await,
                // A retry was pending on a timer that is now cancelled
                LabStatus::Stopping => self.reap_for_shutdown(&lab.id, 1).await,
                LabStatus::Creating | LabStatus::Starting => {
                    warn!("Lab {} still provisioning at shutdown", lab.id);
                    let _ = self.registry.request_stop(&lab.id).await;
                }
                _ => {}
            }
        }
        info!("Lab orchestrator stopped");
    }

    /// Reap without the worker pool, retrying in place until the lab stops
    /// or its retries run out and it is force-released into ERROR.
    async fn reap_for_shutdown(&self, lab_id: &str, mut attempt: u32) {
        loop {
            let req = ReapRequest {
                attempt,
                ..ReapRequest::new(lab_id, StopReason::Shutdown)
            };
            match self.reaper.reap(req).await {
                Ok(ReapOutcome::RetryScheduled) => attempt += 1,
                Ok(_) => return,
                Err(e) => {
                    error!("Failed to stop lab {} during shutdown: {}", lab_id, e);
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn ports(&self) -> &PortAllocator {
        &self.ports
    }
}
