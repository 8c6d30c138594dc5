use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::port_allocator::PortAllocator;
use super::provisioner::ContainerProvisioner;
use super::registry::SessionRegistry;
use crate::shared::config::OrchestratorConfig;
use crate::shared::error::{LabError, LabResult};
use crate::shared::models::{LabEnvironment, LabStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    IdleTimeout,
    MaxDuration,
    ContainerExited,
    Shutdown,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Manual => "manual",
            StopReason::IdleTimeout => "idle_timeout",
            StopReason::MaxDuration => "max_duration",
            StopReason::ContainerExited => "container_exited",
            StopReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapRequest {
    pub lab_id: String,
    pub reason: StopReason,
    /// 0 for fresh signals; retries of a claimed teardown count up from 1.
    pub attempt: u32,
}

impl ReapRequest {
    pub fn new(lab_id: impl Into<String>, reason: StopReason) -> Self {
        Self {
            lab_id: lab_id.into(),
            reason,
            attempt: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReapOutcome {
    Stopped(LabEnvironment),
    /// Someone else already claimed (or finished) the teardown.
    Skipped,
    RetryScheduled,
    /// Retries exhausted; ports were force-released and the lab is ERROR.
    Failed(LabEnvironment),
}

/// Tears labs down: claims them with a CAS, stops the container, returns
/// the ports and records the final state.
pub struct CleanupReaper {
    registry: Arc<SessionRegistry>,
    provisioner: Arc<ContainerProvisioner>,
    ports: Arc<PortAllocator>,
    config: Arc<OrchestratorConfig>,
    tx: mpsc::UnboundedSender<ReapRequest>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ReapRequest>>>,
    cancel: CancellationToken,
}

impl CleanupReaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        provisioner: Arc<ContainerProvisioner>,
        ports: Arc<PortAllocator>,
        config: Arc<OrchestratorConfig>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            registry,
            provisioner,
            ports,
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            cancel,
        }
    }

    /// Queue a teardown. Duplicate requests are harmless.
    pub fn submit(&self, req: ReapRequest) {
        debug!("Queueing reap of lab {} ({})", req.lab_id, req.reason);
        if self.tx.send(req).is_err() {
            warn!("Reaper queue closed, dropping request");
        }
    }

    /// Start the worker pool. Only the first call spawns workers.
    pub async fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let Some(rx) = self.rx.lock().await.take() else {
            return Vec::new();
        };
        let rx = Arc::new(Mutex::new(rx));
        let workers = self.config.reaper_workers.max(1);
        info!("Starting {} cleanup reaper workers", workers);

        (0..workers)
            .map(|worker| {
                let reaper = Arc::clone(self);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move { reaper.run_worker(worker, rx).await })
            })
            .collect()
    }

    async fn run_worker(
        &self,
        worker: usize,
        rx: Arc<Mutex<mpsc::UnboundedReceiver<ReapRequest>>>,
    ) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => None,
                req = async { rx.lock().await.recv().await } => req,
            };
            let Some(req) = next else {
                debug!("Reaper worker {} exiting", worker);
                return;
            };
            if let Err(e) = self.reap(req.clone()).await {
                error!("Reaper worker {} failed on lab {}: {}", worker, req.lab_id, e);
            }
        }
    }

    pub async fn reap(&self, req: ReapRequest) -> LabResult<ReapOutcome> {
        let reason = req.reason.as_str();
        let lab = if req.attempt == 0 {
            match self
                .registry
                .transition(
                    &req.lab_id,
                    &[LabStatus::Running, LabStatus::Paused],
                    LabStatus::Stopping,
                    Some(reason),
                )
                .await
            {
                Ok(lab) => lab,
                Err(LabError::InvalidTransition { actual, .. }) => {
                    debug!(
                        "Lab {} already {}, skipping {} reap",
                        req.lab_id, actual, reason
                    );
                    return Ok(ReapOutcome::Skipped);
                }
                Err(e) => return Err(e),
            }
        } else {
            let lab = self.registry.get(&req.lab_id).await?;
            if lab.status != LabStatus::Stopping {
                return Ok(ReapOutcome::Skipped);
            }
            lab
        };

        info!(
            "Reaping lab {} (reason {}, attempt {})",
            lab.id, reason, req.attempt
        );

        let stopped = match &lab.container_id {
            Some(container_id) => {
                self.provisioner
                    .stop(container_id, self.config.stop_grace_period)
                    .await
            }
            None => Ok(()),
        };

        match stopped {
            Ok(()) => {
                self.ports.release(&lab.host_ports()).await;
                let lab = self
                    .registry
                    .transition(&lab.id, &[LabStatus::Stopping], LabStatus::Stopped, Some(reason))
                    .await?;
                info!("Lab {} stopped ({})", lab.id, reason);
                Ok(ReapOutcome::Stopped(lab))
            }
            Err(e) if req.attempt < self.config.cleanup_max_retries => {
                warn!(
                    "Stopping lab {} failed (attempt {}/{}): {}",
                    lab.id,
                    req.attempt + 1,
                    self.config.cleanup_max_retries + 1,
                    e
                );
                self.schedule_retry(ReapRequest {
                    attempt: req.attempt + 1,
                    ..req
                });
                Ok(ReapOutcome::RetryScheduled)
            }
            Err(e) => {
                let failure = LabError::Cleanup {
                    id: lab.id.clone(),
                    message: e.to_string(),
                };
                error!("{}; force-releasing ports {:?}", failure, lab.host_ports());
                self.ports.release(&lab.host_ports()).await;
                let message = format!("cleanup_failed: {}", e);
                let lab = self
                    .registry
                    .transition(&lab.id, &[LabStatus::Stopping], LabStatus::Error, Some(&message))
                    .await?;
                Ok(ReapOutcome::Failed(lab))
            }
        }
    }

    fn schedule_retry(&self, req: ReapRequest) {
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let delay = self.config.monitor_interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(req);
                }
            }
        });
    }
}
