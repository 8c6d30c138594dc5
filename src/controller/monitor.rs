use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::provisioner::ContainerProvisioner;
use super::reaper::{CleanupReaper, ReapRequest, StopReason};
use super::registry::{LabEvent, SessionRegistry};
use crate::shared::config::OrchestratorConfig;
use crate::shared::models::{LabEnvironment, LabStatus};

const DEADLINE_INACTIVITY: &str = "inactivity";
const DEADLINE_MAX_DURATION: &str = "max_duration";

/// Periodically flags idle, expired and dead labs for the reaper.
///
/// The monitor only reads the registry and enqueues work; every state change
/// happens in the reaper through the registry's CAS.
pub struct TimeoutMonitor {
    registry: Arc<SessionRegistry>,
    reaper: Arc<CleanupReaper>,
    provisioner: Arc<ContainerProvisioner>,
    config: Arc<OrchestratorConfig>,
    warned: Mutex<HashSet<(String, &'static str, i64)>>,
    ticks: AtomicU64,
}

impl TimeoutMonitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        reaper: Arc<CleanupReaper>,
        provisioner: Arc<ContainerProvisioner>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            registry,
            reaper,
            provisioner,
            config,
            warned: Mutex::new(HashSet::new()),
            ticks: AtomicU64::new(0),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.monitor_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Timeout monitor started (interval {:?}, inactivity {:?}, max duration {:?})",
            self.config.monitor_interval, self.config.inactivity_timeout, self.config.max_duration
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Timeout monitor stopped");
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        for req in self.scan_once(Utc::now()).await {
            self.reaper.submit(req);
        }
        let every = u64::from(self.config.health_check_every);
        if every > 0 && tick % every == 0 {
            for req in self.check_health().await {
                self.reaper.submit(req);
            }
        }
    }

    /// Evaluate every live lab against the deadlines at `now`. Returns the
    /// expiry requests; warnings are broadcast once per deadline.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Vec<ReapRequest> {
        let inactivity = to_chrono(self.config.inactivity_timeout);
        let max_duration = to_chrono(self.config.max_duration);
        let warning = to_chrono(self.config.timeout_warning);

        let labs = self.registry.list_active().await;
        let mut expired = Vec::new();
        let mut warned = self.warned.lock().await;
        warned.retain(|(id, _, _)| labs.iter().any(|lab| &lab.id == id));

        for lab in &labs {
            if !matches!(lab.status, LabStatus::Running | LabStatus::Paused) {
                continue;
            }
            let idle = lab.idle_for(now);
            let age = lab.age(now);

            if age > max_duration {
                info!("Lab {} exceeded max duration ({}s)", lab.id, age.num_seconds());
                expired.push(ReapRequest::new(&lab.id, StopReason::MaxDuration));
                continue;
            }
            if idle > inactivity {
                info!("Lab {} idle for {}s", lab.id, idle.num_seconds());
                expired.push(ReapRequest::new(&lab.id, StopReason::IdleTimeout));
                continue;
            }

            let idle_deadline = lab.last_accessed.unwrap_or(lab.created_at) + inactivity;
            let max_deadline = lab.created_at + max_duration;
            for (deadline_kind, deadline) in [
                (DEADLINE_INACTIVITY, idle_deadline),
                (DEADLINE_MAX_DURATION, max_deadline),
            ] {
                let remaining = deadline - now;
                if remaining > warning {
                    continue;
                }
                let key = (lab.id.clone(), deadline_kind, deadline.timestamp());
                if warned.insert(key) {
                    self.warn(lab, deadline_kind, remaining.num_seconds());
                }
            }
        }
        expired
    }

    fn warn(&self, lab: &LabEnvironment, deadline: &'static str, remaining_seconds: i64) {
        debug!(
            "Lab {} reaches its {} limit in {}s",
            lab.id, deadline, remaining_seconds
        );
        self.registry.emit(LabEvent::TimeoutWarning {
            lab_id: lab.id.clone(),
            deadline,
            remaining_seconds,
        });
    }

    /// RUNNING labs whose container is gone.
    pub async fn check_health(&self) -> Vec<ReapRequest> {
        let mut dead = Vec::new();
        for lab in self.registry.list_active().await {
            if lab.status != LabStatus::Running {
                continue;
            }
            let Some(container_id) = lab.container_id.as_deref() else {
                continue;
            };
            match self.provisioner.is_running(container_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Container {} of lab {} is not running", container_id, lab.id);
                    dead.push(ReapRequest::new(&lab.id, StopReason::ContainerExited));
                }
                Err(e) => warn!("Health check for lab {} failed: {}", lab.id, e),
            }
        }
        dead
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::port_allocator::PortAllocator;
    use crate::controller::runtime::fake::FakeRuntime;
    use crate::shared::config::ImageCatalog;
    use crate::shared::models::{LabConfig, LabConfigRequest};

    struct Fixture {
        registry: Arc<SessionRegistry>,
        runtime: Arc<FakeRuntime>,
        monitor: TimeoutMonitor,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(OrchestratorConfig {
            inactivity_timeout: Duration::from_secs(60),
            max_duration: Duration::from_secs(600),
            timeout_warning: Duration::from_secs(10),
            ..Default::default()
        });
        let registry = Arc::new(SessionRegistry::new());
        let runtime = Arc::new(FakeRuntime::new());
        let provisioner = Arc::new(ContainerProvisioner::new(runtime.clone(), config.clone()));
        let reaper = Arc::new(CleanupReaper::new(
            registry.clone(),
            provisioner.clone(),
            Arc::new(PortAllocator::new(24300, 24309)),
            config.clone(),
            CancellationToken::new(),
        ));
        let monitor = TimeoutMonitor::new(registry.clone(), reaper, provisioner, config);
        Fixture {
            registry,
            runtime,
            monitor,
        }
    }

    async fn running_lab(registry: &SessionRegistry) -> String {
        let req = LabConfigRequest {
            language: "python".into(),
            ..Default::default()
        };
        let cfg = LabConfig::from_request(req, 1.0, 1 << 30, &ImageCatalog::default()).unwrap();
        let id = registry.create("alice", "cs101", cfg).await;
        registry
            .transition(&id, &[LabStatus::Creating], LabStatus::Starting, None)
            .await
            .unwrap();
        registry
            .transition(&id, &[LabStatus::Starting], LabStatus::Running, None)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn fresh_labs_are_left_alone() {
        let f = fixture();
        running_lab(&f.registry).await;
        assert!(f.monitor.scan_once(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn idle_labs_expire() {
        let f = fixture();
        let id = running_lab(&f.registry).await;
        f.registry
            .backdate(&id, chrono::Duration::seconds(61), None)
            .await;
        let expired = f.monitor.scan_once(Utc::now()).await;
        assert_eq!(expired, vec![ReapRequest::new(&id, StopReason::IdleTimeout)]);
    }

    #[tokio::test]
    async fn activity_resets_idle_but_not_max_duration() {
        let f = fixture();
        let id = running_lab(&f.registry).await;
        f.registry
            .backdate(&id, chrono::Duration::seconds(601), None)
            .await;
        f.registry.touch(&id).await.unwrap();
        let expired = f.monitor.scan_once(Utc::now()).await;
        assert_eq!(expired, vec![ReapRequest::new(&id, StopReason::MaxDuration)]);
    }

    #[tokio::test]
    async fn stopping_labs_are_not_reenqueued() {
        let f = fixture();
        let id = running_lab(&f.registry).await;
        f.registry
            .backdate(&id, chrono::Duration::seconds(601), None)
            .await;
        f.registry
            .transition(&id, &[LabStatus::Running], LabStatus::Stopping, None)
            .await
            .unwrap();
        assert!(f.monitor.scan_once(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn warning_is_broadcast_once_per_deadline() {
        let f = fixture();
        let mut events = f.registry.subscribe();
        let id = running_lab(&f.registry).await;
        f.registry
            .backdate(&id, chrono::Duration::seconds(55), None)
            .await;

        let now = Utc::now();
        assert!(f.monitor.scan_once(now).await.is_empty());
        assert!(f.monitor.scan_once(now).await.is_empty());

        let mut warnings = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let LabEvent::TimeoutWarning { deadline, .. } = event {
                warnings.push(deadline);
            }
        }
        assert_eq!(warnings, vec![DEADLINE_INACTIVITY]);
    }

    #[tokio::test]
    async fn dead_containers_are_reported() {
        use crate::controller::runtime::{ContainerRuntime, ContainerSpec};
        let f = fixture();
        let id = running_lab(&f.registry).await;
        let spec = ContainerSpec {
            image: "img".into(),
            name: "c".into(),
            hostname: "h".into(),
            user: None,
            working_dir: "/workspace".into(),
            env: Default::default(),
            labels: Default::default(),
            port_bindings: vec![],
            volumes: vec![],
            cpu_limit: 1.0,
            memory_limit: 1 << 30,
            network: None,
        };
        let cid = f.runtime.create_container(&spec).await.unwrap();
        f.runtime.start_container(&cid).await.unwrap();
        f.registry.set_container_id(&id, &cid).await.unwrap();
        assert!(f.monitor.check_health().await.is_empty());

        f.runtime.kill(&cid);
        assert_eq!(
            f.monitor.check_health().await,
            vec![ReapRequest::new(&id, StopReason::ContainerExited)]
        );
    }
}
