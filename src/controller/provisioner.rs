use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use super::runtime::{
    ContainerRuntime, ContainerSpec, ExecOutput, PortBinding, RuntimeError, VolumeBinding,
};
use crate::shared::backoff::{exhausted, retry_transient, Backoff};
use crate::shared::config::OrchestratorConfig;
use crate::shared::error::{LabError, LabResult};
use crate::shared::models::constants::{
    CONTAINER_USER, LABEL_COURSE_ID, LABEL_LAB_ID, LABEL_MANAGED, LABEL_STUDENT_ID,
};
use crate::shared::models::{IdeType, LabEnvironment};

const RESERVED_ENV_PREFIX: &str = "LAB_";
const PACKAGE_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const READINESS_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Builds lab containers and drives them through the runtime.
pub struct ContainerProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<OrchestratorConfig>,
}

impl ContainerProvisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: Arc<OrchestratorConfig>) -> Self {
        Self { runtime, config }
    }

    /// Translate a lab into a container spec. `ports` pairs each exposed IDE
    /// with its host port.
    pub fn build_spec(
        &self,
        lab: &LabEnvironment,
        ports: &BTreeMap<IdeType, u16>,
        workspace: &Path,
    ) -> LabResult<ContainerSpec> {
        let image = self
            .config
            .images
            .image_for(&lab.config.language)
            .ok_or_else(|| {
                LabError::Validation(format!("unsupported language '{}'", lab.config.language))
            })?
            .to_string();

        let ides = lab.config.ides();
        let mut port_bindings = Vec::with_capacity(ides.len());
        for ide in &ides {
            let host_port = *ports.get(ide).ok_or_else(|| {
                LabError::Validation(format!("no host port allocated for {}", ide))
            })?;
            port_bindings.push(PortBinding {
                ide: *ide,
                container_port: ide.container_port(),
                host_port,
            });
        }

        let config_json = serde_json::to_string(&lab.config)
            .map_err(|e| LabError::Validation(format!("cannot serialize lab config: {}", e)))?;
        let ide_names: Vec<&str> = ides.iter().map(IdeType::as_str).collect();

        let mut env = BTreeMap::new();
        for (key, value) in &lab.config.environment_vars {
            if key.starts_with(RESERVED_ENV_PREFIX) {
                info!(
                    "Skipping user-provided {} for lab {}, name is reserved",
                    key, lab.id
                );
                continue;
            }
            env.insert(key.clone(), value.clone());
        }
        env.insert("LAB_ID".into(), lab.id.clone());
        env.insert("LAB_STUDENT_ID".into(), lab.student_id.clone());
        env.insert("LAB_COURSE_ID".into(), lab.course_id.clone());
        env.insert("LAB_LANGUAGE".into(), lab.config.language.clone());
        env.insert("LAB_IDES".into(), ide_names.join(","));
        env.insert(
            "LAB_WORKSPACE".into(),
            self.config.container_workspace_path.clone(),
        );
        env.insert("LAB_CONFIG".into(), config_json);

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_LAB_ID.to_string(), lab.id.clone());
        labels.insert(LABEL_STUDENT_ID.to_string(), lab.student_id.clone());
        labels.insert(LABEL_COURSE_ID.to_string(), lab.course_id.clone());

        let short_id: String = lab.id.chars().take(8).collect();
        Ok(ContainerSpec {
            image,
            name: lab.container_name.clone(),
            hostname: format!("lab-{}", short_id),
            user: Some(CONTAINER_USER.to_string()),
            working_dir: self.config.container_workspace_path.clone(),
            env,
            labels,
            port_bindings,
            volumes: vec![VolumeBinding {
                host_path: workspace.to_path_buf(),
                container_path: self.config.container_workspace_path.clone(),
                read_only: false,
            }],
            cpu_limit: lab.config.cpu_limit,
            memory_limit: lab.config.memory_limit,
            network: self.config.network.clone(),
        })
    }

    /// Create and start the container, wait for every IDE port to accept
    /// connections, then install requested packages.
    ///
    /// On readiness timeout the container is removed before the error is
    /// returned. Releasing ports is left to the caller, who owns them.
    pub async fn start(
        &self,
        lab: &LabEnvironment,
        ports: &BTreeMap<IdeType, u16>,
        workspace: &Path,
    ) -> LabResult<String> {
        let spec = self.build_spec(lab, ports, workspace)?;
        let attempts = self.config.runtime_retries;

        let spec_ref = &spec;
        let container_id = retry_transient("create container", attempts, || async move {
            self.runtime
                .create_container(spec_ref)
                .await
                .map_err(LabError::from)
        })
        .await
        .map_err(|e| exhausted("create container", e))?;

        let id_ref = container_id.as_str();
        let started = retry_transient("start container", attempts, || async move {
            self.runtime
                .start_container(id_ref)
                .await
                .map_err(LabError::from)
        })
        .await;
        if let Err(e) = started {
            error!("Failed to start container {} for lab {}: {}", spec.name, lab.id, e);
            self.discard(&container_id).await;
            return Err(exhausted("start container", e));
        }

        let host_ports: Vec<u16> = spec.port_bindings.iter().map(|b| b.host_port).collect();
        if let Err(e) = self.wait_ready(&spec.name, &host_ports).await {
            self.discard(&container_id).await;
            return Err(e);
        }
        info!(
            "Container {} ready for lab {} on ports {:?}",
            spec.name, lab.id, host_ports
        );

        self.install_packages(lab, &container_id).await;
        Ok(container_id)
    }

    async fn wait_ready(&self, container: &str, ports: &[u16]) -> LabResult<()> {
        let deadline = Instant::now() + self.config.start_timeout;
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(2));
        let mut pending: Vec<u16> = ports.to_vec();

        loop {
            let mut still_pending = Vec::with_capacity(pending.len());
            for port in pending {
                if !self.is_listening(port).await {
                    still_pending.push(port);
                }
            }
            pending = still_pending;
            if pending.is_empty() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Container {} ports {:?} not accepting after {:?}",
                    container, pending, self.config.start_timeout
                );
                return Err(LabError::ContainerStartTimeout {
                    container: container.to_string(),
                    timeout: self.config.start_timeout,
                });
            }
            let delay = backoff.next_delay().min(deadline - now);
            debug!("Waiting {:?} for {} ports {:?}", delay, container, pending);
            tokio::time::sleep(delay).await;
        }
    }

    async fn is_listening(&self, port: u16) -> bool {
        let addr = (self.config.readiness_host.as_str(), port);
        matches!(
            timeout(READINESS_CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Best effort: failures are logged and never fail the lab.
    async fn install_packages(&self, lab: &LabEnvironment, container_id: &str) {
        let Some(cmd) = install_command(&lab.config.language, &lab.config.packages) else {
            return;
        };
        info!(
            "Installing {} packages for lab {}",
            lab.config.packages.len(),
            lab.id
        );
        let workdir = self.config.container_workspace_path.as_str();
        match timeout(
            PACKAGE_INSTALL_TIMEOUT,
            self.runtime.exec(container_id, cmd, Some(workdir)),
        )
        .await
        {
            Ok(Ok(output)) if output.success() => {
                info!("Packages installed for lab {}", lab.id);
            }
            Ok(Ok(output)) => warn!(
                "Package install for lab {} exited with {}: {}",
                lab.id,
                output.exit_code,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(Err(e)) => warn!("Package install for lab {} failed: {}", lab.id, e),
            Err(_) => warn!(
                "Package install for lab {} timed out after {:?}",
                lab.id, PACKAGE_INSTALL_TIMEOUT
            ),
        }
    }

    /// Graceful stop followed by forced removal. An absent container counts
    /// as stopped.
    pub async fn stop(&self, container_id: &str, grace: Duration) -> LabResult<()> {
        match self.runtime.stop_container(container_id, grace).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match self.runtime.remove_container(container_id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn pause(&self, container_id: &str) -> LabResult<()> {
        Ok(self.runtime.pause_container(container_id).await?)
    }

    pub async fn unpause(&self, container_id: &str) -> LabResult<()> {
        Ok(self.runtime.unpause_container(container_id).await?)
    }

    pub async fn exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        limit: Duration,
    ) -> LabResult<ExecOutput> {
        let workdir = self.config.container_workspace_path.as_str();
        match timeout(limit, self.runtime.exec(container_id, cmd, Some(workdir))).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RuntimeError::Timeout(format!(
                "command in {} exceeded {:?}",
                container_id, limit
            ))
            .into()),
        }
    }

    pub async fn is_running(&self, container_id: &str) -> LabResult<bool> {
        Ok(self.runtime.is_running(container_id).await?)
    }

    /// Remove managed containers whose lab id is not in `known`.
    pub async fn remove_orphans(&self, known: &[String]) -> LabResult<usize> {
        let mut removed = 0;
        for container in self.runtime.list_managed().await? {
            let is_known = container
                .lab_id
                .as_ref()
                .map(|id| known.contains(id))
                .unwrap_or(false);
            if is_known {
                continue;
            }
            warn!(
                "Removing orphaned lab container {} ({})",
                container.name, container.id
            );
            match self.runtime.remove_container(&container.id).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => removed += 1,
                Err(e) => error!("Failed to remove orphan {}: {}", container.name, e),
            }
        }
        Ok(removed)
    }

    async fn discard(&self, container_id: &str) {
        if let Err(e) = self.runtime.remove_container(container_id).await {
            if !matches!(e, RuntimeError::NotFound(_)) {
                error!("Failed to remove container {} after failed start: {}", container_id, e);
            }
        }
    }
}

/// Package manager invocation for a language, or None when nothing to do.
pub fn install_command(language: &str, packages: &[String]) -> Option<Vec<String>> {
    if packages.is_empty() {
        return None;
    }
    let mut cmd: Vec<String> = match language {
        "python" => vec!["pip", "install", "--user", "--no-input"],
        "javascript" | "typescript" => vec!["npm", "install", "--no-audit", "--no-fund"],
        "go" => vec!["go", "get"],
        "rust" => vec!["cargo", "install"],
        _ => return None,
    }
    .into_iter()
    .map(str::to_string)
    .collect();
    cmd.extend(packages.iter().cloned());
    Some(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::runtime::fake::FakeRuntime;
    use crate::shared::config::ImageCatalog;
    use crate::shared::models::{LabConfig, LabConfigRequest};

    fn config() -> Arc<OrchestratorConfig> {
        Arc::new(OrchestratorConfig {
            start_timeout: Duration::from_millis(400),
            ..Default::default()
        })
    }

    fn lab(req: LabConfigRequest) -> LabEnvironment {
        let cfg = LabConfig::from_request(req, 1.0, 1 << 30, &ImageCatalog::default()).unwrap();
        LabEnvironment::new("5f0c2a8e-aaaa".into(), "alice".into(), "cs101".into(), cfg)
    }

    fn python() -> LabConfigRequest {
        LabConfigRequest {
            language: "python".into(),
            ..Default::default()
        }
    }

    fn ports(pairs: &[(IdeType, u16)]) -> BTreeMap<IdeType, u16> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn spec_injects_identity_and_skips_reserved_env() {
        let runtime = Arc::new(FakeRuntime::new());
        let provisioner = ContainerProvisioner::new(runtime, config());
        let mut req = python();
        req.environment_vars.insert("LAB_ID".into(), "spoofed".into());
        req.environment_vars.insert("DEBUG".into(), "1".into());
        let lab = lab(req);

        let spec = provisioner
            .build_spec(&lab, &ports(&[(IdeType::Vscode, 24001)]), Path::new("/ws/x"))
            .unwrap();
        assert_eq!(spec.image, "labenv/python:3.11");
        assert_eq!(spec.env["LAB_ID"], lab.id);
        assert_eq!(spec.env["DEBUG"], "1");
        assert_eq!(spec.env["LAB_IDES"], "vscode");
        let cfg: LabConfig = serde_json::from_str(&spec.env["LAB_CONFIG"]).unwrap();
        assert_eq!(cfg, lab.config);
        assert_eq!(spec.labels[LABEL_MANAGED], "true");
        assert_eq!(spec.port_bindings.len(), 1);
        assert_eq!(spec.port_bindings[0].container_port, 8080);
        assert_eq!(spec.volumes[0].container_path, "/workspace");
    }

    #[test]
    fn multi_ide_spec_binds_every_ide() {
        let provisioner = ContainerProvisioner::new(Arc::new(FakeRuntime::new()), config());
        let mut req = python();
        req.enable_multi_ide = true;
        let lab = lab(req);
        let spec = provisioner
            .build_spec(
                &lab,
                &ports(&[
                    (IdeType::Vscode, 24001),
                    (IdeType::Jupyter, 24002),
                    (IdeType::Terminal, 24003),
                ]),
                Path::new("/ws/x"),
            )
            .unwrap();
        let bound: Vec<(u16, u16)> = spec
            .port_bindings
            .iter()
            .map(|b| (b.container_port, b.host_port))
            .collect();
        assert_eq!(bound, vec![(8080, 24001), (8888, 24002), (7681, 24003)]);
    }

    #[tokio::test]
    async fn start_waits_for_ports_and_survives_install_failure() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_installs(true);
        let provisioner = ContainerProvisioner::new(runtime.clone(), config());
        let mut req = python();
        req.packages = vec!["numpy".into()];
        let lab = lab(req);

        let id = provisioner
            .start(&lab, &ports(&[(IdeType::Vscode, 24011)]), Path::new("/ws/x"))
            .await
            .unwrap();
        assert_eq!(runtime.running_container_ids(), vec![id]);
        assert!(runtime.execs().iter().any(|c| c.contains(&"numpy".to_string())));
    }

    #[tokio::test]
    async fn start_timeout_removes_container() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_listen(false);
        let provisioner = ContainerProvisioner::new(runtime.clone(), config());
        let err = provisioner
            .start(&lab(python()), &ports(&[(IdeType::Vscode, 24021)]), Path::new("/ws/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::ContainerStartTimeout { .. }));
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn transient_create_failures_are_retried() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_next_creates(2);
        let provisioner = ContainerProvisioner::new(runtime.clone(), config());
        provisioner
            .start(&lab(python()), &ports(&[(IdeType::Vscode, 24031)]), Path::new("/ws/x"))
            .await
            .unwrap();
        assert_eq!(runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let runtime = Arc::new(FakeRuntime::new());
        let provisioner = ContainerProvisioner::new(runtime.clone(), config());
        let id = provisioner
            .start(&lab(python()), &ports(&[(IdeType::Vscode, 24041)]), Path::new("/ws/x"))
            .await
            .unwrap();
        provisioner.stop(&id, Duration::from_secs(1)).await.unwrap();
        provisioner.stop(&id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn orphans_are_removed_and_known_labs_kept() {
        let runtime = Arc::new(FakeRuntime::new());
        let provisioner = ContainerProvisioner::new(runtime.clone(), config());
        runtime.insert_orphan("labenv-old-1", "lab-old");
        runtime.insert_orphan("labenv-live-1", "lab-live");
        let removed = provisioner
            .remove_orphans(&["lab-live".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(runtime.container_count(), 1);
    }

    #[test]
    fn install_commands_per_language() {
        let pkgs = vec!["requests".to_string()];
        assert_eq!(
            install_command("python", &pkgs).unwrap()[..2],
            ["pip".to_string(), "install".to_string()]
        );
        assert_eq!(install_command("java", &pkgs), None);
        assert_eq!(install_command("python", &[]), None);
    }
}
