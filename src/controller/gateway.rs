use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::provisioner::ContainerProvisioner;
use super::registry::SessionRegistry;
use super::workspace::WorkspaceFileManager;
use crate::shared::error::{LabError, LabResult};
use crate::shared::models::{ActivityKind, IdeType, LabEnvironment, LabStatus};

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;
const MAX_COMMAND_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayAction {
    WriteFile,
    ReadFile,
    GetWorkspace,
    RunCommand,
}

impl GatewayAction {
    fn activity(&self) -> ActivityKind {
        match self {
            GatewayAction::WriteFile => ActivityKind::FileWrite,
            GatewayAction::ReadFile => ActivityKind::FileRead,
            GatewayAction::GetWorkspace => ActivityKind::Listing,
            GatewayAction::RunCommand => ActivityKind::Command,
        }
    }
}

impl FromStr for GatewayAction {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "write_file" => Ok(GatewayAction::WriteFile),
            "read_file" => Ok(GatewayAction::ReadFile),
            "get_workspace" => Ok(GatewayAction::GetWorkspace),
            "run_command" => Ok(GatewayAction::RunCommand),
            other => Err(LabError::UnsupportedAction(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WriteFilePayload {
    path: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    content_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReadFilePayload {
    path: String,
}

#[derive(Debug, Default, Deserialize)]
struct GetWorkspacePayload {
    #[serde(default)]
    prefix: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Argv(Vec<String>),
    Shell(String),
}

#[derive(Debug, Deserialize)]
struct RunCommandPayload {
    command: CommandSpec,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

/// Routes IDE actions to the workspace or the container exec channel.
pub struct IdeGateway {
    registry: Arc<SessionRegistry>,
    files: Arc<WorkspaceFileManager>,
    provisioner: Arc<ContainerProvisioner>,
}

impl IdeGateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        files: Arc<WorkspaceFileManager>,
        provisioner: Arc<ContainerProvisioner>,
    ) -> Self {
        Self {
            registry,
            files,
            provisioner,
        }
    }

    pub async fn dispatch(
        &self,
        lab_id: &str,
        ide_type: &str,
        action: &str,
        payload: Value,
    ) -> LabResult<Value> {
        let action: GatewayAction = action.parse()?;
        let ide: IdeType = ide_type.parse()?;

        let lab = self.registry.get(lab_id).await?;
        if lab.status != LabStatus::Running {
            return Err(LabError::SessionNotReady {
                id: lab_id.to_string(),
                status: lab.status,
            });
        }
        if !lab.config.ides().contains(&ide) {
            return Err(LabError::Validation(format!(
                "lab {} does not expose {}",
                lab_id, ide
            )));
        }
        let lab = self.registry.touch(lab_id).await?;
        debug!("Lab {} {} via {}", lab_id, action_name(action), ide);

        let result = self.perform(action, lab, payload).await?;
        self.registry.record_activity(lab_id, action.activity()).await?;
        Ok(result)
    }

    async fn perform(
        &self,
        action: GatewayAction,
        lab: LabEnvironment,
        payload: Value,
    ) -> LabResult<Value> {
        let lab_id = lab.id.as_str();
        match action {
            GatewayAction::WriteFile => {
                let req: WriteFilePayload = parse_payload(payload)?;
                let data = match (req.content, req.content_base64) {
                    (_, Some(encoded)) => BASE64_STANDARD.decode(encoded.trim()).map_err(|e| {
                        LabError::Validation(format!("content_base64 is not valid base64: {}", e))
                    })?,
                    (Some(text), None) => text.into_bytes(),
                    (None, None) => Vec::new(),
                };
                self.files.write(lab_id, &req.path, &data).await?;
                Ok(json!({ "path": req.path, "bytes_written": data.len() }))
            }
            GatewayAction::ReadFile => {
                let req: ReadFilePayload = parse_payload(payload)?;
                let data = self.files.read(lab_id, &req.path).await?;
                let content_type = guess_content_type(&req.path);
                Ok(json!({
                    "path": req.path,
                    "content_base64": BASE64_STANDARD.encode(&data),
                    "content_type": content_type,
                    "size": data.len(),
                }))
            }
            GatewayAction::GetWorkspace => {
                let req: GetWorkspacePayload = if payload.is_null() {
                    GetWorkspacePayload::default()
                } else {
                    parse_payload(payload)?
                };
                let files = self.files.list(lab_id, &req.prefix).await?;
                Ok(json!({ "prefix": req.prefix, "files": files }))
            }
            GatewayAction::RunCommand => {
                let req: RunCommandPayload = parse_payload(payload)?;
                let cmd = match req.command {
                    CommandSpec::Argv(argv) if !argv.is_empty() && !argv[0].is_empty() => argv,
                    CommandSpec::Shell(line) if !line.trim().is_empty() => {
                        vec!["/bin/sh".to_string(), "-c".to_string(), line]
                    }
                    _ => return Err(LabError::Validation("command must not be empty".into())),
                };
                let secs = match req.timeout_seconds {
                    Some(0) => {
                        return Err(LabError::Validation(
                            "timeout_seconds must be at least 1".into(),
                        ))
                    }
                    Some(secs) => secs.min(MAX_COMMAND_TIMEOUT_SECS),
                    None => DEFAULT_COMMAND_TIMEOUT_SECS,
                };
                let container_id = lab.container_id.ok_or_else(|| LabError::SessionNotReady {
                    id: lab_id.to_string(),
                    status: lab.status,
                })?;

                info!("Lab {} running {:?}", lab_id, cmd);
                let output = self
                    .provisioner
                    .exec(&container_id, cmd, Duration::from_secs(secs))
                    .await?;
                Ok(json!({
                    "exit_code": output.exit_code,
                    "stdout": String::from_utf8_lossy(&output.stdout),
                    "stderr": String::from_utf8_lossy(&output.stderr),
                }))
            }
        }
    }
}

fn action_name(action: GatewayAction) -> &'static str {
    match action {
        GatewayAction::WriteFile => "write_file",
        GatewayAction::ReadFile => "read_file",
        GatewayAction::GetWorkspace => "get_workspace",
        GatewayAction::RunCommand => "run_command",
    }
}

fn parse_payload<T: DeserializeOwned>(payload: Value) -> LabResult<T> {
    serde_json::from_value(payload)
        .map_err(|e| LabError::Validation(format!("invalid payload: {}", e)))
}

pub fn guess_content_type(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    let ext = lower.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript",
        "json" => "application/json",
        "ipynb" => "application/x-ipynb+json",
        "md" | "txt" | "rs" | "py" | "ts" | "sh" | "yml" | "yaml" | "toml" | "java" | "c"
        | "h" | "cpp" | "hpp" | "go" | "csv" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::runtime::fake::FakeRuntime;
    use crate::controller::runtime::{ContainerRuntime, ContainerSpec};
    use crate::shared::config::{ImageCatalog, OrchestratorConfig};
    use crate::shared::models::{LabConfig, LabConfigRequest};

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<SessionRegistry>,
        runtime: Arc<FakeRuntime>,
        gateway: IdeGateway,
        lab_id: String,
    }

    async fn fixture(multi_ide: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let runtime = Arc::new(FakeRuntime::new());
        let config = Arc::new(OrchestratorConfig::default());
        let files = Arc::new(WorkspaceFileManager::new(
            registry.clone(),
            dir.path().to_path_buf(),
            "/workspace".into(),
        ));
        let provisioner = Arc::new(ContainerProvisioner::new(runtime.clone(), config));

        let req = LabConfigRequest {
            language: "python".into(),
            enable_multi_ide: multi_ide,
            ..Default::default()
        };
        let cfg = LabConfig::from_request(req, 1.0, 1 << 30, &ImageCatalog::default()).unwrap();
        let lab_id = registry.create("alice", "cs101", cfg).await;
        files.prepare(&lab_id).await.unwrap();

        let spec = ContainerSpec {
            image: "labenv/python:3.11".into(),
            name: format!("lab-{}", lab_id),
            hostname: "lab".into(),
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
        let container_id = runtime.create_container(&spec).await.unwrap();
        runtime.start_container(&container_id).await.unwrap();
        registry.set_container_id(&lab_id, &container_id).await.unwrap();
        registry
            .transition(&lab_id, &[LabStatus::Creating], LabStatus::Starting, None)
            .await
            .unwrap();
        registry
            .transition(&lab_id, &[LabStatus::Starting], LabStatus::Running, None)
            .await
            .unwrap();

        let gateway = IdeGateway::new(registry.clone(), files, provisioner);
        Fixture {
            _dir: dir,
            registry,
            runtime,
            gateway,
            lab_id,
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips_and_touches() {
        let f = fixture(false).await;
        f.gateway
            .dispatch(
                &f.lab_id,
                "vscode",
                "write_file",
                json!({"path": "main.py", "content": "print('hi')\n"}),
            )
            .await
            .unwrap();
        let out = f
            .gateway
            .dispatch(&f.lab_id, "vscode", "read_file", json!({"path": "main.py"}))
            .await
            .unwrap();
        let decoded = BASE64_STANDARD
            .decode(out["content_base64"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"print('hi')\n");
        assert_eq!(out["content_type"], "text/plain; charset=utf-8");
        assert_eq!(out["size"], 12);

        let lab = f.registry.get(&f.lab_id).await.unwrap();
        assert!(lab.last_accessed.is_some());
        assert_eq!(lab.activity.files_written, 1);
        assert_eq!(lab.activity.files_read, 1);
    }

    #[tokio::test]
    async fn rejected_operations_are_not_counted() {
        let f = fixture(false).await;
        let err = f
            .gateway
            .dispatch(
                &f.lab_id,
                "vscode",
                "write_file",
                json!({"path": "../../etc/passwd", "content": "x"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::PathTraversal(_)));
        let err = f
            .gateway
            .dispatch(&f.lab_id, "vscode", "read_file", json!({"path": "missing.py"}))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::FileNotFound(_)));

        let lab = f.registry.get(&f.lab_id).await.unwrap();
        assert!(lab.last_accessed.is_some());
        assert_eq!(lab.activity.files_written, 0);
        assert_eq!(lab.activity.files_read, 0);
    }

    #[tokio::test]
    async fn binary_writes_use_base64() {
        let f = fixture(false).await;
        let blob = vec![0u8, 159, 146, 150, 255];
        f.gateway
            .dispatch(
                &f.lab_id,
                "vscode",
                "write_file",
                json!({"path": "data.bin", "content_base64": BASE64_STANDARD.encode(&blob)}),
            )
            .await
            .unwrap();
        let out = f
            .gateway
            .dispatch(&f.lab_id, "vscode", "read_file", json!({"path": "data.bin"}))
            .await
            .unwrap();
        assert_eq!(
            BASE64_STANDARD
                .decode(out["content_base64"].as_str().unwrap())
                .unwrap(),
            blob
        );
        assert_eq!(out["content_type"], "application/octet-stream");
    }

    #[tokio::test]
    async fn unknown_action_is_unsupported() {
        let f = fixture(false).await;
        let err = f
            .gateway
            .dispatch(&f.lab_id, "vscode", "delete_workspace", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::UnsupportedAction(ref a) if a == "delete_workspace"));
        assert!(f.registry.get(&f.lab_id).await.unwrap().last_accessed.is_none());
    }

    #[tokio::test]
    async fn ide_must_be_exposed_by_the_lab() {
        let f = fixture(false).await;
        let err = f
            .gateway
            .dispatch(&f.lab_id, "jupyter", "get_workspace", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Validation(_)));

        let f = fixture(true).await;
        f.gateway
            .dispatch(&f.lab_id, "jupyter", "get_workspace", Value::Null)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn traversal_through_gateway_is_rejected() {
        let f = fixture(false).await;
        let err = f
            .gateway
            .dispatch(
                &f.lab_id,
                "vscode",
                "write_file",
                json!({"path": "../../etc/passwd", "content": "root::0:0"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::PathTraversal(_)));
    }

    #[tokio::test]
    async fn run_command_accepts_argv_and_shell() {
        let f = fixture(false).await;
        let out = f
            .gateway
            .dispatch(
                &f.lab_id,
                "terminal",
                "run_command",
                json!({"command": ["echo", "hello"]}),
            )
            .await;
        // terminal is not exposed by a vscode-only lab
        assert!(matches!(out, Err(LabError::Validation(_))));

        let out = f
            .gateway
            .dispatch(
                &f.lab_id,
                "vscode",
                "run_command",
                json!({"command": ["echo", "hello"]}),
            )
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 0);
        assert_eq!(out["stdout"], "hello\n");

        f.gateway
            .dispatch(
                &f.lab_id,
                "vscode",
                "run_command",
                json!({"command": "ls -la | wc -l"}),
            )
            .await
            .unwrap();
        let execs = f.runtime.execs();
        assert_eq!(
            execs.last().unwrap(),
            &vec!["/bin/sh".to_string(), "-c".to_string(), "ls -la | wc -l".to_string()]
        );
        assert_eq!(
            f.registry.get(&f.lab_id).await.unwrap().activity.commands_run,
            2
        );
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let f = fixture(false).await;
        let err = f
            .gateway
            .dispatch(
                &f.lab_id,
                "vscode",
                "run_command",
                json!({"command": ["sleep", "5"], "timeout_seconds": 1}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "container_runtime_error");
    }

    #[tokio::test]
    async fn stopped_lab_rejects_actions() {
        let f = fixture(false).await;
        f.registry
            .transition(&f.lab_id, &[LabStatus::Running], LabStatus::Stopping, None)
            .await
            .unwrap();
        let err = f
            .gateway
            .dispatch(&f.lab_id, "vscode", "read_file", json!({"path": "a"}))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::SessionNotReady { .. }));
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(guess_content_type("nb/Analysis.IPYNB"), "application/x-ipynb+json");
        assert_eq!(guess_content_type("index.html"), "text/html; charset=utf-8");
        assert_eq!(guess_content_type("Makefile"), "application/octet-stream");
    }
}
