use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;

use labenv::controller;
use labenv::shared::config::{ImageCatalog, OrchestratorConfig};
use labenv::shared::logging::init_service_logging;
use labenv::shared::models::constants::CONTAINER_WORKSPACE_PATH;
use labenv::shared::models::parse_memory_limit;

#[derive(Parser, Debug)]
#[command(name = "labenv-controller", version, about = "Per-student lab environment orchestrator")]
struct Args {
    #[arg(long, env = "LAB_INACTIVITY_TIMEOUT_SECONDS", default_value_t = 1800)]
    inactivity_timeout_seconds: u64,

    #[arg(long, env = "LAB_MAX_DURATION_SECONDS", default_value_t = 14400)]
    max_duration_seconds: u64,

    #[arg(long, env = "LAB_TIMEOUT_WARNING_SECONDS", default_value_t = 300)]
    timeout_warning_seconds: u64,

    #[arg(long, env = "LAB_MONITOR_INTERVAL_SECONDS", default_value_t = 10)]
    monitor_interval_seconds: u64,

    /// Check container liveness every N monitor ticks (0 disables)
    #[arg(long, env = "LAB_HEALTH_CHECK_EVERY", default_value_t = 3)]
    health_check_every: u32,

    #[arg(long, env = "LAB_START_TIMEOUT_SECONDS", default_value_t = 120)]
    start_timeout_seconds: u64,

    #[arg(long, env = "LAB_STOP_GRACE_SECONDS", default_value_t = 10)]
    stop_grace_seconds: u64,

    #[arg(long, env = "LAB_RUNTIME_RETRIES", default_value_t = 3)]
    runtime_retries: u32,

    #[arg(long, env = "LAB_CLEANUP_MAX_RETRIES", default_value_t = 3)]
    cleanup_max_retries: u32,

    #[arg(long, env = "LAB_REAPER_WORKERS", default_value_t = 2)]
    reaper_workers: usize,

    #[arg(long, env = "LAB_PORT_RANGE_START", default_value_t = 20000)]
    port_range_start: u16,

    #[arg(long, env = "LAB_PORT_RANGE_END", default_value_t = 20999)]
    port_range_end: u16,

    #[arg(long, env = "LAB_DEFAULT_CPU_LIMIT", default_value_t = 1.0)]
    default_cpu_limit: f64,

    /// Bytes or a size such as "512m" / "2g"
    #[arg(long, env = "LAB_DEFAULT_MEMORY_LIMIT", default_value = "2g")]
    default_memory_limit: String,

    #[arg(long, env = "LAB_MAX_CONCURRENT_PROVISIONING", default_value_t = 8)]
    max_concurrent_provisioning: usize,

    #[arg(long, env = "LAB_PUBLIC_HOST", default_value = "localhost")]
    public_host: String,

    #[arg(long, env = "LAB_READINESS_HOST", default_value = "127.0.0.1")]
    readiness_host: String,

    #[arg(long, env = "LAB_WORKSPACE_ROOT", default_value = "/var/lib/labenv/workspaces")]
    workspace_root: PathBuf,

    /// Owner for workspace files, matching the container user
    #[arg(long, env = "LAB_WORKSPACE_UID")]
    workspace_uid: Option<u32>,

    /// Defaults to the uid
    #[arg(long, env = "LAB_WORKSPACE_GID", requires = "workspace_uid")]
    workspace_gid: Option<u32>,

    #[arg(long, env = "LAB_NETWORK")]
    network: Option<String>,

    /// JSON file of the form {"images": {"python": "registry/python:3.12"}}
    #[arg(long, env = "LAB_IMAGES_PATH")]
    images_path: Option<PathBuf>,

    #[arg(long, env = "LAB_BIND_ADDR", default_value = "0.0.0.0:9400")]
    bind_addr: String,

    #[arg(long, env = "LAB_LOG_DIR", default_value = "/var/log/labenv")]
    log_dir: String,
}

impl Args {
    fn into_config(self) -> Result<OrchestratorConfig> {
        let default_memory_limit = parse_memory_limit(&self.default_memory_limit).ok_or_else(|| {
            anyhow!(
                "Invalid LAB_DEFAULT_MEMORY_LIMIT '{}'",
                self.default_memory_limit
            )
        })?;
        let images = match &self.images_path {
            Some(path) => ImageCatalog::load_from_path(path)?,
            None => ImageCatalog::default(),
        };

        let config = OrchestratorConfig {
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_seconds),
            max_duration: Duration::from_secs(self.max_duration_seconds),
            timeout_warning: Duration::from_secs(self.timeout_warning_seconds),
            monitor_interval: Duration::from_secs(self.monitor_interval_seconds),
            health_check_every: self.health_check_every,
            start_timeout: Duration::from_secs(self.start_timeout_seconds),
            stop_grace_period: Duration::from_secs(self.stop_grace_seconds),
            runtime_retries: self.runtime_retries,
            cleanup_max_retries: self.cleanup_max_retries,
            reaper_workers: self.reaper_workers,
            port_range_start: self.port_range_start,
            port_range_end: self.port_range_end,
            default_cpu_limit: self.default_cpu_limit,
            default_memory_limit,
            max_concurrent_provisioning: self.max_concurrent_provisioning,
            public_host: self.public_host,
            readiness_host: self.readiness_host,
            workspace_root: self.workspace_root,
            container_workspace_path: CONTAINER_WORKSPACE_PATH.to_string(),
            workspace_owner: self
                .workspace_uid
                .map(|uid| (uid, self.workspace_gid.unwrap_or(uid))),
            network: self.network,
            images,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize service logging
    let _logging = init_service_logging(&args.log_dir, "labenv-controller")?;

    let bind_addr = args.bind_addr.clone();
    let config = args.into_config()?;

    controller::run(config, &bind_addr).await
}
