use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::shared::models::constants::{CONTAINER_WORKSPACE_PATH, MAX_CPU_LIMIT, MIN_MEMORY_LIMIT};

/// Runtime settings for the orchestrator. Every field has a `LAB_*`
/// environment variable in the controller binary.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub inactivity_timeout: Duration,
    pub max_duration: Duration,
    pub timeout_warning: Duration,
    pub monitor_interval: Duration,
    /// Health-check running containers every N monitor ticks (0 disables).
    pub health_check_every: u32,
    pub start_timeout: Duration,
    pub stop_grace_period: Duration,
    pub runtime_retries: u32,
    pub cleanup_max_retries: u32,
    pub reaper_workers: usize,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub default_cpu_limit: f64,
    pub default_memory_limit: u64,
    pub max_concurrent_provisioning: usize,
    /// Host used to build IDE URLs handed to students.
    pub public_host: String,
    /// Host the readiness check connects to.
    pub readiness_host: String,
    pub workspace_root: PathBuf,
    pub container_workspace_path: String,
    /// uid/gid the container user runs as; workspace entries are chowned
    /// to it. When unset they are made world-writable instead.
    pub workspace_owner: Option<(u32, u32)>,
    pub network: Option<String>,
    pub images: ImageCatalog,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(30 * 60),
            max_duration: Duration::from_secs(4 * 60 * 60),
            timeout_warning: Duration::from_secs(5 * 60),
            monitor_interval: Duration::from_secs(10),
            health_check_every: 3,
            start_timeout: Duration::from_secs(120),
            stop_grace_period: Duration::from_secs(10),
            runtime_retries: 3,
            cleanup_max_retries: 3,
            reaper_workers: 2,
            port_range_start: 20000,
            port_range_end: 20999,
            default_cpu_limit: 1.0,
            default_memory_limit: 2 * 1024 * 1024 * 1024,
            max_concurrent_provisioning: 8,
            public_host: "localhost".to_string(),
            readiness_host: "127.0.0.1".to_string(),
            workspace_root: PathBuf::from("/var/lib/labenv/workspaces"),
            container_workspace_path: CONTAINER_WORKSPACE_PATH.to_string(),
            workspace_owner: None,
            network: None,
            images: ImageCatalog::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(anyhow!(
                "Invalid port range {}-{}",
                self.port_range_start,
                self.port_range_end
            ));
        }
        if self.inactivity_timeout.is_zero() || self.max_duration.is_zero() {
            return Err(anyhow!("Timeouts must be greater than zero"));
        }
        if self.monitor_interval.is_zero() {
            return Err(anyhow!("Monitor interval must be greater than zero"));
        }
        if self.start_timeout.is_zero() {
            return Err(anyhow!("Start timeout must be greater than zero"));
        }
        if self.max_concurrent_provisioning == 0 || self.reaper_workers == 0 {
            return Err(anyhow!(
                "Provisioning concurrency and reaper workers must be at least 1"
            ));
        }
        if !(self.default_cpu_limit > 0.0 && self.default_cpu_limit <= MAX_CPU_LIMIT) {
            return Err(anyhow!(
                "Default CPU limit must be in (0, {}]",
                MAX_CPU_LIMIT
            ));
        }
        if self.default_memory_limit < MIN_MEMORY_LIMIT {
            return Err(anyhow!(
                "Default memory limit must be at least {} bytes",
                MIN_MEMORY_LIMIT
            ));
        }
        if !self.container_workspace_path.starts_with('/') {
            return Err(anyhow!("Container workspace path must be absolute"));
        }
        if self.public_host.trim().is_empty() {
            return Err(anyhow!("Public host must not be empty"));
        }
        Ok(())
    }
}

/// Language to sandbox image mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCatalog {
    images: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ImageCatalogFile {
    #[serde(default)]
    images: BTreeMap<String, String>,
}

impl Default for ImageCatalog {
    fn default() -> Self {
        let images = [
            ("python", "labenv/python:3.11"),
            ("javascript", "labenv/node:20"),
            ("typescript", "labenv/node:20"),
            ("java", "labenv/java:17"),
            ("cpp", "labenv/cpp:13"),
            ("go", "labenv/go:1.22"),
            ("rust", "labenv/rust:1.77"),
        ]
        .into_iter()
        .map(|(lang, image)| (lang.to_string(), image.to_string()))
        .collect();
        Self { images }
    }
}

impl ImageCatalog {
    pub fn image_for(&self, language: &str) -> Option<&str> {
        self.images
            .get(&language.trim().to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }

    /// Load `{"images": {"python": "registry/python:3.12"}}` and merge it over
    /// the built-in defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read image catalog at {}: {}", path.display(), e))?;
        let file: ImageCatalogFile = serde_json::from_str(&data).map_err(|e| {
            anyhow!(
                "Failed to parse image catalog JSON at {}: {}",
                path.display(),
                e
            )
        })?;

        let mut catalog = Self::default();
        for (language, image) in file.images {
            let language = language.trim().to_ascii_lowercase();
            let image = image.trim().to_string();
            if language.is_empty() {
                return Err(anyhow!("Image catalog contains an empty language name"));
            }
            if image.is_empty() {
                return Err(anyhow!(
                    "Image catalog entry '{}' is missing an image",
                    language
                ));
            }
            catalog.images.insert(language, image);
        }
        Ok(catalog)
    }
}
