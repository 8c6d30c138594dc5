use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::constants::*;
use crate::shared::config::ImageCatalog;
use crate::shared::error::{LabError, LabResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LabStatus {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Paused,
}

impl LabStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabStatus::Creating => "CREATING",
            LabStatus::Starting => "STARTING",
            LabStatus::Running => "RUNNING",
            LabStatus::Stopping => "STOPPING",
            LabStatus::Stopped => "STOPPED",
            LabStatus::Error => "ERROR",
            LabStatus::Paused => "PAUSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LabStatus::Stopped | LabStatus::Error)
    }
}

impl fmt::Display for LabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdeType {
    Vscode,
    Jupyter,
    Terminal,
}

impl IdeType {
    pub const ALL: [IdeType; 3] = [IdeType::Vscode, IdeType::Jupyter, IdeType::Terminal];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdeType::Vscode => "vscode",
            IdeType::Jupyter => "jupyter",
            IdeType::Terminal => "terminal",
        }
    }

    pub fn container_port(&self) -> u16 {
        match self {
            IdeType::Vscode => VSCODE_CONTAINER_PORT,
            IdeType::Jupyter => JUPYTER_CONTAINER_PORT,
            IdeType::Terminal => TERMINAL_CONTAINER_PORT,
        }
    }
}

impl fmt::Display for IdeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdeType {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vscode" | "code" | "code-server" => Ok(IdeType::Vscode),
            "jupyter" | "notebook" | "jupyterlab" => Ok(IdeType::Jupyter),
            "terminal" | "shell" => Ok(IdeType::Terminal),
            other => Err(LabError::Validation(format!("unknown ide_type '{}'", other))),
        }
    }
}

/// Raw lab configuration as received at the API boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabConfigRequest {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub ide_type: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub environment_vars: HashMap<String, String>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_memory_limit")]
    pub memory_limit: Option<u64>,
    #[serde(default)]
    pub enable_multi_ide: bool,
}

/// Validated, immutable configuration of one lab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabConfig {
    pub language: String,
    pub ide_type: IdeType,
    pub packages: Vec<String>,
    pub environment_vars: BTreeMap<String, String>,
    pub cpu_limit: f64,
    /// Bytes.
    pub memory_limit: u64,
    pub enable_multi_ide: bool,
}

static PACKAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9@][A-Za-z0-9._\-/@\[\]]*((==|>=|<=|~=|@|=)[A-Za-z0-9._\-*+^~]+)?$")
        .expect("package pattern compiles")
});

static ENV_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key pattern compiles"));

impl LabConfig {
    pub fn from_request(
        req: LabConfigRequest,
        default_cpu: f64,
        default_memory: u64,
        images: &ImageCatalog,
    ) -> LabResult<Self> {
        let language = req.language.trim().to_ascii_lowercase();
        if language.is_empty() {
            return Err(LabError::Validation("language is required".into()));
        }
        if images.image_for(&language).is_none() {
            let supported: Vec<&str> = images.languages().collect();
            return Err(LabError::Validation(format!(
                "unsupported language '{}' (supported: {})",
                language,
                supported.join(", ")
            )));
        }

        let ide_type = match req.ide_type.as_deref() {
            Some(raw) if !raw.trim().is_empty() => raw.parse()?,
            _ => IdeType::Vscode,
        };

        let mut packages = Vec::with_capacity(req.packages.len());
        for pkg in req.packages {
            let pkg = pkg.trim().to_string();
            if pkg.is_empty() {
                continue;
            }
            if pkg.len() > 214 || !PACKAGE_RE.is_match(&pkg) {
                return Err(LabError::Validation(format!("invalid package name '{}'", pkg)));
            }
            if !packages.contains(&pkg) {
                packages.push(pkg);
            }
        }

        let mut environment_vars = BTreeMap::new();
        for (key, value) in req.environment_vars {
            if !ENV_KEY_RE.is_match(&key) {
                return Err(LabError::Validation(format!(
                    "invalid environment variable name '{}'",
                    key
                )));
            }
            if value.contains('\0') {
                return Err(LabError::Validation(format!(
                    "environment variable '{}' contains a NUL byte",
                    key
                )));
            }
            environment_vars.insert(key, value);
        }

        let cpu_limit = req.cpu_limit.unwrap_or(default_cpu);
        if !cpu_limit.is_finite() || cpu_limit <= 0.0 || cpu_limit > MAX_CPU_LIMIT {
            return Err(LabError::Validation(format!(
                "cpu_limit must be in (0, {}], got {}",
                MAX_CPU_LIMIT, cpu_limit
            )));
        }

        let memory_limit = req.memory_limit.unwrap_or(default_memory);
        if memory_limit < MIN_MEMORY_LIMIT {
            return Err(LabError::Validation(format!(
                "memory_limit must be at least {} bytes, got {}",
                MIN_MEMORY_LIMIT, memory_limit
            )));
        }

        Ok(Self {
            language,
            ide_type,
            packages,
            environment_vars,
            cpu_limit,
            memory_limit,
            enable_multi_ide: req.enable_multi_ide,
        })
    }

    /// IDEs exposed by the lab, requested IDE first.
    pub fn ides(&self) -> Vec<IdeType> {
        let mut ides = vec![self.ide_type];
        if self.enable_multi_ide {
            ides.extend(IdeType::ALL.iter().copied().filter(|i| *i != self.ide_type));
        }
        ides
    }
}

/// Parse "536870912", "512m", "2g", "1024k" (optionally with a trailing "b").
pub fn parse_memory_limit(raw: &str) -> Option<u64> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let multiplier: u64 = match unit {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

fn deserialize_memory_limit<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{Error, Visitor};

    struct MemoryLimitVisitor;

    impl<'de> Visitor<'de> for MemoryLimitVisitor {
        type Value = Option<u64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a byte count, a size string like \"512m\", or null")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: Error,
        {
            Ok(Some(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: Error,
        {
            u64::try_from(value)
                .map(Some)
                .map_err(|_| E::custom("memory_limit must not be negative"))
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: Error,
        {
            parse_memory_limit(value)
                .map(Some)
                .ok_or_else(|| E::custom(format!("invalid memory_limit '{}'", value)))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(MemoryLimitVisitor)
}

/// Per-session activity recorded by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabActivity {
    pub files_read: u64,
    pub files_written: u64,
    pub commands_run: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    FileRead,
    FileWrite,
    Listing,
    Command,
}

/// Summary written once when a lab reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabMetrics {
    pub duration_seconds: i64,
    pub files_read: u64,
    pub files_written: u64,
    pub commands_run: u64,
    pub final_status: LabStatus,
    pub stop_reason: Option<String>,
    pub finalized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabEnvironment {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub container_name: String,
    pub container_id: Option<String>,
    pub status: LabStatus,
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub config: LabConfig,
    pub ports: BTreeMap<IdeType, u16>,
    pub ide_urls: BTreeMap<IdeType, String>,
    pub persistent_storage_path: Option<PathBuf>,
    #[serde(default)]
    pub stop_requested: bool,
    #[serde(default)]
    pub activity: LabActivity,
    pub metrics: Option<LabMetrics>,
}

impl LabEnvironment {
    pub fn new(id: String, student_id: String, course_id: String, config: LabConfig) -> Self {
        let now = Utc::now();
        let container_name = container_name_for(&id, &student_id, &course_id);
        Self {
            id,
            student_id,
            course_id,
            container_name,
            container_id: None,
            status: LabStatus::Creating,
            status_message: None,
            created_at: now,
            updated_at: now,
            last_accessed: None,
            config,
            ports: BTreeMap::new(),
            ide_urls: BTreeMap::new(),
            persistent_storage_path: None,
            stop_requested: false,
            activity: LabActivity::default(),
            metrics: None,
        }
    }

    /// Time since the last gateway interaction (or since creation).
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_accessed.unwrap_or(self.created_at)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    pub fn host_ports(&self) -> Vec<u16> {
        self.ports.values().copied().collect()
    }
}

/// Deterministic container name: `labenv-<student>-<course>-<lab id prefix>`.
pub fn container_name_for(lab_id: &str, student_id: &str, course_id: &str) -> String {
    fn clean(raw: &str, max: usize) -> String {
        let cleaned: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .take(max)
            .collect();
        if cleaned.is_empty() {
            "x".to_string()
        } else {
            cleaned
        }
    }
    let short_id: String = lab_id.chars().filter(|c| *c != '-').take(12).collect();
    format!(
        "{}-{}-{}-{}",
        CONTAINER_NAME_PREFIX,
        clean(student_id, 24),
        clean(course_id, 24),
        clean(&short_id, 12)
    )
}
