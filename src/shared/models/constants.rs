// In-container layout
pub const CONTAINER_WORKSPACE_PATH: &str = "/workspace";
pub const CONTAINER_USER: &str = "student";

// IDE ports inside the sandbox image
pub const VSCODE_CONTAINER_PORT: u16 = 8080;
pub const JUPYTER_CONTAINER_PORT: u16 = 8888;
pub const TERMINAL_CONTAINER_PORT: u16 = 7681;

// Container labels
pub const LABEL_MANAGED: &str = "labenv.managed";
pub const LABEL_LAB_ID: &str = "labenv.lab_id";
pub const LABEL_STUDENT_ID: &str = "labenv.student_id";
pub const LABEL_COURSE_ID: &str = "labenv.course_id";

pub const CONTAINER_NAME_PREFIX: &str = "labenv";

// Resource bounds accepted from lab configs
pub const MAX_CPU_LIMIT: f64 = 16.0;
pub const MIN_MEMORY_LIMIT: u64 = 64 * 1024 * 1024;

// Reads through the gateway are capped at 25MB
pub const MAX_FILE_READ_BYTES: u64 = 25 * 1024 * 1024;
