pub mod constants;
pub mod lab;
pub mod state_helpers;

pub use lab::{
    container_name_for, parse_memory_limit, ActivityKind, IdeType, LabActivity, LabConfig,
    LabConfigRequest, LabEnvironment, LabMetrics, LabStatus,
};
