pub mod backoff;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;

pub use config::{ImageCatalog, OrchestratorConfig};
pub use error::{LabError, LabResult};
