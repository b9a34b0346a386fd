//! The tool executor (§2 "C5"): a fixed catalog, per-hat access profiles,
//! sandboxed execution, large-output spill, and the quality gate.

pub mod access;
pub mod catalog;
pub mod executor;
pub mod health;
pub mod profiles;
pub mod quality;
pub mod spill;

pub use access::ToolAccessPolicy;
pub use catalog::{ParamDef, ParamType, ToolCatalog, ToolEntry, ToolGroup};
pub use executor::{Executor, ExecutionResult};
pub use health::{HealthConfig, HealthStatus, ToolHealthTracker};
pub use profiles::resolve_tools;
pub use spill::SpillManager;
