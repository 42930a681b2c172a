pub mod config;
pub mod errors;
pub mod model;
pub mod plan;

pub use config::{EngineConfig, ResumeMode, SshConfig};
pub use errors::{ConfigError, PlanError};
pub use model::{
    Case, Control, CrashReportMap, Definition, EventKind, EventSpec, GetFile, RunContext, Set,
    Step, StepGroup, Suite, Verdict, REMOTE_FAIL, UUID_DASH_REPLACEMENT,
};
pub use plan::{PlanEvent, PlanReader, YamlPlanReader};
