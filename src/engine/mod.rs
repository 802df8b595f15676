pub mod context;
pub mod dag;
pub mod orchestrator;
pub mod types;

pub use context::{OrchestratorConfig, RuntimeContext};
pub use dag::StepEdit;
pub use orchestrator::Orchestrator;
