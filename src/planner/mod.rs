pub mod static_plan;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::StepSpec;

pub use static_plan::StaticPlanner;

/// Turns a goal into an ordered list of steps. The result is validated by
/// the orchestrator before anything runs.
#[async_trait]
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    async fn plan(&self, goal: &str) -> Result<Vec<StepSpec>>;
}

/// Plans every goal as one step handled by a single agent kind.
pub struct SingleStepPlanner {
    agent_kind: String,
}

impl SingleStepPlanner {
    pub fn new(agent_kind: &str) -> Self {
        Self {
            agent_kind: agent_kind.to_string(),
        }
    }
}

#[async_trait]
impl Planner for SingleStepPlanner {
    fn name(&self) -> &str {
        "single_step"
    }

    async fn plan(&self, goal: &str) -> Result<Vec<StepSpec>> {
        let mut step = StepSpec::new("main", &self.agent_kind, goal);
        step.output_ref = Some("agent_outputs/main_output.md".to_string());
        Ok(vec![step])
    }
}
