use std::path::Path;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::engine::types::StepSpec;

use super::Planner;

#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(default)]
    name: Option<String>,
    steps: Vec<StepSpec>,
}

/// Planner backed by a fixed YAML plan.
///
/// `{{goal}}` inside a step's `task` is replaced with the goal.
///
/// ```yaml
/// name: report
/// steps:
///   - id: research
///     agent_kind: researcher
///     task: "Research {{goal}}"
///   - id: write
///     agent_kind: writer
///     task: "Write it up"
///     dependencies: [research]
///     context_refs: [research]
/// ```
pub struct StaticPlanner {
    name: String,
    steps: Vec<StepSpec>,
}

impl StaticPlanner {
    pub fn new(name: &str, steps: Vec<StepSpec>) -> Self {
        Self {
            name: name.to_string(),
            steps,
        }
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let plan: PlanFile = serde_yml::from_str(source).context("Failed to parse plan YAML")?;
        Ok(Self {
            name: plan.name.unwrap_or_else(|| "static".to_string()),
            steps: plan.steps,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Failed to load plan file: {}", path.display()))
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn plan(&self, goal: &str) -> Result<Vec<StepSpec>> {
        Ok(self
            .steps
            .iter()
            .cloned()
            .map(|mut step| {
                step.task = step.task.replace("{{goal}}", goal);
                step
            })
            .collect())
    }
}
