use std::sync::Arc;
use std::time::Duration;

use crate::agents::AgentRegistry;
use crate::bus::EventBus;
use crate::engine::types::RetryPolicy;
use crate::planner::Planner;
use crate::storage::SessionStore;
use crate::workspace::WorkspaceProvider;

/// Collaborators shared by every session an orchestrator drives.
#[derive(Clone)]
pub struct RuntimeContext {
    pub bus: EventBus,
    pub store: Arc<dyn SessionStore>,
    pub planner: Arc<dyn Planner>,
    pub agents: Arc<AgentRegistry>,
    pub workspaces: Arc<dyn WorkspaceProvider>,
}

impl RuntimeContext {
    pub fn new(
        bus: EventBus,
        store: Arc<dyn SessionStore>,
        planner: Arc<dyn Planner>,
        agents: Arc<AgentRegistry>,
        workspaces: Arc<dyn WorkspaceProvider>,
    ) -> Self {
        Self {
            bus,
            store,
            planner,
            agents,
            workspaces,
        }
    }
}

/// Scheduling limits and step defaults.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently running steps across all sessions.
    pub max_concurrent_steps: usize,
    /// Used for steps without their own `retry`.
    pub default_retry: RetryPolicy,
    /// Used for steps without their own `timeout_s`.
    pub step_timeout: Option<Duration>,
    /// How long an interrupted stream may take to acknowledge.
    pub cancel_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let max_concurrent_steps = std::env::var("CONDUCTOR_MAX_CONCURRENT_STEPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or_else(num_cpus::get);

        Self {
            max_concurrent_steps,
            default_retry: RetryPolicy::default(),
            step_timeout: None,
            cancel_grace: Duration::from_secs(5),
        }
    }
}
