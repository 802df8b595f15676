use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use tracing::warn;

use crate::agents::builtin::{HttpAgentInvoker, ScriptedInvoker};
use crate::agents::{AgentInvoker, AgentRegistry};
use crate::bus::{AlertRule, BusConfig};
use crate::engine::OrchestratorConfig;
use crate::engine::types::RetryPolicy;

/// Configuration loaded from `conductor.yaml`.
/// All fields are optional; missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ConductorConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub store_dir: Option<String>,
    pub workspace_dir: Option<String>,
    /// Plan file (`.yaml`/`.yml` or `.lua`) used for every goal.
    pub plan: Option<String>,
    /// Agent kind for single-step plans when no plan file is set.
    pub default_agent: Option<String>,
    pub max_concurrent_steps: Option<usize>,
    pub step_timeout_s: Option<f64>,
    pub cancel_grace_s: Option<f64>,
    pub retry: Option<RetryPolicy>,
    pub agent_endpoint: Option<AgentEndpointConfig>,
    pub bus: BusSection,
    /// Agent kind overrides and additions, keyed by kind.
    pub agents: HashMap<String, AgentOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentEndpointConfig {
    pub url: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub timeout_s: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSection {
    #[serde(flatten)]
    pub queues: BusConfig,
    pub heartbeat_interval_s: f64,
    pub sample_interval_s: f64,
    pub alerts: Vec<AlertRule>,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            queues: BusConfig::default(),
            heartbeat_interval_s: 30.0,
            sample_interval_s: 5.0,
            alerts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentOverride {
    pub description: Option<String>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub max_turns: Option<u32>,
}

impl ConductorConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `conductor.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("conductor.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: ConductorConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    /// Scheduling settings. `CONDUCTOR_MAX_CONCURRENT_STEPS` wins over the file.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        let env_override = std::env::var("CONDUCTOR_MAX_CONCURRENT_STEPS").is_ok();
        if !env_override && let Some(n) = self.max_concurrent_steps.filter(|n| *n > 0) {
            config.max_concurrent_steps = n;
        }
        if let Some(ref retry) = self.retry {
            config.default_retry = retry.clone();
        }
        config.step_timeout = self
            .step_timeout_s
            .filter(|s| *s > 0.0)
            .map(Duration::from_secs_f64);
        if let Some(grace) = self.cancel_grace_s.filter(|s| *s > 0.0) {
            config.cancel_grace = Duration::from_secs_f64(grace);
        }
        config
    }

    /// Agent backend: the configured HTTP endpoint, or the offline echo agent.
    pub fn agent_backend(&self) -> Result<Arc<dyn AgentInvoker>> {
        match self.agent_endpoint {
            Some(ref endpoint) => {
                let api_key = match endpoint.api_key_env {
                    Some(ref var) => {
                        let key = std::env::var(var).ok();
                        if key.is_none() {
                            warn!(var = %var, "Agent API key variable is not set");
                        }
                        key
                    }
                    None => None,
                };
                let timeout = Duration::from_secs_f64(endpoint.timeout_s.unwrap_or(600.0));
                Ok(Arc::new(HttpAgentInvoker::new(&endpoint.url, api_key, timeout)?))
            }
            None => {
                warn!("No agent_endpoint configured, using the offline echo agent");
                Ok(Arc::new(ScriptedInvoker::echo()))
            }
        }
    }

    /// Built-in agent kinds bound to `backend`, with this file's overrides applied.
    pub fn agent_registry(&self, backend: Arc<dyn AgentInvoker>) -> AgentRegistry {
        let backend_name = backend.name().to_string();
        let mut registry = AgentRegistry::with_defaults(backend);

        for (kind, over) in &self.agents {
            let mut profile = registry.profile(kind).cloned().unwrap_or_else(|| {
                crate::agents::AgentProfile {
                    kind: kind.clone(),
                    description: format!("Custom agent '{}'", kind),
                    system_prompt: String::new(),
                    allowed_tools: Vec::new(),
                    max_turns: 5,
                    backend: backend_name.clone(),
                }
            });
            if let Some(ref d) = over.description {
                profile.description = d.clone();
            }
            if let Some(ref p) = over.system_prompt {
                profile.system_prompt = p.clone();
            }
            if let Some(ref tools) = over.allowed_tools {
                profile.allowed_tools = tools.clone();
            }
            if let Some(turns) = over.max_turns {
                profile.max_turns = turns;
            }
            registry.register_profile(profile);
        }

        registry
    }
}
