pub mod builtin;
pub mod profiles;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use profiles::AgentProfile;

/// One item produced by an agent backend while it works.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentChunk {
    Text(String),
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    Usage {
        tokens: u64,
    },
}

/// Stream of agent output. Ends with `None` on success or an `Err` item on failure.
pub type AgentEventStream = BoxStream<'static, Result<AgentChunk>>;

/// Tool authorization and limits handed to an agent for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub agent_kind: String,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

/// Trait implemented by every agent backend.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Backend identifier (e.g., "http", "echo").
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Start one agent run. The returned stream must stop producing once dropped.
    async fn invoke(&self, prompt: &str, tools: &ToolConfig) -> Result<AgentEventStream>;
}

/// Registry of agent kinds and the backends that serve them.
pub struct AgentRegistry {
    profiles: HashMap<String, AgentProfile>,
    invokers: HashMap<String, Arc<dyn AgentInvoker>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
            invokers: HashMap::new(),
        }
    }

    /// Registry with the default agent kinds, all served by `invoker`.
    pub fn with_defaults(invoker: Arc<dyn AgentInvoker>) -> Self {
        let mut registry = Self::new();
        let backend = invoker.name().to_string();
        registry.register_invoker(invoker);
        for profile in profiles::default_profiles(&backend) {
            registry.register_profile(profile);
        }
        registry
    }

    /// Register an agent backend under its own name.
    pub fn register_invoker(&mut self, invoker: Arc<dyn AgentInvoker>) {
        self.invokers.insert(invoker.name().to_string(), invoker);
    }

    /// Register (or replace) an agent kind.
    pub fn register_profile(&mut self, profile: AgentProfile) {
        self.profiles.insert(profile.kind.clone(), profile);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.resolve(kind).is_some()
    }

    pub fn profile(&self, kind: &str) -> Option<&AgentProfile> {
        self.profiles.get(kind)
    }

    /// Look up the profile for `kind` together with its backend.
    /// Returns `None` if either half is missing.
    pub fn resolve(&self, kind: &str) -> Option<(&AgentProfile, Arc<dyn AgentInvoker>)> {
        let profile = self.profiles.get(kind)?;
        let invoker = self.invokers.get(&profile.backend)?.clone();
        Some((profile, invoker))
    }

    /// List all agent kinds with descriptions, sorted by kind.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .profiles
            .values()
            .map(|p| (p.kind.as_str(), p.description.as_str()))
            .collect();
        entries.sort_by_key(|(kind, _)| *kind);
        entries
    }

    pub fn kinds(&self) -> Vec<String> {
        self.list().into_iter().map(|(k, _)| k.to_string()).collect()
    }
}
