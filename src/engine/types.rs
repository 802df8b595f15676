use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a workflow session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Interrupted,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Whether `self -> next` is one of the legal state-machine edges.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Interrupted)
                | (Running, Completed)
                | (Running, Failed)
                | (Interrupted, Running)
                | (Interrupted, Cancelled)
        )
    }

    /// Completed, failed or cancelled. Nothing leaves these states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Terminal, or interrupted and waiting for an explicit resume.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == SessionStatus::Interrupted
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Interrupted => write!(f, "interrupted"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "paused" => Ok(SessionStatus::Paused),
            "interrupted" => Ok(SessionStatus::Interrupted),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(format!("Invalid session status: {}", other)),
        }
    }
}

/// Status of an individual step within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Interrupted,
    /// Failed, but its `on_error` alternate completed.
    Recovered,
}

impl StepStatus {
    pub fn is_success(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Recovered)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Recovered
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Interrupted => write!(f, "interrupted"),
            StepStatus::Recovered => write!(f, "recovered"),
        }
    }
}

/// Retry policy for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial backoff duration in seconds (doubles each attempt).
    pub backoff_s: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_s: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        let secs = self.backoff_s * 2.0_f64.powi(attempt.saturating_sub(1) as i32);
        std::time::Duration::from_secs_f64(secs.max(0.0))
    }
}

/// One planned unit of work, delegated to an agent of `agent_kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub agent_kind: String,
    pub task: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Steps whose outputs are fed into this step's prompt.
    #[serde(default)]
    pub context_refs: Vec<String>,
    /// Artifact path inside the session workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    /// Ready steps sharing a group run concurrently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,
    /// Alternate step that runs only if this one fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, agent_kind: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_kind: agent_kind.into(),
            task: task.into(),
            dependencies: Vec::new(),
            context_refs: Vec::new(),
            output_ref: None,
            parallel_group: None,
            retry: None,
            timeout_s: None,
            on_error: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn with_context<I, S>(mut self, refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context_refs.extend(refs.into_iter().map(Into::into));
        self
    }

    pub fn with_retry(mut self, max_retries: u32, backoff_s: f64) -> Self {
        self.retry = Some(RetryPolicy {
            max_retries,
            backoff_s,
        });
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_s = Some(seconds);
        self
    }

    pub fn with_on_error(mut self, step_id: impl Into<String>) -> Self {
        self.on_error = Some(step_id.into());
        self
    }
}

/// Counters accumulated per step and per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub tokens_used: u64,
    pub words_generated: u64,
    pub tool_calls: u64,
    pub api_calls: u64,
    pub errors: u64,
}

impl Metrics {
    pub fn absorb(&mut self, other: &Metrics) {
        self.tokens_used += other.tokens_used;
        self.words_generated += other.words_generated;
        self.tool_calls += other.tool_calls;
        self.api_calls += other.api_calls;
        self.errors += other.errors;
    }
}

/// One entry of a step's tool-usage log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub tool: String,
    pub input: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Final (or in-progress) record of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub output: String,
    #[serde(default)]
    pub tool_log: Vec<ToolUse>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn new(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            attempts: 0,
            agent_id: None,
            output: String::new(),
            tool_log: Vec::new(),
            metrics: Metrics::default(),
            error: None,
            started: None,
            finished: None,
        }
    }
}

/// Variant-specific part of an [`ExecutionEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    Initialized {
        agent_kind: String,
        task: String,
        attempt: u32,
    },
    TextChunk {
        content: String,
        word_count: u64,
    },
    ToolUse {
        tool: String,
        input: serde_json::Value,
    },
    Completed {
        output_chars: usize,
        metrics: Metrics,
    },
    Error {
        message: String,
    },
    Interrupted {
        reason: String,
        partial_chars: usize,
    },
}

/// One atomic event produced by an execution stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub agent_id: String,
    pub session_id: String,
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl ExecutionEvent {
    pub fn new(agent_id: &str, session_id: &str, step_id: &str, payload: EventPayload) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            step_id: step_id.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// `completed`, `error` and `interrupted` end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::Completed { .. } | EventPayload::Error { .. } | EventPayload::Interrupted { .. }
        )
    }
}

/// A goal-driven run of planned steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub id: String,
    pub goal: String,
    pub status: SessionStatus,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub step_states: BTreeMap<String, StepStatus>,
    /// Indices into `steps` of the steps currently in flight.
    #[serde(default)]
    pub current_step: Vec<usize>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowSession {
    pub fn new(id: &str, goal: &str) -> Self {
        Self {
            id: id.to_string(),
            goal: goal.to_string(),
            status: SessionStatus::Pending,
            steps: Vec::new(),
            step_states: BTreeMap::new(),
            current_step: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            metrics: Metrics::default(),
            workspace: None,
            error: None,
        }
    }

    /// Replace the plan; every step starts out pending.
    pub fn set_steps(&mut self, steps: Vec<StepSpec>) {
        self.step_states = steps
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();
        self.steps = steps;
        self.current_step.clear();
    }

    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_status(&self, step_id: &str) -> StepStatus {
        self.step_states
            .get(step_id)
            .copied()
            .unwrap_or(StepStatus::Pending)
    }

    pub fn set_step_status(&mut self, step_id: &str, status: StepStatus) {
        self.step_states.insert(step_id.to_string(), status);
        self.refresh_current_step();
    }

    /// Recompute `current_step` from the running steps.
    pub fn refresh_current_step(&mut self) {
        self.current_step = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| self.step_states.get(&s.id) == Some(&StepStatus::Running))
            .map(|(i, _)| i)
            .collect();
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            goal: self.goal.clone(),
            status: self.status,
            total_steps: self.steps.len(),
            completed_steps: self.step_states.values().filter(|s| s.is_success()).count(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Compact listing row for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub goal: String,
    pub status: SessionStatus,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filter for `list_sessions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionFilter {
    #[serde(default)]
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub goal_contains: Option<String>,
}

impl SessionFilter {
    pub fn matches(&self, summary: &SessionSummary) -> bool {
        if let Some(status) = self.status
            && summary.status != status
        {
            return false;
        }
        if let Some(ref needle) = self.goal_contains
            && !summary.goal.to_lowercase().contains(&needle.to_lowercase())
        {
            return false;
        }
        true
    }
}

/// `session_<yyyymmdd_HHMMSS>_<8 hex>`; sortable and safe as a directory name.
pub fn new_session_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!(
        "session_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &uuid[..8]
    )
}
