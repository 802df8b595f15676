use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agents::{AgentInvoker, ToolConfig};
use crate::bus::{AlertRule, BusEvent, EventBus, EventKind, MetricSource, spawn_ticker};
use crate::engine::context::{OrchestratorConfig, RuntimeContext};
use crate::engine::dag::{self, StepEdit};
use crate::engine::types::{
    ExecutionEvent, SessionFilter, SessionStatus, SessionSummary, StepResult, StepSpec,
    StepStatus, WorkflowSession, new_session_id,
};
use crate::error::{OrchestratorError, PersistenceError};
use crate::storage::{SessionPatch, SessionState, SnapshotDiff};
use crate::stream::{self, EventReceiver, ExecutionStream, PauseGate, StreamRequest, StreamTermination};

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Drives workflow sessions: plans them, runs their steps as execution
/// streams, publishes progress on the bus and snapshots to the store.
///
/// Cheap to clone; all clones share the same sessions.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: RuntimeContext,
    config: OrchestratorConfig,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    permits: Arc<Semaphore>,
}

struct SessionRecord {
    session: WorkflowSession,
    results: BTreeMap<String, StepResult>,
    /// Events not yet handed to the store.
    history: Vec<ExecutionEvent>,
    /// Whether a driver task currently owns this session.
    driving: bool,
    cancel: CancellationToken,
}

struct SessionHandle {
    id: String,
    record: Mutex<SessionRecord>,
    gate: PauseGate,
    status: watch::Sender<SessionStatus>,
    active_steps: AtomicUsize,
}

impl SessionHandle {
    fn new(session: WorkflowSession, results: BTreeMap<String, StepResult>) -> Self {
        let (status, _) = watch::channel(session.status);
        Self {
            id: session.id.clone(),
            record: Mutex::new(SessionRecord {
                session,
                results,
                history: Vec::new(),
                driving: false,
                cancel: CancellationToken::new(),
            }),
            gate: PauseGate::new(),
            status,
            active_steps: AtomicUsize::new(0),
        }
    }

    fn current_status(&self) -> SessionStatus {
        self.record.lock().session.status
    }

    fn workflow(&self) -> WorkflowSession {
        self.record.lock().session.clone()
    }
}

/// Counts a step as running for as long as it is alive.
struct ActiveStep<'a>(&'a AtomicUsize);

impl<'a> ActiveStep<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveStep<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
enum Persist {
    Skip,
    Snapshot,
}

/// Everything a step runner needs, resolved while the record is locked.
struct StepJob {
    spec: StepSpec,
    invoker: Arc<dyn AgentInvoker>,
    prompt: String,
    tools: ToolConfig,
}

enum DriveEnd {
    Finished,
    Interrupted,
}

fn apply_transition(
    record: &mut SessionRecord,
    to: SessionStatus,
    error: Option<String>,
) -> Result<SessionStatus> {
    let from = record.session.status;
    if !from.can_transition_to(to) {
        return Err(OrchestratorError::InvalidTransition {
            session_id: record.session.id.clone(),
            from,
            to,
        });
    }
    record.session.status = to;
    if to.is_terminal() {
        record.session.completed_at = Some(Utc::now());
    }
    if error.is_some() {
        record.session.error = error;
    }
    Ok(from)
}

/// Put steps that were cut short back in the queue.
fn reset_unfinished(record: &mut SessionRecord) {
    let unfinished: Vec<String> = record
        .session
        .step_states
        .iter()
        .filter(|(_, s)| matches!(s, StepStatus::Running | StepStatus::Interrupted))
        .map(|(id, _)| id.clone())
        .collect();
    for id in unfinished {
        record.session.set_step_status(&id, StepStatus::Pending);
        record.results.remove(&id);
    }
}

fn build_prompt(
    spec: &StepSpec,
    session: &WorkflowSession,
    results: &BTreeMap<String, StepResult>,
) -> String {
    let mut sections = Vec::new();
    for reference in &spec.context_refs {
        if let Some(result) = results.get(reference)
            && !result.output.is_empty()
        {
            sections.push(format!("=== {} ===\n{}", reference, result.output));
        }
    }
    for origin in session
        .steps
        .iter()
        .filter(|s| s.on_error.as_deref() == Some(spec.id.as_str()))
        .filter(|s| session.step_status(&s.id) == StepStatus::Failed)
    {
        let reason = results
            .get(&origin.id)
            .and_then(|r| r.error.clone())
            .unwrap_or_default();
        sections.push(format!("=== {} failed ===\n{}", origin.id, reason));
    }

    if sections.is_empty() {
        spec.task.clone()
    } else {
        format!("CONTEXT:\n{}\n\nTASK:\n{}", sections.join("\n\n"), spec.task)
    }
}

/// Cancel `token` once `limit` of unpaused time has passed.
async fn enforce_deadline(
    gate: PauseGate,
    token: CancellationToken,
    limit: Duration,
    expired: Arc<AtomicBool>,
) {
    let mut remaining = limit;
    loop {
        if !gate.wait_until_running(&token).await {
            return;
        }
        let started = Instant::now();
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(remaining) => {
                expired.store(true, Ordering::SeqCst);
                token.cancel();
                return;
            }
            paused = gate.wait_until_paused(&token) => {
                if !paused {
                    return;
                }
                remaining = remaining.saturating_sub(started.elapsed());
            }
        }
    }
}

fn skipped_event(session_id: &str, step_id: &str) -> BusEvent {
    BusEvent::new(EventKind::StepFailed)
        .with_session(session_id)
        .with_step(step_id)
        .with_payload(json!({ "status": "skipped" }))
}

impl Orchestrator {
    pub fn new(ctx: RuntimeContext, config: OrchestratorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_steps.max(1)));
        Self {
            inner: Arc::new(Inner {
                ctx,
                config,
                sessions: RwLock::new(HashMap::new()),
                permits,
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.ctx.bus
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.inner.ctx
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Ask the planner for steps and validate them, without starting anything.
    pub async fn plan(&self, goal: &str) -> Result<Vec<StepSpec>> {
        let steps = self
            .inner
            .ctx
            .planner
            .plan(goal)
            .await
            .map_err(|e| OrchestratorError::WorkflowPlanning(format!("{:#}", e)))?;
        dag::validate_plan(&steps, &self.inner.ctx.agents)?;
        Ok(steps)
    }

    /// Plan `goal`, persist the new session and start driving it.
    /// Returns as soon as the session is running.
    pub async fn execute(&self, goal: &str) -> Result<String> {
        let session_id = new_session_id();
        let mut session = WorkflowSession::new(&session_id, goal);

        let steps = self.plan(goal).await?;
        session.set_steps(steps);

        let workspace = self
            .inner
            .ctx
            .workspaces
            .allocate(&session_id)
            .await
            .map_err(|e| OrchestratorError::Workspace(format!("{:#}", e)))?;
        session.workspace = Some(workspace);

        self.inner
            .ctx
            .store
            .create(&session_id, &SessionState::new(session.clone()))
            .await?;

        let step_count = session.steps.len();
        let handle = Arc::new(SessionHandle::new(session, BTreeMap::new()));
        self.inner
            .sessions
            .write()
            .insert(session_id.clone(), handle.clone());

        {
            let mut record = handle.record.lock();
            let from = apply_transition(&mut record, SessionStatus::Running, None)?;
            self.announce(&record.session, from, SessionStatus::Running);
            record.driving = true;
        }
        if let Err(e) = self.settle(&handle, Persist::Snapshot).await {
            self.abort_start(&handle, &e).await;
            return Err(e);
        }
        self.spawn_driver(handle);

        info!(session_id = %session_id, goal, steps = step_count, "Session started");
        Ok(session_id)
    }

    /// Hold the session at the next step boundary or stream yield point.
    pub async fn pause(&self, session_id: &str) -> Result<()> {
        let handle = self.live(session_id)?;
        self.transition(&handle, SessionStatus::Paused, None, Persist::Snapshot)
            .await?;
        handle.gate.pause();
        Ok(())
    }

    /// Continue a paused or interrupted session. Sessions that are not in
    /// memory are reloaded from the store.
    pub async fn resume(&self, session_id: &str) -> Result<()> {
        self.resume_from(session_id, None).await
    }

    /// Like [`resume`](Self::resume), restarting from a specific stored version.
    pub async fn resume_from(&self, session_id: &str, version_id: Option<&str>) -> Result<()> {
        let handle = match (self.lookup(session_id), version_id) {
            (Some(handle), None) => handle,
            (Some(handle), Some(_)) if handle.record.lock().driving => {
                return Err(OrchestratorError::InvalidTransition {
                    session_id: session_id.to_string(),
                    from: handle.current_status(),
                    to: SessionStatus::Running,
                });
            }
            (_, version) => self.restore(session_id, version).await?,
        };

        let (from, drive) = {
            let mut record = handle.record.lock();
            let from = record.session.status;
            if record.driving {
                if from != SessionStatus::Paused {
                    return Err(OrchestratorError::InvalidTransition {
                        session_id: session_id.to_string(),
                        from,
                        to: SessionStatus::Running,
                    });
                }
                apply_transition(&mut record, SessionStatus::Running, None)?;
                self.announce(&record.session, from, SessionStatus::Running);
                (from, false)
            } else {
                if from.is_terminal() {
                    return Err(OrchestratorError::InvalidTransition {
                        session_id: session_id.to_string(),
                        from,
                        to: SessionStatus::Running,
                    });
                }
                if from != SessionStatus::Running {
                    apply_transition(&mut record, SessionStatus::Running, None)?;
                    self.announce(&record.session, from, SessionStatus::Running);
                }
                reset_unfinished(&mut record);
                record.cancel = CancellationToken::new();
                record.driving = true;
                (from, true)
            }
        };

        handle.gate.resume();
        let committed = self.settle(&handle, Persist::Snapshot).await;
        if drive {
            info!(session_id, from = %from, "Session resumed");
            self.spawn_driver(handle);
        }
        committed
    }

    /// Cancel the session's active steps. The session becomes interrupted
    /// once they acknowledge.
    pub async fn interrupt(&self, session_id: &str) -> Result<()> {
        let handle = self.live(session_id)?;

        enum Plan {
            Cancel(CancellationToken),
            Settle,
        }

        let plan = {
            let record = handle.record.lock();
            match record.session.status {
                SessionStatus::Running | SessionStatus::Paused if record.driving => {
                    Plan::Cancel(record.cancel.clone())
                }
                SessionStatus::Running => Plan::Settle,
                from => {
                    return Err(OrchestratorError::InvalidTransition {
                        session_id: session_id.to_string(),
                        from,
                        to: SessionStatus::Interrupted,
                    });
                }
            }
        };

        match plan {
            Plan::Cancel(token) => {
                info!(session_id, "Interrupt requested");
                token.cancel();
                self.leave_pause(&handle).await;
                handle.gate.resume();
                self.spawn_watchdog(handle);
                Ok(())
            }
            Plan::Settle => {
                self.transition(&handle, SessionStatus::Interrupted, None, Persist::Snapshot)
                    .await
            }
        }
    }

    /// Give up on an interrupted session for good.
    pub async fn abandon(&self, session_id: &str) -> Result<()> {
        let handle = match self.lookup(session_id) {
            Some(handle) => handle,
            None => self.restore(session_id, None).await?,
        };
        self.transition(&handle, SessionStatus::Cancelled, None, Persist::Snapshot)
            .await?;
        info!(session_id, "Session abandoned");
        Ok(())
    }

    /// Edit the not-yet-started part of a session's plan, all or nothing.
    pub async fn modify(&self, session_id: &str, edits: Vec<StepEdit>) -> Result<Vec<String>> {
        let handle = match self.lookup(session_id) {
            Some(handle) => handle,
            None => self.restore(session_id, None).await?,
        };

        let (applied, step_ids) = {
            let mut record = handle.record.lock();
            let applied = dag::apply_edits(&mut record.session, &edits, &self.inner.ctx.agents)?;
            let ids: Vec<String> = record.session.steps.iter().map(|s| s.id.clone()).collect();
            (applied, ids)
        };

        info!(session_id, edits = applied.len(), "Session plan modified");
        self.inner.ctx.bus.publish(
            BusEvent::new(EventKind::WorkflowModified)
                .with_session(session_id)
                .with_payload(json!({ "edits": applied, "steps": step_ids })),
        );
        self.persist(&handle, Persist::Snapshot).await?;
        Ok(applied)
    }

    /// Wait until the session is completed, failed, cancelled or interrupted.
    pub async fn wait(&self, session_id: &str) -> Result<WorkflowSession> {
        let Some(handle) = self.lookup(session_id) else {
            return self.get_session(session_id).await;
        };
        let mut rx = handle.status.subscribe();
        let settled = rx.wait_for(|s| s.is_settled()).await.is_ok();
        if !settled {
            warn!(session_id, "Status channel closed while waiting");
        }
        Ok(handle.workflow())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<WorkflowSession> {
        if let Some(handle) = self.lookup(session_id) {
            return Ok(handle.workflow());
        }
        Ok(self.load(session_id, None).await?.workflow)
    }

    /// Latest result of every step that has run.
    pub async fn step_results(&self, session_id: &str) -> Result<BTreeMap<String, StepResult>> {
        if let Some(handle) = self.lookup(session_id) {
            return Ok(handle.record.lock().results.clone());
        }
        Ok(self.load(session_id, None).await?.agent_contexts)
    }

    /// Live sessions merged with stored ones, newest first.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionSummary>> {
        let mut by_id: HashMap<String, SessionSummary> = self
            .inner
            .ctx
            .store
            .list_sessions()
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s.summary()))
            .collect();

        let live: Vec<Arc<SessionHandle>> = self.inner.sessions.read().values().cloned().collect();
        for handle in live {
            let summary = handle.record.lock().session.summary();
            by_id.insert(summary.id.clone(), summary);
        }

        let mut summaries: Vec<SessionSummary> = by_id
            .into_values()
            .filter(|s| filter.matches(s))
            .collect();
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        Ok(summaries)
    }

    pub async fn versions(&self, session_id: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .ctx
            .store
            .versions(session_id)
            .await
            .map_err(|e| not_found(session_id, e))?)
    }

    pub async fn diff(&self, session_id: &str, from: &str, to: &str) -> Result<SnapshotDiff> {
        Ok(self
            .inner
            .ctx
            .store
            .diff(session_id, from, to)
            .await
            .map_err(|e| not_found(session_id, e))?)
    }

    /// Start the heartbeat/alert ticker over this orchestrator's metrics.
    pub fn start_monitoring(
        &self,
        heartbeat_every: Duration,
        sample_every: Duration,
        rules: Vec<AlertRule>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        spawn_ticker(
            self.inner.ctx.bus.clone(),
            Arc::new(self.clone()),
            heartbeat_every,
            sample_every,
            rules,
            cancel,
        )
    }

    // --- session bookkeeping ---

    fn lookup(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.inner.sessions.read().get(session_id).cloned()
    }

    fn live(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.lookup(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    async fn load(&self, session_id: &str, version_id: Option<&str>) -> Result<SessionState> {
        Ok(self
            .inner
            .ctx
            .store
            .resume(session_id, version_id)
            .await
            .map_err(|e| not_found(session_id, e))?)
    }

    /// Bring a stored session into memory, replacing any idle copy.
    async fn restore(&self, session_id: &str, version_id: Option<&str>) -> Result<Arc<SessionHandle>> {
        let state = self.load(session_id, version_id).await?;
        debug!(
            session_id,
            version = version_id.unwrap_or("latest"),
            status = %state.workflow.status,
            "Restoring session from store"
        );
        let handle = Arc::new(SessionHandle::new(state.workflow, state.agent_contexts));
        self.inner
            .sessions
            .write()
            .insert(session_id.to_string(), handle.clone());
        Ok(handle)
    }

    async fn transition(
        &self,
        handle: &SessionHandle,
        to: SessionStatus,
        error: Option<String>,
        persist: Persist,
    ) -> Result<()> {
        {
            let mut record = handle.record.lock();
            let from = apply_transition(&mut record, to, error)?;
            self.announce(&record.session, from, to);
        }
        self.settle(handle, persist).await
    }

    /// Persist, then wake anyone waiting on the session's status.
    async fn settle(&self, handle: &SessionHandle, persist: Persist) -> Result<()> {
        let persisted = self.persist(handle, persist).await;
        handle.status.send_replace(handle.current_status());
        persisted.map(|_| ())
    }

    /// Publish a transition. Called with the record locked so the bus sees
    /// transitions in the order they were applied.
    fn announce(&self, session: &WorkflowSession, from: SessionStatus, to: SessionStatus) {
        let bus = &self.inner.ctx.bus;
        debug!(session_id = %session.id, from = %from, to = %to, "Session transition");

        bus.publish(
            BusEvent::new(EventKind::WorkflowStatus)
                .with_session(&session.id)
                .with_payload(json!({ "from": from, "to": to })),
        );

        let follow_up = match (from, to) {
            (SessionStatus::Pending, SessionStatus::Running) => Some(
                BusEvent::new(EventKind::WorkflowStarted).with_payload(json!({
                    "goal": session.goal,
                    "steps": session.steps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
                })),
            ),
            (_, SessionStatus::Completed) => Some(
                BusEvent::new(EventKind::WorkflowCompleted).with_payload(json!({
                    "metrics": session.metrics,
                    "duration_s": session
                        .completed_at
                        .map(|end| (end - session.started_at).num_milliseconds() as f64 / 1000.0),
                })),
            ),
            (_, SessionStatus::Failed) => Some(
                BusEvent::new(EventKind::WorkflowFailed)
                    .with_payload(json!({ "error": session.error })),
            ),
            _ => None,
        };
        if let Some(event) = follow_up {
            bus.publish(event.with_session(&session.id));
        }
    }

    /// Hand unsaved state to the store.
    async fn persist(&self, handle: &SessionHandle, persist: Persist) -> Result<Option<String>> {
        if let Persist::Skip = persist {
            return Ok(None);
        }
        let patch = {
            let mut record = handle.record.lock();
            SessionPatch {
                workflow: Some(record.session.clone()),
                agent_contexts: record.results.clone(),
                history: std::mem::take(&mut record.history),
            }
        };
        let history_len = patch.history.len();
        match self.inner.ctx.store.update(&handle.id, patch.clone(), true).await {
            Ok(version) => Ok(version),
            Err(e) => {
                // Keep the unsaved events for the next attempt.
                let mut record = handle.record.lock();
                let newer = std::mem::take(&mut record.history);
                record.history = patch.history;
                record.history.extend(newer);
                error!(session_id = %handle.id, events = history_len, error = %e, "Failed to persist session");
                Err(e.into())
            }
        }
    }

    /// A session whose start could not be committed never gets a driver.
    async fn abort_start(&self, handle: &SessionHandle, cause: &OrchestratorError) {
        {
            let mut record = handle.record.lock();
            record.driving = false;
            if let Ok(from) = apply_transition(&mut record, SessionStatus::Failed, Some(cause.to_string())) {
                self.announce(&record.session, from, SessionStatus::Failed);
            }
        }
        error!(session_id = %handle.id, error = %cause, "Session failed to start");
        if let Err(e) = self.settle(handle, Persist::Snapshot).await {
            warn!(session_id = %handle.id, error = %e, "Failed to record start failure");
        }
    }

    /// Walk a paused session back to running so it can settle elsewhere.
    async fn leave_pause(&self, handle: &SessionHandle) {
        let walked = {
            let mut record = handle.record.lock();
            let walked = record.session.status == SessionStatus::Paused
                && apply_transition(&mut record, SessionStatus::Running, None).is_ok();
            if walked {
                self.announce(&record.session, SessionStatus::Paused, SessionStatus::Running);
            }
            walked
        };
        if walked && let Err(e) = self.settle(handle, Persist::Skip).await {
            warn!(session_id = %handle.id, error = %e, "Failed to record pause exit");
        }
    }

    fn spawn_watchdog(&self, handle: Arc<SessionHandle>) {
        let grace = self.inner.config.cancel_grace;
        let bus = self.inner.ctx.bus.clone();
        tokio::spawn(async move {
            let mut rx = handle.status.subscribe();
            let settled = matches!(
                tokio::time::timeout(grace, rx.wait_for(|s| s.is_settled())).await,
                Ok(Ok(_))
            );
            if !settled {
                let active = handle.active_steps.load(Ordering::SeqCst);
                error!(
                    session_id = %handle.id,
                    active_steps = active,
                    grace_s = grace.as_secs_f64(),
                    "Streams did not acknowledge cancellation within the grace period"
                );
                bus.publish(
                    BusEvent::new(EventKind::Alert)
                        .with_session(&handle.id)
                        .with_payload(json!({
                            "metric": "unacknowledged_cancel",
                            "value": active,
                            "message": "interrupt not acknowledged within grace period",
                        })),
                );
            }
        });
    }

    // --- driver ---

    fn spawn_driver(&self, handle: Arc<SessionHandle>) {
        let this = self.clone();
        tokio::spawn(async move {
            let cancel = handle.record.lock().cancel.clone();
            let end = this.drive(&handle, &cancel).await;
            this.conclude(&handle, end).await;
        });
    }

    async fn drive(
        &self,
        handle: &Arc<SessionHandle>,
        cancel: &CancellationToken,
    ) -> std::result::Result<DriveEnd, OrchestratorError> {
        loop {
            if !handle.gate.wait_until_running(cancel).await {
                return Ok(DriveEnd::Interrupted);
            }

            let (skipped, jobs, unresolved) = {
                let mut record = handle.record.lock();
                let skipped = dag::propagate_skips(&mut record.session);
                for id in &skipped {
                    let mut result = StepResult::new(id);
                    result.status = StepStatus::Skipped;
                    result.finished = Some(Utc::now());
                    record.results.insert(id.clone(), result);
                }

                let ready = dag::ready_steps(&record.session);
                let group = dag::parallel_groups(&record.session, &ready)
                    .into_iter()
                    .next()
                    .unwrap_or_default();

                let mut jobs = Vec::new();
                let mut unresolved = Vec::new();
                for idx in group {
                    let spec = record.session.steps[idx].clone();
                    match self.resolve_job(&spec, &record) {
                        Some(job) => {
                            record.session.set_step_status(&spec.id, StepStatus::Running);
                            jobs.push(job);
                        }
                        None => {
                            let mut result = StepResult::new(&spec.id);
                            result.status = StepStatus::Failed;
                            result.error = Some(
                                OrchestratorError::AgentExecution {
                                    step_id: spec.id.clone(),
                                    message: format!("no backend for agent kind '{}'", spec.agent_kind),
                                }
                                .to_string(),
                            );
                            result.finished = Some(Utc::now());
                            record.session.set_step_status(&spec.id, StepStatus::Failed);
                            record.results.insert(spec.id.clone(), result);
                            unresolved.push(spec.id);
                        }
                    }
                }
                (skipped, jobs, unresolved)
            };

            for id in &skipped {
                debug!(session_id = %handle.id, step = %id, "Step skipped");
                self.inner.ctx.bus.publish(skipped_event(&handle.id, id));
            }
            for id in &unresolved {
                self.inner.ctx.bus.publish(
                    BusEvent::new(EventKind::StepFailed)
                        .with_session(&handle.id)
                        .with_step(id)
                        .with_payload(json!({ "error": "no backend for agent kind" })),
                );
            }

            if jobs.is_empty() {
                if unresolved.is_empty() {
                    return Ok(DriveEnd::Finished);
                }
                continue;
            }

            self.run_group(handle, jobs, cancel).await;
            self.persist(handle, Persist::Snapshot).await?;
        }
    }

    fn resolve_job(&self, spec: &StepSpec, record: &SessionRecord) -> Option<StepJob> {
        let (profile, invoker) = self.inner.ctx.agents.resolve(&spec.agent_kind)?;
        let workspace = record.session.workspace.clone();
        let output_path = match (&workspace, &spec.output_ref) {
            (Some(dir), Some(output)) => Some(dir.join(output)),
            _ => None,
        };
        Some(StepJob {
            spec: spec.clone(),
            invoker,
            prompt: build_prompt(spec, &record.session, &record.results),
            tools: ToolConfig {
                agent_kind: profile.kind.clone(),
                system_prompt: profile.system_prompt.clone(),
                allowed_tools: profile.allowed_tools.clone(),
                max_turns: profile.max_turns,
                workspace,
                output_path,
            },
        })
    }

    /// Run one group's steps concurrently and fold their results.
    async fn run_group(&self, handle: &Arc<SessionHandle>, jobs: Vec<StepJob>, cancel: &CancellationToken) {
        let mut receivers = Vec::with_capacity(jobs.len());
        let mut runners = Vec::with_capacity(jobs.len());
        for job in jobs {
            let (tx, rx) = EventReceiver::channel();
            receivers.push(rx);
            let step_id = job.spec.id.clone();
            let runner = tokio::spawn(self.clone().run_step(handle.clone(), job, cancel.clone(), tx));
            runners.push((step_id, runner));
        }

        let mut merged = std::pin::pin!(stream::merge(receivers));
        while let Some(event) = merged.next().await {
            self.inner.ctx.bus.publish(BusEvent::from(&event));
            handle.record.lock().history.push(event);
        }

        for (step_id, runner) in runners {
            let result = match runner.await {
                Ok(result) => result,
                Err(e) => {
                    let mut result = StepResult::new(&step_id);
                    result.status = StepStatus::Failed;
                    result.error = Some(format!("step runner aborted: {}", e));
                    result.finished = Some(Utc::now());
                    result
                }
            };
            self.fold_result(handle, result);
        }
    }

    fn fold_result(&self, handle: &SessionHandle, result: StepResult) {
        let recovered = {
            let mut record = handle.record.lock();
            record.session.set_step_status(&result.step_id, result.status);
            record.session.metrics.absorb(&result.metrics);
            let recovered = if result.status == StepStatus::Completed {
                dag::mark_recovered(&mut record.session, &result.step_id)
            } else {
                Vec::new()
            };
            for origin in &recovered {
                if let Some(r) = record.results.get_mut(origin) {
                    r.status = StepStatus::Recovered;
                }
            }
            record.results.insert(result.step_id.clone(), result.clone());
            recovered
        };

        match result.status {
            StepStatus::Completed => {
                info!(session_id = %handle.id, step = %result.step_id, attempts = result.attempts, "Step completed")
            }
            StepStatus::Failed => warn!(
                session_id = %handle.id,
                step = %result.step_id,
                attempts = result.attempts,
                error = result.error.as_deref().unwrap_or(""),
                "Step failed"
            ),
            status => debug!(session_id = %handle.id, step = %result.step_id, status = %status, "Step settled"),
        }

        for origin in recovered {
            info!(session_id = %handle.id, step = %origin, handler = %result.step_id, "Step recovered");
            self.inner.ctx.bus.publish(
                BusEvent::new(EventKind::StepCompleted)
                    .with_session(&handle.id)
                    .with_step(&origin)
                    .with_payload(json!({ "status": "recovered", "handled_by": result.step_id })),
            );
        }
    }

    /// Run one step to a terminal result, retrying per its policy.
    async fn run_step(
        self,
        handle: Arc<SessionHandle>,
        job: StepJob,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> StepResult {
        let step_id = job.spec.id.clone();
        let mut result = StepResult::new(&step_id);
        result.started = Some(Utc::now());

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.inner.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            result.status = StepStatus::Interrupted;
            result.finished = Some(Utc::now());
            return result;
        };
        let _active = ActiveStep::enter(&handle.active_steps);

        let policy = job
            .spec
            .retry
            .clone()
            .unwrap_or_else(|| self.inner.config.default_retry.clone());
        let timeout = job
            .spec
            .timeout_s
            .map(Duration::from_secs_f64)
            .or(self.inner.config.step_timeout);

        let mut attempt = 0;
        loop {
            attempt += 1;
            result.attempts = attempt;

            let attempt_token = cancel.child_token();
            let timed_out = Arc::new(AtomicBool::new(false));
            if let Some(limit) = timeout {
                tokio::spawn(enforce_deadline(
                    handle.gate.clone(),
                    attempt_token.clone(),
                    limit,
                    timed_out.clone(),
                ));
            }

            let request = StreamRequest {
                session_id: handle.id.clone(),
                step_id: step_id.clone(),
                agent_kind: job.spec.agent_kind.clone(),
                task: job.spec.task.clone(),
                prompt: job.prompt.clone(),
                tools: job.tools.clone(),
                attempt,
            };
            let mut execution = ExecutionStream::spawn(
                job.invoker.clone(),
                request,
                attempt_token.clone(),
                handle.gate.clone(),
            );
            result.agent_id = Some(execution.agent_id().to_string());
            while let Some(event) = execution.next().await {
                let _ = tx.send(event);
            }
            let outcome = execution.finish().await;
            attempt_token.cancel();

            result.metrics.absorb(&outcome.metrics);
            result.tool_log.extend(outcome.tool_log);
            result.output = outcome.output;

            let failure = match outcome.termination {
                StreamTermination::Completed => {
                    result.status = StepStatus::Completed;
                    result.error = None;
                    break;
                }
                StreamTermination::Interrupted if cancel.is_cancelled() => {
                    result.status = StepStatus::Interrupted;
                    result.error = Some("interrupted".to_string());
                    break;
                }
                StreamTermination::Interrupted if timed_out.load(Ordering::SeqCst) => format!(
                    "timed out after {:.1}s",
                    timeout.map(|t| t.as_secs_f64()).unwrap_or_default()
                ),
                StreamTermination::Interrupted => "stream interrupted".to_string(),
                StreamTermination::Error(message) => message,
            };

            if attempt > policy.max_retries {
                result.status = StepStatus::Failed;
                result.error = Some(
                    OrchestratorError::AgentExecution {
                        step_id: step_id.clone(),
                        message: failure,
                    }
                    .to_string(),
                );
                break;
            }

            let delay = policy.delay_after(attempt);
            warn!(
                session_id = %handle.id,
                step = %step_id,
                attempt,
                max_retries = policy.max_retries,
                delay_s = delay.as_secs_f64(),
                error = %failure,
                "Step attempt failed, retrying"
            );
            let slept = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            if !slept {
                result.status = StepStatus::Interrupted;
                result.error = Some("interrupted".to_string());
                break;
            }
        }

        result.finished = Some(Utc::now());
        result
    }

    /// Settle the session once its driver stops.
    async fn conclude(&self, handle: &SessionHandle, end: std::result::Result<DriveEnd, OrchestratorError>) {
        let outcome = {
            let mut record = handle.record.lock();
            record.driving = false;

            if record.session.status == SessionStatus::Paused
                && apply_transition(&mut record, SessionStatus::Running, None).is_ok()
            {
                self.announce(&record.session, SessionStatus::Paused, SessionStatus::Running);
            }

            let (target, error) = match end {
                Ok(DriveEnd::Interrupted) => (SessionStatus::Interrupted, None),
                Ok(DriveEnd::Finished) => {
                    for id in dag::skip_leftovers(&mut record.session) {
                        let mut result = StepResult::new(&id);
                        result.status = StepStatus::Skipped;
                        result.finished = Some(Utc::now());
                        record.results.insert(id.clone(), result);
                        self.inner.ctx.bus.publish(skipped_event(&handle.id, &id));
                    }
                    let failed: Vec<String> = record
                        .session
                        .steps
                        .iter()
                        .filter(|s| record.session.step_status(&s.id) == StepStatus::Failed)
                        .map(|s| s.id.clone())
                        .collect();
                    if failed.is_empty() {
                        (SessionStatus::Completed, None)
                    } else {
                        let first = record
                            .results
                            .get(&failed[0])
                            .and_then(|r| r.error.clone())
                            .unwrap_or_default();
                        (
                            SessionStatus::Failed,
                            Some(format!("steps failed: {} ({})", failed.join(", "), first)),
                        )
                    }
                }
                Err(e) => (SessionStatus::Failed, Some(e.to_string())),
            };

            let applied = apply_transition(&mut record, target, error);
            if let Ok(from) = applied {
                self.announce(&record.session, from, target);
            }
            applied.map(|_| target)
        };

        match outcome {
            Ok(to) => {
                if let Err(e) = self.settle(handle, Persist::Snapshot).await {
                    error!(session_id = %handle.id, error = %e, "Failed to persist final session state");
                }
                info!(session_id = %handle.id, status = %to, "Session settled");
            }
            Err(e) => {
                error!(session_id = %handle.id, error = %e, "Driver stopped in an unexpected state");
                handle.status.send_replace(handle.current_status());
            }
        }
    }
}

fn not_found(session_id: &str, err: PersistenceError) -> OrchestratorError {
    match err {
        PersistenceError::SessionNotFound(_) => {
            OrchestratorError::SessionNotFound(session_id.to_string())
        }
        other => other.into(),
    }
}

impl MetricSource for Orchestrator {
    fn sample(&self) -> BTreeMap<String, f64> {
        let sessions: Vec<Arc<SessionHandle>> =
            self.inner.sessions.read().values().cloned().collect();
        let mut active = 0.0;
        let mut paused = 0.0;
        let mut running_steps = 0.0;
        for handle in &sessions {
            match handle.current_status() {
                SessionStatus::Running => active += 1.0,
                SessionStatus::Paused => paused += 1.0,
                _ => {}
            }
            running_steps += handle.active_steps.load(Ordering::SeqCst) as f64;
        }
        BTreeMap::from([
            ("active_sessions".to_string(), active),
            ("paused_sessions".to_string(), paused),
            ("running_steps".to_string(), running_steps),
            ("total_sessions".to_string(), sessions.len() as f64),
            (
                "available_step_permits".to_string(),
                self.inner.permits.available_permits() as f64,
            ),
        ])
    }
}
