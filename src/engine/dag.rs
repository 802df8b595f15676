//! Plan validation and step scheduling over a session's step DAG.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::agents::AgentRegistry;
use crate::engine::types::{SessionStatus, StepSpec, StepStatus, WorkflowSession};
use crate::error::OrchestratorError;

/// Topological sort using Kahn's algorithm. Returns execution phases; each
/// phase lists step ids (in plan order) whose dependencies are all in
/// earlier phases.
pub fn execution_phases(steps: &[StepSpec]) -> Result<Vec<Vec<String>>, String> {
    let known: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();

    for step in steps {
        for dep in &step.dependencies {
            if !known.contains(dep.as_str()) {
                return Err(format!(
                    "Step '{}' depends on '{}', which does not exist",
                    step.id, dep
                ));
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        in_degree.entry(step.id.as_str()).or_insert(0);
        for dep in &step.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
            *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
        }
    }

    let mut phases = Vec::new();
    let mut remaining: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&str>, Vec<&str>) = remaining
            .iter()
            .partition(|id| in_degree.get(*id).copied().unwrap_or(0) == 0);

        if ready.is_empty() {
            return Err(format!(
                "Cycle detected in plan. Remaining steps: {:?}",
                blocked
            ));
        }

        for id in &ready {
            if let Some(next) = dependents.get(id) {
                for dependent in next {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                    }
                }
            }
        }

        phases.push(ready.iter().map(|s| s.to_string()).collect());
        remaining = blocked;
    }

    Ok(phases)
}

/// Every problem with a plan, empty if it is runnable.
pub fn plan_errors(steps: &[StepSpec], agents: Option<&AgentRegistry>) -> Vec<String> {
    let mut errors = Vec::new();
    if steps.is_empty() {
        errors.push("Plan has no steps".to_string());
        return errors;
    }

    let mut seen = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            errors.push("Step with an empty id".to_string());
        }
        if !seen.insert(step.id.as_str()) {
            errors.push(format!("Duplicate step id '{}'", step.id));
        }
    }

    let by_id: HashMap<&str, &StepSpec> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    for step in steps {
        if let Some(registry) = agents
            && !registry.contains(&step.agent_kind)
        {
            errors.push(format!(
                "Step '{}' uses unknown agent kind '{}'",
                step.id, step.agent_kind
            ));
        }
        if step.dependencies.contains(&step.id) {
            errors.push(format!("Step '{}' depends on itself", step.id));
        }
        for reference in &step.context_refs {
            if !by_id.contains_key(reference.as_str()) {
                errors.push(format!(
                    "Step '{}' takes context from '{}', which does not exist",
                    step.id, reference
                ));
            }
        }
        if let Some(ref handler) = step.on_error {
            match by_id.get(handler.as_str()) {
                None => errors.push(format!(
                    "Step '{}' routes errors to '{}', which does not exist",
                    step.id, handler
                )),
                Some(_) if *handler == step.id => {
                    errors.push(format!("Step '{}' cannot be its own error handler", step.id))
                }
                Some(h) if h.dependencies.contains(&step.id) => errors.push(format!(
                    "Error handler '{}' cannot depend on '{}', the step it handles",
                    handler, step.id
                )),
                Some(_) => {}
            }
        }
    }

    if let Err(e) = execution_phases(steps) {
        errors.push(e);
    }
    errors
}

/// Validate a freshly planned step list.
pub fn validate_plan(steps: &[StepSpec], agents: &AgentRegistry) -> Result<(), OrchestratorError> {
    let errors = plan_errors(steps, Some(agents));
    if errors.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::WorkflowPlanning(errors.join("; ")))
    }
}

/// Ids named as some step's `on_error` handler. They only run when triggered.
pub fn error_handlers(steps: &[StepSpec]) -> HashSet<String> {
    steps.iter().filter_map(|s| s.on_error.clone()).collect()
}

/// A failed step blocks its dependents unless its handler may still recover it.
fn blocks_dependents(session: &WorkflowSession, step: &StepSpec) -> bool {
    match session.step_status(&step.id) {
        StepStatus::Skipped => true,
        StepStatus::Failed => match step.on_error {
            None => true,
            Some(ref handler) => matches!(
                session.step_status(handler),
                StepStatus::Failed | StepStatus::Skipped
            ),
        },
        _ => false,
    }
}

/// Mark pending steps that can no longer run as skipped, to a fixpoint.
/// Returns the newly skipped ids.
pub fn propagate_skips(session: &mut WorkflowSession) -> Vec<String> {
    let mut skipped = Vec::new();
    loop {
        let doomed: Vec<String> = session
            .steps
            .iter()
            .filter(|s| session.step_status(&s.id) == StepStatus::Pending)
            .filter(|s| {
                s.dependencies.iter().any(|dep| {
                    session
                        .step(dep)
                        .is_some_and(|d| blocks_dependents(session, d))
                })
            })
            .map(|s| s.id.clone())
            .collect();

        if doomed.is_empty() {
            return skipped;
        }
        for id in doomed {
            session.set_step_status(&id, StepStatus::Skipped);
            skipped.push(id);
        }
    }
}

/// Indices of pending steps whose dependencies all succeeded. Error
/// handlers are only included once one of their origins has failed.
pub fn ready_steps(session: &WorkflowSession) -> Vec<usize> {
    let handlers = error_handlers(&session.steps);
    session
        .steps
        .iter()
        .enumerate()
        .filter(|(_, s)| session.step_status(&s.id) == StepStatus::Pending)
        .filter(|(_, s)| {
            s.dependencies
                .iter()
                .all(|dep| session.step_status(dep).is_success())
        })
        .filter(|(_, s)| {
            !handlers.contains(&s.id)
                || session.steps.iter().any(|origin| {
                    origin.on_error.as_deref() == Some(s.id.as_str())
                        && session.step_status(&origin.id) == StepStatus::Failed
                })
        })
        .map(|(i, _)| i)
        .collect()
}

/// Split ready steps into groups that run together: steps sharing a
/// `parallel_group` form one group, the rest run alone. Plan order is kept.
pub fn parallel_groups(session: &WorkflowSession, ready: &[usize]) -> Vec<Vec<usize>> {
    let mut groups: Vec<(Option<&str>, Vec<usize>)> = Vec::new();
    for &idx in ready {
        let hint = session.steps[idx].parallel_group.as_deref();
        match hint.and_then(|h| groups.iter_mut().find(|(g, _)| *g == Some(h))) {
            Some((_, members)) => members.push(idx),
            None => groups.push((hint, vec![idx])),
        }
    }
    groups.into_iter().map(|(_, members)| members).collect()
}

/// After `handler_id` completed, mark the failed steps it handles as recovered.
pub fn mark_recovered(session: &mut WorkflowSession, handler_id: &str) -> Vec<String> {
    let origins: Vec<String> = session
        .steps
        .iter()
        .filter(|s| s.on_error.as_deref() == Some(handler_id))
        .filter(|s| session.step_status(&s.id) == StepStatus::Failed)
        .map(|s| s.id.clone())
        .collect();
    for id in &origins {
        session.set_step_status(id, StepStatus::Recovered);
    }
    origins
}

/// Skip whatever is still pending once nothing else can run.
pub fn skip_leftovers(session: &mut WorkflowSession) -> Vec<String> {
    let leftovers: Vec<String> = session
        .steps
        .iter()
        .filter(|s| session.step_status(&s.id) == StepStatus::Pending)
        .map(|s| s.id.clone())
        .collect();
    for id in &leftovers {
        session.set_step_status(id, StepStatus::Skipped);
    }
    leftovers
}

/// One change to the not-yet-started part of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepEdit {
    Insert {
        step: StepSpec,
        #[serde(default)]
        position: Option<usize>,
    },
    Remove {
        step_id: String,
    },
    Move {
        step_id: String,
        position: usize,
    },
    Update {
        step_id: String,
        #[serde(default)]
        task: Option<String>,
        #[serde(default)]
        agent_kind: Option<String>,
        #[serde(default)]
        dependencies: Option<Vec<String>>,
        #[serde(default)]
        context_refs: Option<Vec<String>>,
        /// `null` clears the group; an absent field leaves it alone.
        #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
        parallel_group: Option<Option<String>>,
    },
}

/// Distinguishes an explicit `null` from a missing field.
fn present<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

fn require_pending(session: &WorkflowSession, step_id: &str) -> Result<(), String> {
    if session.step(step_id).is_none() {
        return Err(format!("step '{}' does not exist", step_id));
    }
    match session.step_status(step_id) {
        StepStatus::Pending => Ok(()),
        status => Err(format!("step '{}' is already {}", step_id, status)),
    }
}

fn apply_one(session: &mut WorkflowSession, edit: &StepEdit) -> Result<String, String> {
    match edit {
        StepEdit::Insert { step, position } => {
            if session.step(&step.id).is_some() {
                return Err(format!("step '{}' already exists", step.id));
            }
            let at = position.unwrap_or(session.steps.len()).min(session.steps.len());
            session.steps.insert(at, step.clone());
            session
                .step_states
                .insert(step.id.clone(), StepStatus::Pending);
            Ok(format!("inserted '{}' at {}", step.id, at))
        }
        StepEdit::Remove { step_id } => {
            require_pending(session, step_id)?;
            if let Some(user) = session.steps.iter().find(|s| {
                s.id != *step_id
                    && (s.dependencies.contains(step_id)
                        || s.context_refs.contains(step_id)
                        || s.on_error.as_deref() == Some(step_id.as_str()))
            }) {
                return Err(format!(
                    "step '{}' is still referenced by '{}'",
                    step_id, user.id
                ));
            }
            session.steps.retain(|s| s.id != *step_id);
            session.step_states.remove(step_id);
            Ok(format!("removed '{}'", step_id))
        }
        StepEdit::Move { step_id, position } => {
            require_pending(session, step_id)?;
            let from = session
                .steps
                .iter()
                .position(|s| s.id == *step_id)
                .ok_or_else(|| format!("step '{}' does not exist", step_id))?;
            let step = session.steps.remove(from);
            let at = (*position).min(session.steps.len());
            session.steps.insert(at, step);
            Ok(format!("moved '{}' to {}", step_id, at))
        }
        StepEdit::Update {
            step_id,
            task,
            agent_kind,
            dependencies,
            context_refs,
            parallel_group,
        } => {
            require_pending(session, step_id)?;
            let step = session
                .steps
                .iter_mut()
                .find(|s| s.id == *step_id)
                .ok_or_else(|| format!("step '{}' does not exist", step_id))?;
            if let Some(task) = task {
                step.task = task.clone();
            }
            if let Some(kind) = agent_kind {
                step.agent_kind = kind.clone();
            }
            if let Some(deps) = dependencies {
                step.dependencies = deps.clone();
            }
            if let Some(refs) = context_refs {
                step.context_refs = refs.clone();
            }
            if let Some(group) = parallel_group {
                step.parallel_group = group.clone();
            }
            Ok(format!("updated '{}'", step_id))
        }
    }
}

/// Apply `edits` atomically. On any error the session is left untouched.
pub fn apply_edits(
    session: &mut WorkflowSession,
    edits: &[StepEdit],
    agents: &AgentRegistry,
) -> Result<Vec<String>, OrchestratorError> {
    if session.status.is_terminal() {
        return Err(OrchestratorError::InvalidModification(format!(
            "session '{}' is {}",
            session.id, session.status
        )));
    }
    if session.status == SessionStatus::Pending {
        return Err(OrchestratorError::InvalidModification(format!(
            "session '{}' has not been planned yet",
            session.id
        )));
    }

    let mut draft = session.clone();
    let mut applied = Vec::with_capacity(edits.len());
    for edit in edits {
        let summary = apply_one(&mut draft, edit).map_err(OrchestratorError::InvalidModification)?;
        applied.push(summary);
    }

    let errors = plan_errors(&draft.steps, Some(agents));
    if !errors.is_empty() {
        return Err(OrchestratorError::InvalidModification(errors.join("; ")));
    }

    draft.refresh_current_step();
    *session = draft;
    Ok(applied)
}
