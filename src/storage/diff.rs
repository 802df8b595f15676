use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::types::ExecutionEvent;

use super::SessionState;

/// A top-level workflow field that differs between two versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub from: serde_json::Value,
    pub to: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl AgentsDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// History is append-only in practice, so it is compared by common prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryDiff {
    pub added: Vec<ExecutionEvent>,
    pub removed: usize,
}

impl HistoryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub workflow_diff: BTreeMap<String, FieldChange>,
    pub agents_diff: AgentsDiff,
    pub history_diff: HistoryDiff,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.workflow_diff.is_empty() && self.agents_diff.is_empty() && self.history_diff.is_empty()
    }
}

fn as_object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

fn workflow_diff(a: &SessionState, b: &SessionState) -> BTreeMap<String, FieldChange> {
    let left = as_object(serde_json::to_value(&a.workflow).unwrap_or_default());
    let right = as_object(serde_json::to_value(&b.workflow).unwrap_or_default());

    let mut changes = BTreeMap::new();
    for key in left.keys().chain(right.keys()) {
        if changes.contains_key(key) {
            continue;
        }
        let from = left.get(key).cloned().unwrap_or(serde_json::Value::Null);
        let to = right.get(key).cloned().unwrap_or(serde_json::Value::Null);
        if from != to {
            changes.insert(key.clone(), FieldChange { from, to });
        }
    }
    changes
}

fn agents_diff(a: &SessionState, b: &SessionState) -> AgentsDiff {
    let mut diff = AgentsDiff::default();
    for (id, result) in &b.agent_contexts {
        match a.agent_contexts.get(id) {
            None => diff.added.push(id.clone()),
            Some(old) if old != result => diff.changed.push(id.clone()),
            Some(_) => {}
        }
    }
    for id in a.agent_contexts.keys() {
        if !b.agent_contexts.contains_key(id) {
            diff.removed.push(id.clone());
        }
    }
    diff
}

fn history_diff(a: &SessionState, b: &SessionState) -> HistoryDiff {
    let common = a
        .history
        .iter()
        .zip(b.history.iter())
        .take_while(|(x, y)| x == y)
        .count();
    HistoryDiff {
        added: b.history[common..].to_vec(),
        removed: a.history.len() - common,
    }
}

/// Differences going from `a` to `b`.
pub fn compute_diff(a: &SessionState, b: &SessionState) -> SnapshotDiff {
    SnapshotDiff {
        workflow_diff: workflow_diff(a, b),
        agents_diff: agents_diff(a, b),
        history_diff: history_diff(a, b),
    }
}
