//! Tests for plan validation, scheduling and live plan edits.

use std::sync::Arc;

use conductor::agents::AgentRegistry;
use conductor::agents::builtin::ScriptedInvoker;
use conductor::engine::dag::*;
use conductor::engine::types::*;
use conductor::error::OrchestratorError;

fn registry() -> AgentRegistry {
    AgentRegistry::with_defaults(Arc::new(ScriptedInvoker::echo()))
}

fn session_with(steps: Vec<StepSpec>) -> WorkflowSession {
    let mut session = WorkflowSession::new("s1", "goal");
    session.set_steps(steps);
    session.status = SessionStatus::Running;
    session
}

fn ids(session: &WorkflowSession, indices: &[usize]) -> Vec<String> {
    indices.iter().map(|&i| session.steps[i].id.clone()).collect()
}

// --- Topological phases ---

#[test]
fn phases_follow_dependencies() {
    let steps = vec![
        StepSpec::new("a", "researcher", "A"),
        StepSpec::new("b", "researcher", "B"),
        StepSpec::new("c", "writer", "C").depends_on(["a", "b"]),
        StepSpec::new("d", "writer", "D").depends_on(["c"]),
    ];
    let phases = execution_phases(&steps).unwrap();
    assert_eq!(phases, vec![vec!["a", "b"], vec!["c"], vec!["d"]]);
}

#[test]
fn phases_reject_cycles() {
    let steps = vec![
        StepSpec::new("a", "researcher", "A").depends_on(["b"]),
        StepSpec::new("b", "researcher", "B").depends_on(["a"]),
    ];
    let err = execution_phases(&steps).unwrap_err();
    assert!(err.contains("Cycle detected"), "{}", err);
}

#[test]
fn phases_reject_missing_dependency() {
    let steps = vec![StepSpec::new("a", "researcher", "A").depends_on(["ghost"])];
    let err = execution_phases(&steps).unwrap_err();
    assert!(err.contains("'ghost'"), "{}", err);
}

// --- Plan validation ---

#[test]
fn valid_plan_passes() {
    let steps = vec![
        StepSpec::new("a", "researcher", "A"),
        StepSpec::new("b", "writer", "B")
            .depends_on(["a"])
            .with_context(["a"])
            .with_on_error("c"),
        StepSpec::new("c", "writer", "C"),
    ];
    assert!(validate_plan(&steps, &registry()).is_ok());
}

#[test]
fn empty_plan_is_rejected() {
    let errors = plan_errors(&[], None);
    assert_eq!(errors, vec!["Plan has no steps"]);
}

#[test]
fn plan_errors_are_collected() {
    let steps = vec![
        StepSpec::new("a", "astrologer", "A"),
        StepSpec::new("a", "writer", "dup"),
        StepSpec::new("b", "writer", "B")
            .depends_on(["b"])
            .with_context(["nowhere"])
            .with_on_error("missing"),
    ];
    let errors = plan_errors(&steps, Some(&registry()));
    let joined = errors.join("\n");
    assert!(joined.contains("unknown agent kind 'astrologer'"), "{}", joined);
    assert!(joined.contains("Duplicate step id 'a'"), "{}", joined);
    assert!(joined.contains("'b' depends on itself"), "{}", joined);
    assert!(joined.contains("'nowhere'"), "{}", joined);
    assert!(joined.contains("'missing'"), "{}", joined);
}

#[test]
fn handler_may_not_depend_on_its_origin() {
    let steps = vec![
        StepSpec::new("a", "researcher", "A").with_on_error("h"),
        StepSpec::new("h", "writer", "H").depends_on(["a"]),
    ];
    let errors = plan_errors(&steps, None);
    assert!(errors.iter().any(|e| e.contains("cannot depend on 'a'")));
}

#[test]
fn validate_plan_reports_planning_error() {
    let steps = vec![StepSpec::new("a", "astrologer", "A")];
    match validate_plan(&steps, &registry()) {
        Err(OrchestratorError::WorkflowPlanning(msg)) => assert!(msg.contains("astrologer")),
        other => panic!("unexpected: {:?}", other),
    }
}

// --- Scheduling ---

#[test]
fn ready_steps_wait_for_dependencies() {
    let mut session = session_with(vec![
        StepSpec::new("a", "researcher", "A"),
        StepSpec::new("b", "writer", "B").depends_on(["a"]),
    ]);
    assert_eq!(ids(&session, &ready_steps(&session)), vec!["a"]);

    session.set_step_status("a", StepStatus::Completed);
    assert_eq!(ids(&session, &ready_steps(&session)), vec!["b"]);

    session.set_step_status("b", StepStatus::Running);
    assert!(ready_steps(&session).is_empty());
}

#[test]
fn error_handler_runs_only_after_failure() {
    let mut session = session_with(vec![
        StepSpec::new("a", "researcher", "A").with_on_error("fallback"),
        StepSpec::new("fallback", "researcher", "F"),
        StepSpec::new("b", "writer", "B").depends_on(["a"]),
    ]);
    assert!(error_handlers(&session.steps).contains("fallback"));
    assert_eq!(ids(&session, &ready_steps(&session)), vec!["a"]);

    session.set_step_status("a", StepStatus::Failed);
    // Failure with a live handler does not doom dependents yet.
    assert!(propagate_skips(&mut session).is_empty());
    assert_eq!(ids(&session, &ready_steps(&session)), vec!["fallback"]);

    session.set_step_status("fallback", StepStatus::Completed);
    assert_eq!(mark_recovered(&mut session, "fallback"), vec!["a"]);
    assert_eq!(session.step_status("a"), StepStatus::Recovered);
    assert_eq!(ids(&session, &ready_steps(&session)), vec!["b"]);
}

#[test]
fn failure_skips_transitive_dependents() {
    let mut session = session_with(vec![
        StepSpec::new("a", "researcher", "A"),
        StepSpec::new("b", "writer", "B").depends_on(["a"]),
        StepSpec::new("c", "writer", "C").depends_on(["b"]),
        StepSpec::new("d", "writer", "D"),
    ]);
    session.set_step_status("a", StepStatus::Failed);
    let skipped = propagate_skips(&mut session);
    assert_eq!(skipped, vec!["b", "c"]);
    assert_eq!(session.step_status("d"), StepStatus::Pending);
}

#[test]
fn failed_handler_dooms_dependents() {
    let mut session = session_with(vec![
        StepSpec::new("a", "researcher", "A").with_on_error("h"),
        StepSpec::new("h", "researcher", "H"),
        StepSpec::new("b", "writer", "B").depends_on(["a"]),
    ]);
    session.set_step_status("a", StepStatus::Failed);
    session.set_step_status("h", StepStatus::Failed);
    assert_eq!(propagate_skips(&mut session), vec!["b"]);
}

#[test]
fn groups_collect_shared_hints() {
    let session = session_with(vec![
        StepSpec::new("a", "researcher", "A").in_group("fan"),
        StepSpec::new("b", "researcher", "B"),
        StepSpec::new("c", "researcher", "C").in_group("fan"),
        StepSpec::new("d", "researcher", "D"),
    ]);
    let ready = ready_steps(&session);
    let groups = parallel_groups(&session, &ready);
    assert_eq!(groups, vec![vec![0, 2], vec![1], vec![3]]);
}

#[test]
fn leftovers_are_skipped() {
    let mut session = session_with(vec![
        StepSpec::new("a", "researcher", "A"),
        StepSpec::new("b", "writer", "B"),
    ]);
    session.set_step_status("a", StepStatus::Completed);
    assert_eq!(skip_leftovers(&mut session), vec!["b"]);
    assert_eq!(session.step_status("b"), StepStatus::Skipped);
}

// --- Live edits ---

#[test]
fn insert_and_update_pending_steps() {
    let mut session = session_with(vec![
        StepSpec::new("a", "researcher", "A"),
        StepSpec::new("b", "writer", "B").depends_on(["a"]),
    ]);
    session.set_step_status("a", StepStatus::Completed);

    let applied = apply_edits(
        &mut session,
        &[
            StepEdit::Insert {
                step: StepSpec::new("review", "analyst", "Review").depends_on(["b"]),
                position: None,
            },
            StepEdit::Update {
                step_id: "b".to_string(),
                task: Some("Write it better".to_string()),
                agent_kind: None,
                dependencies: None,
                context_refs: Some(vec!["a".to_string()]),
                parallel_group: None,
            },
        ],
        &registry(),
    )
    .unwrap();

    assert_eq!(applied, vec!["inserted 'review' at 2", "updated 'b'"]);
    assert_eq!(session.steps.len(), 3);
    assert_eq!(session.step_status("review"), StepStatus::Pending);
    assert_eq!(session.step("b").unwrap().task, "Write it better");
}

#[test]
fn edits_are_atomic() {
    let mut session = session_with(vec![
        StepSpec::new("a", "researcher", "A"),
        StepSpec::new("b", "writer", "B").depends_on(["a"]),
    ]);
    let before = session.clone();

    // Second edit introduces a cycle, so the first must not stick either.
    let err = apply_edits(
        &mut session,
        &[
            StepEdit::Insert {
                step: StepSpec::new("c", "writer", "C"),
                position: Some(0),
            },
            StepEdit::Update {
                step_id: "a".to_string(),
                task: None,
                agent_kind: None,
                dependencies: Some(vec!["b".to_string()]),
                context_refs: None,
                parallel_group: None,
            },
        ],
        &registry(),
    )
    .unwrap_err();

    assert!(matches!(err, OrchestratorError::InvalidModification(ref m) if m.contains("Cycle")));
    assert_eq!(session, before);
}

#[test]
fn started_steps_cannot_be_edited() {
    let mut session = session_with(vec![
        StepSpec::new("a", "researcher", "A"),
        StepSpec::new("b", "writer", "B"),
    ]);
    session.set_step_status("a", StepStatus::Running);
    let err = apply_edits(
        &mut session,
        &[StepEdit::Remove {
            step_id: "a".to_string(),
        }],
        &registry(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("already running"), "{}", err);
}

#[test]
fn referenced_steps_cannot_be_removed() {
    let mut session = session_with(vec![
        StepSpec::new("a", "researcher", "A"),
        StepSpec::new("b", "writer", "B").depends_on(["a"]),
    ]);
    let err = apply_edits(
        &mut session,
        &[StepEdit::Remove {
            step_id: "a".to_string(),
        }],
        &registry(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("still referenced by 'b'"), "{}", err);
}

#[test]
fn finished_sessions_reject_edits() {
    let mut session = session_with(vec![StepSpec::new("a", "researcher", "A")]);
    session.status = SessionStatus::Completed;
    let err = apply_edits(
        &mut session,
        &[StepEdit::Remove {
            step_id: "a".to_string(),
        }],
        &registry(),
    )
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidModification(_)));
}

#[test]
fn step_edit_wire_format() {
    let edit: StepEdit = serde_json::from_value(serde_json::json!({
        "op": "move",
        "step_id": "b",
        "position": 0
    }))
    .unwrap();
    assert_eq!(
        edit,
        StepEdit::Move {
            step_id: "b".to_string(),
            position: 0
        }
    );
}

#[test]
fn update_can_clear_a_parallel_group() {
    let mut session = session_with(vec![
        StepSpec::new("a", "researcher", "A").in_group("fan"),
        StepSpec::new("b", "writer", "B").in_group("fan"),
    ]);

    let untouched: StepEdit = serde_json::from_value(serde_json::json!({
        "op": "update",
        "step_id": "a",
        "task": "A again"
    }))
    .unwrap();
    let cleared: StepEdit = serde_json::from_value(serde_json::json!({
        "op": "update",
        "step_id": "b",
        "parallel_group": null
    }))
    .unwrap();
    assert!(matches!(
        cleared,
        StepEdit::Update { parallel_group: Some(None), .. }
    ));

    apply_edits(&mut session, &[untouched, cleared], &registry()).unwrap();
    assert_eq!(session.step("a").unwrap().parallel_group.as_deref(), Some("fan"));
    assert_eq!(session.step("a").unwrap().task, "A again");
    assert_eq!(session.step("b").unwrap().parallel_group, None);
}
