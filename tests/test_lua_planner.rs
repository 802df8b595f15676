//! Tests for Lua and YAML planners: plan building, sandbox security, errors.

use std::io::Write;
use std::sync::Arc;

use conductor::agents::AgentRegistry;
use conductor::agents::builtin::ScriptedInvoker;
use conductor::lua::LuaPlanner;
use conductor::planner::{Planner, SingleStepPlanner, StaticPlanner};

fn registry() -> AgentRegistry {
    AgentRegistry::with_defaults(Arc::new(ScriptedInvoker::echo()))
}

// --- LuaPlanner ---

#[test]
fn build_simple_plan() {
    let source = r#"
        local plan = Plan.new()
        plan:step("research", agents.researcher("Look into " .. goal))
        return plan
    "#;
    let steps = LuaPlanner::from_source(source, &registry())
        .evaluate("solar panels")
        .unwrap();

    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].id, "research");
    assert_eq!(steps[0].agent_kind, "researcher");
    assert_eq!(steps[0].task, "Look into solar panels");
    assert!(steps[0].dependencies.is_empty());
}

#[test]
fn builder_methods_fill_step_fields() {
    let source = r#"
        local plan = Plan.new()
        plan:step("a", agents.researcher({ task = "A" })):group("fan")
        plan:step("b", agents.researcher({ task = "B" })):group("fan")
        plan:step("fix", agents.coder("Patch things up"))
        plan:step("write", agents.writer("Write"))
            :depends_on("a", "b")
            :context("a", "b")
            :output("agent_outputs/report.md")
            :retries(2, 0.5)
            :timeout(30)
            :on_error("fix")
        return plan
    "#;
    let steps = LuaPlanner::from_source(source, &registry())
        .evaluate("goal")
        .unwrap();

    assert_eq!(steps.len(), 4);
    assert_eq!(steps[0].parallel_group.as_deref(), Some("fan"));
    assert_eq!(steps[1].parallel_group.as_deref(), Some("fan"));

    let write = &steps[3];
    assert_eq!(write.dependencies, vec!["a", "b"]);
    assert_eq!(write.context_refs, vec!["a", "b"]);
    assert_eq!(write.output_ref.as_deref(), Some("agent_outputs/report.md"));
    let retry = write.retry.as_ref().unwrap();
    assert_eq!(retry.max_retries, 2);
    assert_eq!(retry.backoff_s, 0.5);
    assert_eq!(write.timeout_s, Some(30.0));
    assert_eq!(write.on_error.as_deref(), Some("fix"));
}

#[test]
fn plans_can_branch_on_the_goal() {
    let source = r#"
        local plan = Plan.new()
        plan:step("research", agents.researcher("Research " .. goal))
        if string.find(goal, "code") then
            plan:step("build", agents.coder("Build it")):depends_on("research")
        end
        return plan
    "#;
    let planner = LuaPlanner::from_source(source, &registry());
    assert_eq!(planner.evaluate("write code").unwrap().len(), 2);
    assert_eq!(planner.evaluate("write prose").unwrap().len(), 1);
}

#[test]
fn sandbox_blocks_os_and_io() {
    let source = r#"
        local plan = Plan.new()
        local blocked = (os == nil) and (io == nil) and (require == nil)
        plan:step("check", agents.researcher(tostring(blocked)))
        return plan
    "#;
    let steps = LuaPlanner::from_source(source, &registry())
        .evaluate("x")
        .unwrap();
    assert_eq!(steps[0].task, "true");
}

#[test]
fn unknown_agent_kind_is_an_error() {
    let source = r#"
        local plan = Plan.new()
        plan:step("x", agents.astrologer("Read the stars"))
        return plan
    "#;
    assert!(LuaPlanner::from_source(source, &registry()).evaluate("x").is_err());
}

#[test]
fn script_must_return_a_plan() {
    let err = LuaPlanner::from_source("return 42", &registry())
        .evaluate("x")
        .unwrap_err();
    assert!(err.to_string().contains("Failed to evaluate plan script"), "{}", err);
}

#[test]
fn syntax_error_is_reported() {
    assert!(
        LuaPlanner::from_source("local plan = Plan.new(", &registry())
            .evaluate("x")
            .is_err()
    );
}

#[tokio::test]
async fn lua_planner_from_file() {
    let mut f = tempfile::Builder::new().suffix(".lua").tempfile().unwrap();
    f.write_all(
        br#"
        local plan = Plan.new()
        plan:step("only", agents.analyst("Analyze " .. goal))
        return plan
    "#,
    )
    .unwrap();

    let planner = LuaPlanner::from_file(f.path(), &registry()).unwrap();
    assert_eq!(planner.name(), "lua");
    let steps = planner.plan("sales").await.unwrap();
    assert_eq!(steps[0].task, "Analyze sales");
}

#[tokio::test(flavor = "current_thread")]
async fn long_script_does_not_stall_other_tasks() {
    let source = r#"
        local n = 0
        for i = 1, 30000000 do n = n + i end
        local plan = Plan.new()
        plan:step("only", agents.researcher(tostring(n > 0)))
        return plan
    "#;
    let planner = LuaPlanner::from_source(source, &registry());

    let ticks = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter = ticks.clone();
    let ticker = tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let started = std::time::Instant::now();
    let steps = planner.plan("x").await.unwrap();
    let elapsed = started.elapsed();
    ticker.abort();

    assert_eq!(steps[0].task, "true");
    // On a single-threaded runtime the ticker only advances if the script
    // ran elsewhere.
    if elapsed >= std::time::Duration::from_millis(100) {
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 3);
    }
}

// --- StaticPlanner ---

#[tokio::test]
async fn yaml_plan_substitutes_goal() {
    let yaml = r#"
name: report
steps:
  - id: research
    agent_kind: researcher
    task: "Research {{goal}}"
  - id: write
    agent_kind: writer
    task: "Write about {{goal}}"
    dependencies: [research]
    context_refs: [research]
    retry:
      max_retries: 1
      backoff_s: 2
"#;
    let planner = StaticPlanner::from_yaml_str(yaml).unwrap();
    assert_eq!(planner.name(), "report");

    let steps = planner.plan("tidal power").await.unwrap();
    assert_eq!(steps[0].task, "Research tidal power");
    assert_eq!(steps[1].task, "Write about tidal power");
    assert_eq!(steps[1].dependencies, vec!["research"]);
    assert_eq!(steps[1].retry.as_ref().unwrap().max_retries, 1);
}

#[test]
fn yaml_plan_requires_steps() {
    assert!(StaticPlanner::from_yaml_str("name: empty\n").is_err());
}

// --- SingleStepPlanner ---

#[tokio::test]
async fn single_step_plan() {
    let steps = SingleStepPlanner::new("writer").plan("A poem").await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].id, "main");
    assert_eq!(steps[0].agent_kind, "writer");
    assert_eq!(steps[0].task, "A poem");
    assert!(steps[0].output_ref.is_some());
}
