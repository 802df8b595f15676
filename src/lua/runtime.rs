use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use mlua::prelude::*;

use crate::agents::AgentRegistry;
use crate::engine::types::{RetryPolicy, StepSpec};
use crate::planner::Planner;

/// Planner that evaluates a sandboxed Lua plan script.
///
/// The script sees the goal as the global `goal`, one factory per agent kind
/// under `agents`, and a `Plan` builder:
///
/// ```lua
/// local plan = Plan.new()
/// plan:step("research", agents.researcher({ task = "Research " .. goal }))
///     :group("discovery")
/// plan:step("write", agents.writer("Write the report"))
///     :depends_on("research"):context("research"):retries(2, 0.5)
/// return plan
/// ```
#[derive(Clone)]
pub struct LuaPlanner {
    source: String,
    chunk_name: String,
    kinds: Vec<String>,
}

impl LuaPlanner {
    /// Load a plan script from a file.
    pub fn from_file(path: &Path, registry: &AgentRegistry) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read plan script '{}': {}", path.display(), e)
        })?;
        Ok(Self {
            source,
            chunk_name: path.display().to_string(),
            kinds: registry.kinds(),
        })
    }

    /// Use an inline plan script.
    pub fn from_source(source: &str, registry: &AgentRegistry) -> Self {
        Self {
            source: source.to_string(),
            chunk_name: "<inline>".to_string(),
            kinds: registry.kinds(),
        }
    }

    /// Evaluate the script for `goal`.
    pub fn evaluate(&self, goal: &str) -> Result<Vec<StepSpec>> {
        let lua = Lua::new();
        Self::setup_sandbox(&lua)?;
        self.register_plan_api(&lua)?;
        lua.globals().set("goal", goal)?;

        let plan_table: LuaTable = lua
            .load(&self.source)
            .set_name(&self.chunk_name)
            .eval()
            .map_err(|e| {
                anyhow::anyhow!("Failed to evaluate plan script '{}': {}", self.chunk_name, e)
            })?;

        Self::extract_steps(&plan_table)
    }

    fn setup_sandbox(lua: &Lua) -> Result<()> {
        let globals = lua.globals();
        for name in &["os", "io", "debug", "loadfile", "dofile", "require"] {
            globals.set(*name, LuaValue::Nil)?;
        }

        // env(key) reads an environment variable, nil if unset
        let env_fn = lua.create_function(|lua_ctx, key: String| match std::env::var(&key) {
            Ok(val) => Ok(LuaValue::String(lua_ctx.create_string(&val)?)),
            Err(_) => Ok(LuaValue::Nil),
        })?;
        globals.set("env", env_fn)?;

        Ok(())
    }

    fn register_plan_api(&self, lua: &Lua) -> Result<()> {
        let globals = lua.globals();

        let plan_constructor = lua.create_table()?;
        let new_fn = lua.create_function(|lua, ()| {
            let plan = lua.create_table()?;
            plan.set("_steps", lua.create_table()?)?;

            // plan:step(id, agent_config) -> step builder
            let step_fn = lua.create_function(
                |lua, (plan_tbl, step_id, agent): (LuaTable, String, LuaTable)| {
                    let steps: LuaTable = plan_tbl.get("_steps")?;

                    let step = lua.create_table()?;
                    step.set("id", step_id)?;
                    step.set("agent_kind", agent.get::<String>("_agent_kind")?)?;
                    step.set("task", agent.get::<Option<String>>("task")?.unwrap_or_default())?;
                    step.set("dependencies", lua.create_table()?)?;
                    step.set("context_refs", lua.create_table()?)?;
                    steps.push(step.clone())?;

                    let builder = lua.create_table()?;
                    builder.set("_step", step)?;
                    Self::register_builder_methods(lua, &builder)?;
                    Ok(builder)
                },
            )?;
            plan.set("step", step_fn)?;
            Ok(plan)
        })?;
        plan_constructor.set("new", new_fn)?;
        globals.set("Plan", plan_constructor)?;

        // agents.<kind>(task_or_table) tags the config with its kind
        let agents_table = lua.create_table()?;
        for kind in &self.kinds {
            let kind_owned = kind.clone();
            let factory = lua.create_function(move |lua, arg: LuaValue| {
                let tbl = match arg {
                    LuaValue::Table(t) => t,
                    LuaValue::String(s) => {
                        let t = lua.create_table()?;
                        t.set("task", s)?;
                        t
                    }
                    LuaValue::Nil => lua.create_table()?,
                    _ => {
                        return Err(LuaError::RuntimeError(
                            "agent factory expects a task string or a config table".into(),
                        ));
                    }
                };
                tbl.set("_agent_kind", kind_owned.clone())?;
                Ok(tbl)
            })?;
            agents_table.set(kind.as_str(), factory)?;
        }
        globals.set("agents", agents_table)?;

        Ok(())
    }

    fn register_builder_methods(lua: &Lua, builder: &LuaTable) -> LuaResult<()> {
        // builder:depends_on(...) / builder:context(...)
        for (method, field) in [("depends_on", "dependencies"), ("context", "context_refs")] {
            let list_fn = lua.create_function(move |_lua, args: LuaMultiValue| {
                let mut iter = args.into_iter();
                let builder = match iter.next() {
                    Some(LuaValue::Table(t)) => t,
                    _ => return Err(LuaError::RuntimeError("expected self".into())),
                };
                let step: LuaTable = builder.get("_step")?;
                let list: LuaTable = step.get(field)?;
                for arg in iter {
                    if let LuaValue::String(s) = arg {
                        list.push(s.to_str()?.to_string())?;
                    }
                }
                Ok(builder)
            })?;
            builder.set(method, list_fn)?;
        }

        // builder:group(name) / builder:output(path) / builder:on_error(step)
        for (method, field) in [
            ("group", "parallel_group"),
            ("output", "output_ref"),
            ("on_error", "on_error"),
        ] {
            let set_fn = lua.create_function(move |_lua, (builder, value): (LuaTable, String)| {
                let step: LuaTable = builder.get("_step")?;
                step.set(field, value)?;
                Ok(builder)
            })?;
            builder.set(method, set_fn)?;
        }

        // builder:retries(max, backoff)
        let retries_fn = lua.create_function(
            |_lua, (builder, max, backoff): (LuaTable, u32, Option<f64>)| {
                let step: LuaTable = builder.get("_step")?;
                step.set("max_retries", max)?;
                step.set("backoff_s", backoff.unwrap_or(1.0))?;
                Ok(builder)
            },
        )?;
        builder.set("retries", retries_fn)?;

        // builder:timeout(seconds)
        let timeout_fn = lua.create_function(|_lua, (builder, seconds): (LuaTable, f64)| {
            let step: LuaTable = builder.get("_step")?;
            step.set("timeout_s", seconds)?;
            Ok(builder)
        })?;
        builder.set("timeout", timeout_fn)?;

        Ok(())
    }

    fn extract_steps(plan_table: &LuaTable) -> Result<Vec<StepSpec>> {
        let steps_table: LuaTable = plan_table
            .get("_steps")
            .map_err(|e| anyhow::anyhow!("Plan script must return a Plan: {}", e))?;

        let mut steps = Vec::new();
        for entry in steps_table.sequence_values::<LuaTable>() {
            let step = entry?;

            let max_retries: Option<u32> = step.get("max_retries")?;
            let retry = match max_retries {
                Some(max_retries) => Some(RetryPolicy {
                    max_retries,
                    backoff_s: step.get::<Option<f64>>("backoff_s")?.unwrap_or(1.0),
                }),
                None => None,
            };

            steps.push(StepSpec {
                id: step.get("id")?,
                agent_kind: step.get("agent_kind")?,
                task: step.get("task")?,
                dependencies: string_list(&step.get("dependencies")?)?,
                context_refs: string_list(&step.get("context_refs")?)?,
                output_ref: step.get("output_ref")?,
                parallel_group: step.get("parallel_group")?,
                retry,
                timeout_s: step.get("timeout_s")?,
                on_error: step.get("on_error")?,
            });
        }

        Ok(steps)
    }
}

fn string_list(table: &LuaTable) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for value in table.sequence_values::<String>() {
        out.push(value?);
    }
    Ok(out)
}

#[async_trait]
impl Planner for LuaPlanner {
    fn name(&self) -> &str {
        "lua"
    }

    /// Scripts run on the blocking pool.
    async fn plan(&self, goal: &str) -> Result<Vec<StepSpec>> {
        let planner = self.clone();
        let goal = goal.to_string();
        tokio::task::spawn_blocking(move || planner.evaluate(&goal))
            .await
            .map_err(|e| anyhow::anyhow!("Plan script task failed: {}", e))?
    }
}
