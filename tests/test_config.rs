use std::io::Write;
use std::time::Duration;

use conductor::bus::OverflowPolicy;
use conductor::cli::ConductorConfig;
use tempfile::NamedTempFile;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();
    f
}

#[test]
fn load_valid_config_all_fields() {
    let yaml = r#"
host: "127.0.0.1"
port: 8080
store_dir: "custom/sessions"
workspace_dir: "custom/workspaces"
plan: "plans/report.yaml"
default_agent: "writer"
max_concurrent_steps: 3
step_timeout_s: 120
cancel_grace_s: 2.5
retry:
  max_retries: 2
  backoff_s: 0.5
agent_endpoint:
  url: "http://localhost:9000/invoke"
  api_key_env: "AGENT_TOKEN"
  timeout_s: 30
bus:
  subscriber_capacity: 50
  history_capacity: 200
  overflow_policy: drop_newest
  heartbeat_interval_s: 10
  sample_interval_s: 1
  alerts:
    - metric: running_steps
      above: 6
      message: "too busy"
"#;
    let f = write_config(yaml);
    let cfg = ConductorConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(cfg.port, Some(8080));
    assert_eq!(cfg.store_dir.as_deref(), Some("custom/sessions"));
    assert_eq!(cfg.workspace_dir.as_deref(), Some("custom/workspaces"));
    assert_eq!(cfg.plan.as_deref(), Some("plans/report.yaml"));
    assert_eq!(cfg.default_agent.as_deref(), Some("writer"));
    assert_eq!(cfg.max_concurrent_steps, Some(3));
    assert_eq!(cfg.step_timeout_s, Some(120.0));
    assert_eq!(cfg.retry.as_ref().unwrap().max_retries, 2);

    let endpoint = cfg.agent_endpoint.as_ref().unwrap();
    assert_eq!(endpoint.url, "http://localhost:9000/invoke");
    assert_eq!(endpoint.api_key_env.as_deref(), Some("AGENT_TOKEN"));

    assert_eq!(cfg.bus.queues.subscriber_capacity, 50);
    assert_eq!(cfg.bus.queues.history_capacity, 200);
    assert_eq!(cfg.bus.queues.overflow_policy, OverflowPolicy::DropNewest);
    assert_eq!(cfg.bus.heartbeat_interval_s, 10.0);
    assert_eq!(cfg.bus.alerts.len(), 1);
    assert_eq!(cfg.bus.alerts[0].above, Some(6.0));
}

#[test]
fn load_partial_config() {
    let f = write_config("port: 9090\n");
    let cfg = ConductorConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.port, Some(9090));
    assert!(cfg.host.is_none());
    assert!(cfg.store_dir.is_none());
    assert!(cfg.plan.is_none());
    assert!(cfg.agent_endpoint.is_none());
    assert!(cfg.agents.is_empty());
    assert_eq!(cfg.bus.queues.subscriber_capacity, 1000);
    assert_eq!(cfg.bus.queues.overflow_policy, OverflowPolicy::DropOldest);
    assert_eq!(cfg.bus.heartbeat_interval_s, 30.0);
}

#[test]
fn missing_explicit_path_returns_error() {
    let result = ConductorConfig::load(Some(std::path::Path::new("/nonexistent/conductor.yaml")));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Config file not found")
    );
}

#[test]
fn invalid_yaml_returns_error() {
    let f = write_config("port: [this is not valid yaml for a u16");
    let result = ConductorConfig::load(Some(f.path()));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file")
    );
}

#[test]
fn unknown_keys_are_ignored() {
    let f = write_config("port: 4000\nunknown_setting: true\n");
    let cfg = ConductorConfig::load(Some(f.path())).unwrap();
    assert_eq!(cfg.port, Some(4000));
}

// --- Derived settings ---

#[test]
fn orchestrator_settings_from_file() {
    let yaml = r#"
max_concurrent_steps: 3
step_timeout_s: 90
cancel_grace_s: 1.5
retry:
  max_retries: 4
  backoff_s: 0.25
"#;
    let f = write_config(yaml);
    let cfg = ConductorConfig::load(Some(f.path())).unwrap();
    let orch = cfg.orchestrator_config();

    if std::env::var("CONDUCTOR_MAX_CONCURRENT_STEPS").is_err() {
        assert_eq!(orch.max_concurrent_steps, 3);
    }
    assert_eq!(orch.step_timeout, Some(Duration::from_secs(90)));
    assert_eq!(orch.cancel_grace, Duration::from_millis(1500));
    assert_eq!(orch.default_retry.max_retries, 4);
}

#[test]
fn orchestrator_defaults_without_file_settings() {
    let orch = ConductorConfig::default().orchestrator_config();
    assert!(orch.max_concurrent_steps > 0);
    assert!(orch.step_timeout.is_none());
    assert_eq!(orch.cancel_grace, Duration::from_secs(5));
    assert_eq!(orch.default_retry.max_retries, 0);
}

#[test]
fn echo_backend_without_endpoint() {
    let backend = ConductorConfig::default().agent_backend().unwrap();
    assert_eq!(backend.name(), "echo");
}

#[test]
fn http_backend_with_endpoint() {
    let f = write_config("agent_endpoint:\n  url: \"http://localhost:9000/invoke\"\n");
    let cfg = ConductorConfig::load(Some(f.path())).unwrap();
    assert_eq!(cfg.agent_backend().unwrap().name(), "http");
}

#[test]
fn agent_overrides_and_additions() {
    let yaml = r#"
agents:
  writer:
    system_prompt: "Write tersely."
    max_turns: 2
  translator:
    description: "Translates documents"
    allowed_tools: [read_files, write_md]
"#;
    let f = write_config(yaml);
    let cfg = ConductorConfig::load(Some(f.path())).unwrap();
    let registry = cfg.agent_registry(cfg.agent_backend().unwrap());

    let writer = registry.profile("writer").unwrap();
    assert_eq!(writer.system_prompt, "Write tersely.");
    assert_eq!(writer.max_turns, 2);
    assert!(!writer.description.is_empty());

    let translator = registry.profile("translator").unwrap();
    assert_eq!(translator.description, "Translates documents");
    assert_eq!(translator.allowed_tools, vec!["read_files", "write_md"]);
    assert_eq!(translator.backend, "echo");
    assert!(registry.contains("translator"));
    assert!(registry.contains("researcher"));
}
