//! Shared fixtures for the integration suite.
//!
//! Tests run against the real store and vault (tempdir-backed) with a
//! programmable in-process script host, so every scenario is hermetic.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use personal_automator::config::{ExecutorConfig, SchedulerConfig};
use personal_automator::executor::host::{FnScriptHost, HostError, ScriptHost};
use personal_automator::executor::output::SharedConsole;
use personal_automator::executor::protocol::ScriptInput;
use personal_automator::store::types::{
    ParamSpec, ParamType, ScheduleType, TaskDraft, Template,
};
use personal_automator::{AppContext, Executor, Scheduler, Store, Vault};

/// A full daemon context over a tempdir, with the given script host.
pub struct TestDaemon {
    pub ctx: Arc<AppContext>,
    pub store: Arc<Store>,
    pub vault: Arc<Vault>,
    pub executor: Arc<Executor>,
    pub scheduler: Arc<Scheduler>,
    data_dir: tempfile::TempDir,
}

impl TestDaemon {
    /// Whether the vault's fallback key file has been created — a proxy for
    /// "the vault was invoked at least once".
    pub fn master_key_file_exists(&self) -> bool {
        self.data_dir.path().join("master.key").exists()
    }
}

/// Executor settings for tests: production defaults are already fast.
pub fn test_executor_config() -> ExecutorConfig {
    ExecutorConfig::default()
}

pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent: 4,
        stop_grace_secs: 5,
        retention_days: 30,
    }
}

/// Build a daemon over an in-memory store and a file-backed vault.
pub fn daemon_with_host(host: Arc<dyn ScriptHost>) -> TestDaemon {
    daemon_with_host_and_config(host, test_executor_config(), test_scheduler_config())
}

pub fn daemon_with_host_and_config(
    host: Arc<dyn ScriptHost>,
    executor_config: ExecutorConfig,
    scheduler_config: SchedulerConfig,
) -> TestDaemon {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let vault = Arc::new(Vault::file_only(data_dir.path()));
    let executor = Arc::new(Executor::new(
        Arc::clone(&store),
        Arc::clone(&vault),
        host,
        executor_config,
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&executor),
        scheduler_config,
    ));
    let ctx = Arc::new(AppContext::new(
        Arc::clone(&store),
        Arc::clone(&vault),
        Arc::clone(&executor),
        Arc::clone(&scheduler),
    ));
    TestDaemon {
        ctx,
        store,
        vault,
        executor,
        scheduler,
        data_dir,
    }
}

/// Host that echoes `params.message` to the console and returns it.
pub fn echo_host() -> Arc<dyn ScriptHost> {
    Arc::new(FnScriptHost(
        |input: ScriptInput, console: SharedConsole| async move {
            let message = input
                .params
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned();
            if let Ok(mut buffer) = console.lock() {
                buffer.push(
                    personal_automator::store::types::ConsoleLevel::Log,
                    message.clone(),
                );
            }
            Ok::<_, HostError>(Some(serde_json::Value::String(message)))
        },
    ))
}

/// A template with one required string parameter `message`.
pub fn message_template(id: &str) -> Template {
    Template {
        id: id.to_owned(),
        name: format!("{id} template"),
        description: None,
        category: Some("tests".to_owned()),
        code: "console.log(params.message);\nreturn params.message;".to_owned(),
        params_schema: vec![ParamSpec {
            name: "message".to_owned(),
            param_type: ParamType::String,
            required: true,
            default: None,
            description: None,
        }],
        required_credentials: Vec::new(),
        suggested_schedule: None,
        is_builtin: false,
    }
}

/// A template with no parameters at all.
pub fn bare_template(id: &str) -> Template {
    Template {
        id: id.to_owned(),
        name: format!("{id} template"),
        description: None,
        category: None,
        code: "return null;".to_owned(),
        params_schema: Vec::new(),
        required_credentials: Vec::new(),
        suggested_schedule: None,
        is_builtin: false,
    }
}

/// Draft for an interval task bound to `template_id`.
pub fn interval_draft(template_id: &str, name: &str, secs: &str) -> TaskDraft {
    TaskDraft {
        template_id: template_id.to_owned(),
        name: name.to_owned(),
        params: message_params("hi"),
        schedule_type: ScheduleType::Interval,
        schedule_value: secs.to_owned(),
        credentials: Vec::new(),
        enabled: true,
    }
}

/// Draft for an interval task with no parameter values.
pub fn interval_draft_no_params(template_id: &str, name: &str, secs: &str) -> TaskDraft {
    let mut draft = interval_draft(template_id, name, secs);
    draft.params = BTreeMap::new();
    draft
}

pub fn message_params(message: &str) -> BTreeMap<String, serde_json::Value> {
    let mut params = BTreeMap::new();
    params.insert("message".to_owned(), serde_json::json!(message));
    params
}
