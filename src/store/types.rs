//! Entity types persisted by the store.
//!
//! Four entities make up the data model: [`Template`] (reusable script
//! recipe), [`Task`] (a bound template instance with a schedule),
//! [`Execution`] (one attempted run), and [`Credential`] (a named encrypted
//! secret). JSON-typed columns round-trip through these structs with serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value type a template parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
}

impl ParamType {
    /// Returns `true` when `value` conforms to this type.
    #[must_use]
    pub fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
        };
        f.write_str(label)
    }
}

/// One declared template parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name as seen by the script (`params.<name>`).
    pub name: String,
    /// Accepted value type.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Whether the task must supply a value.
    #[serde(default)]
    pub required: bool,
    /// Default substituted when an optional parameter is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A reusable script recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Opaque unique identifier (case-sensitive).
    pub id: String,
    /// Unique human-readable name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// User script source text.
    pub code: String,
    /// Ordered parameter declarations.
    #[serde(default)]
    pub params_schema: Vec<ParamSpec>,
    /// Credential names the script expects to be granted.
    #[serde(default)]
    pub required_credentials: Vec<String>,
    /// Suggested schedule shown to operators (informational only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_schedule: Option<String>,
    /// Built-in templates cannot be deleted and keep this flag forever.
    #[serde(default)]
    pub is_builtin: bool,
}

/// Fields an operator may change on an existing template.
///
/// `id` and `is_builtin` are immutable and deliberately absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplatePatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub category: Option<Option<String>>,
    pub code: Option<String>,
    pub params_schema: Option<Vec<ParamSpec>>,
    pub required_credentials: Option<Vec<String>>,
    pub suggested_schedule: Option<Option<String>>,
}

/// How a task's fire times are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    /// 5-field cron expression, UTC.
    Cron,
    /// Single RFC 3339 instant.
    Once,
    /// Fixed interval in whole seconds.
    Interval,
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Cron => "cron",
            Self::Once => "once",
            Self::Interval => "interval",
        };
        f.write_str(label)
    }
}

/// Parameter values bound to a task, keyed by parameter name.
pub type ParamValues = BTreeMap<String, serde_json::Value>;

/// A scheduled instance of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub template_id: String,
    /// Unique task name.
    pub name: String,
    /// Values for the template's declared parameters.
    #[serde(default)]
    pub params: ParamValues,
    pub schedule_type: ScheduleType,
    /// Cron expression, RFC 3339 timestamp, or integer seconds depending on
    /// `schedule_type`.
    pub schedule_value: String,
    /// Credential names this task is allowed to read at run time.
    #[serde(default)]
    pub credentials: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Operator input for creating a task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDraft {
    pub template_id: String,
    pub name: String,
    #[serde(default)]
    pub params: ParamValues,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    #[serde(default)]
    pub credentials: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Fields an operator may change on an existing task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub params: Option<ParamValues>,
    pub schedule_type: Option<ScheduleType>,
    pub schedule_value: Option<String>,
    pub credentials: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

/// Filters for task listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    /// Only tasks with this enabled state.
    pub enabled: Option<bool>,
    /// Only tasks bound to this template.
    pub template_id: Option<String>,
    /// Only tasks whose most recent execution failed or timed out.
    pub has_errors: Option<bool>,
}

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    /// Returns `true` for statuses an execution can never leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

/// Console line severity inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

/// One captured console line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub level: ConsoleLevel,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Structured output of a finished execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Ordered console lines captured during the run.
    #[serde(default)]
    pub console: Vec<ConsoleLine>,
    /// The script's returned value, when JSON-serialisable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
}

/// One attempted run of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub task_id: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ExecutionOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Filters for execution listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionFilter {
    pub task_id: Option<i64>,
    pub status: Option<ExecutionStatus>,
    /// Inclusive lower bound on `started_at`.
    pub start_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `started_at`.
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// A page of executions plus the unpaged total.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPage {
    pub items: Vec<Execution>,
    pub total: u64,
}

/// Kind of secret a credential holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    ApiKey,
    OauthToken,
    EnvVar,
    Secret,
}

impl std::fmt::Display for CredentialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::ApiKey => "api_key",
            Self::OauthToken => "oauth_token",
            Self::EnvVar => "env_var",
            Self::Secret => "secret",
        };
        f.write_str(label)
    }
}

/// A named secret. The value, when set, is an opaque encrypted blob; the
/// plaintext exists only transiently inside the executor.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: i64,
    pub name: String,
    pub credential_type: CredentialType,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Base64 `version ‖ nonce ‖ ciphertext` blob, absent for metadata-only
    /// credentials.
    pub encrypted_value: Option<String>,
}

/// Listing view of a credential. Carries only `has_value`, never the blob
/// or plaintext.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialInfo {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub has_value: bool,
}

impl Credential {
    /// Project this credential into its listing view.
    #[must_use]
    pub fn info(&self) -> CredentialInfo {
        CredentialInfo {
            id: self.id,
            name: self.name.clone(),
            credential_type: self.credential_type,
            description: self.description.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            has_value: self.encrypted_value.is_some(),
        }
    }
}

/// Aggregate counts for the system status operation.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub tasks: u64,
    pub enabled_tasks: u64,
    pub executions: u64,
    pub credentials: u64,
    pub templates: u64,
    /// Executions currently `running`.
    pub pending_executions: u64,
    /// Executions that failed or timed out within the last 24 hours.
    pub recent_errors: u64,
    /// Executions started within the last 24 hours.
    pub executions_24h: u64,
    /// Successful executions within the last 24 hours.
    pub successes_24h: u64,
    /// Executions with `status = failed` within the last 24 hours.
    pub failed_24h: u64,
}
