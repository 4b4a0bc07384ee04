//! Adapter-neutral control-plane operations.
//!
//! Both the HTTP and the stdio JSON-RPC adapters call through here, so
//! validation, referential guards, and the never-expose-plaintext rule live
//! in exactly one place. Every mutation of a task ends by waking the
//! scheduler.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::{ExecuteOptions, ExecutionOutcome, Executor, validate_params};
use crate::scheduler::Scheduler;
use crate::scheduler::fire_time::ScheduleSpec;
use crate::store::Store;
use crate::store::types::{
    Credential, CredentialInfo, CredentialType, Execution, ExecutionFilter, ExecutionPage, Task,
    TaskDraft, TaskFilter, TaskPatch, Template, TemplatePatch,
};
use crate::vault::Vault;
use crate::{AutomatorError, Result};

/// Everything the control-plane adapters need, behind one handle.
pub struct AppContext {
    pub store: Arc<Store>,
    pub vault: Arc<Vault>,
    pub executor: Arc<Executor>,
    pub scheduler: Arc<Scheduler>,
    started_at: Instant,
}

/// Operator input for creating a credential.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialDraft {
    pub name: String,
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    #[serde(default)]
    pub description: Option<String>,
    /// Plaintext secret; omitted for metadata-only credentials. Encrypted
    /// before it touches the store and never echoed back.
    #[serde(default)]
    pub value: Option<String>,
}

/// System status payload for the `status` operation.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub scheduler_running: bool,
    pub active_jobs: usize,
    pub next_execution: Option<DateTime<Utc>>,
    pub db_connected: bool,
    pub counts: StatusCounts,
    pub recent_activity: RecentActivity,
    pub uptime_seconds: u64,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCounts {
    pub tasks: u64,
    pub enabled_tasks: u64,
    pub executions: u64,
    pub credentials: u64,
    pub templates: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentActivity {
    pub executions_24h: u64,
    pub success_rate: f64,
    pub failed_count: u64,
    pub pending_count: u64,
    pub recent_errors: u64,
}

impl AppContext {
    /// Wire up the context over already-constructed subsystems.
    pub fn new(
        store: Arc<Store>,
        vault: Arc<Vault>,
        executor: Arc<Executor>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            store,
            vault,
            executor,
            scheduler,
            started_at: Instant::now(),
        }
    }

    // ── Templates ───────────────────────────────────────────────────────────

    pub fn list_templates(&self, category: Option<&str>) -> Result<Vec<Template>> {
        Ok(self.store.list_templates(category)?)
    }

    pub fn get_template(&self, id: &str) -> Result<Template> {
        Ok(self.store.get_template(id)?)
    }

    pub fn create_template(&self, mut template: Template) -> Result<Template> {
        if template.id.trim().is_empty() {
            return Err(AutomatorError::Validation("template id must not be empty".into()));
        }
        if template.name.trim().is_empty() {
            return Err(AutomatorError::Validation("template name must not be empty".into()));
        }
        if template.code.trim().is_empty() {
            return Err(AutomatorError::Validation("template code must not be empty".into()));
        }
        // Only seeding may mark templates built-in.
        template.is_builtin = false;
        self.store.insert_template(&template)?;
        Ok(self.store.get_template(&template.id)?)
    }

    pub fn update_template(&self, id: &str, patch: &TemplatePatch) -> Result<Template> {
        if let Some(name) = &patch.name
            && name.trim().is_empty()
        {
            return Err(AutomatorError::Validation("template name must not be empty".into()));
        }
        if let Some(code) = &patch.code
            && code.trim().is_empty()
        {
            return Err(AutomatorError::Validation("template code must not be empty".into()));
        }
        Ok(self.store.update_template(id, patch)?)
    }

    pub fn delete_template(&self, id: &str) -> Result<()> {
        Ok(self.store.delete_template(id)?)
    }

    // ── Tasks ───────────────────────────────────────────────────────────────

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(filter)?)
    }

    pub fn get_task(&self, id: i64) -> Result<Task> {
        Ok(self.store.get_task(id)?)
    }

    /// Create a task: the template must exist, every granted credential
    /// must exist, params must conform to the template schema, and the
    /// schedule must parse. `next_run_at` is computed here.
    pub fn create_task(&self, draft: TaskDraft) -> Result<Task> {
        if draft.name.trim().is_empty() {
            return Err(AutomatorError::Validation("task name must not be empty".into()));
        }
        let template = self.store.get_template(&draft.template_id)?;
        validate_params(&template.params_schema, &draft.params)
            .map_err(AutomatorError::Validation)?;
        self.check_credentials_exist(&draft.credentials)?;
        let spec = ScheduleSpec::parse(draft.schedule_type, &draft.schedule_value)?;

        let now = Utc::now();
        let next_run_at = if draft.enabled {
            spec.next_fire(None, now)
        } else {
            None
        };
        let task = self.store.insert_task(&draft, next_run_at, now)?;
        self.scheduler.on_task_changed(task.id);
        Ok(task)
    }

    /// Patch a task, revalidating whatever changed and recomputing
    /// `next_run_at`.
    pub fn update_task(&self, id: i64, patch: TaskPatch) -> Result<Task> {
        let current = self.store.get_task(id)?;
        let template = self.store.get_template(&current.template_id)?;

        let params = patch.params.as_ref().unwrap_or(&current.params);
        validate_params(&template.params_schema, params).map_err(AutomatorError::Validation)?;
        if let Some(credentials) = &patch.credentials {
            self.check_credentials_exist(credentials)?;
        }

        let schedule_type = patch.schedule_type.unwrap_or(current.schedule_type);
        let schedule_value = patch
            .schedule_value
            .as_deref()
            .unwrap_or(&current.schedule_value);
        let spec = ScheduleSpec::parse(schedule_type, schedule_value)?;

        let now = Utc::now();
        let enabled = patch.enabled.unwrap_or(current.enabled);
        let next_run_at = if enabled {
            spec.next_fire(current.last_run_at, now)
        } else {
            None
        };
        let task = self.store.update_task(id, &patch, next_run_at, now)?;
        self.scheduler.on_task_changed(id);
        Ok(task)
    }

    pub fn delete_task(&self, id: i64) -> Result<()> {
        self.store.delete_task(id)?;
        self.scheduler.on_task_changed(id);
        Ok(())
    }

    /// Flip `enabled`; an enabled task gets a fresh `next_run_at`, a
    /// disabled one loses it.
    pub fn toggle_task(&self, id: i64) -> Result<Task> {
        let current = self.store.get_task(id)?;
        let now = Utc::now();
        let enabled = !current.enabled;
        let next_run_at = if enabled {
            let spec = ScheduleSpec::parse(current.schedule_type, &current.schedule_value)?;
            spec.next_fire(current.last_run_at, now)
        } else {
            None
        };
        let task = self.store.set_task_enabled(id, enabled, next_run_at, now)?;
        self.scheduler.on_task_changed(id);
        Ok(task)
    }

    /// Synchronous one-shot run outside the scheduler. Serialises against
    /// scheduled runs of the same task: a busy task yields `conflict`.
    pub async fn execute_task(
        &self,
        id: i64,
        timeout_ms: Option<u64>,
    ) -> Result<ExecutionOutcome> {
        self.executor
            .execute(id, ExecuteOptions { timeout_ms })
            .await
    }

    // ── Executions ──────────────────────────────────────────────────────────

    pub fn list_executions(&self, filter: &ExecutionFilter) -> Result<ExecutionPage> {
        Ok(self.store.list_executions(filter)?)
    }

    pub fn get_execution(&self, id: i64) -> Result<Execution> {
        Ok(self.store.get_execution(id)?)
    }

    // ── Credentials ─────────────────────────────────────────────────────────

    /// List credentials with their value status. Plaintext never leaves the
    /// executor; listings only carry `has_value`.
    pub fn list_credentials(&self) -> Result<Vec<CredentialInfo>> {
        Ok(self
            .store
            .list_credentials()?
            .iter()
            .map(Credential::info)
            .collect())
    }

    /// Create a credential; a supplied plaintext value is encrypted first.
    pub fn create_credential(&self, draft: CredentialDraft) -> Result<CredentialInfo> {
        if draft.name.trim().is_empty() {
            return Err(AutomatorError::Validation("credential name must not be empty".into()));
        }
        let blob = draft.value.as_deref().map(|v| self.vault.encrypt(v)).transpose()?;
        let credential = self.store.insert_credential(
            &draft.name,
            draft.credential_type,
            draft.description.as_deref(),
            blob.as_deref(),
            Utc::now(),
        )?;
        Ok(credential.info())
    }

    /// Set or replace a credential's value.
    pub fn update_credential_value(&self, name: &str, value: &str) -> Result<()> {
        // Surface not_found before paying for the encryption.
        self.store.get_credential(name)?;
        let blob = self.vault.encrypt(value)?;
        Ok(self.store.set_credential_value(name, Some(&blob))?)
    }

    /// Drop a credential's value, keeping the metadata.
    pub fn clear_credential_value(&self, name: &str) -> Result<()> {
        Ok(self.store.set_credential_value(name, None)?)
    }

    /// Delete a credential. Refused while a task's grant list references it.
    pub fn delete_credential(&self, id: i64) -> Result<()> {
        Ok(self.store.delete_credential(id)?)
    }

    // ── System ──────────────────────────────────────────────────────────────

    pub fn status(&self) -> Result<SystemStatus> {
        let now = Utc::now();
        let stats = self.store.stats(now)?;
        let success_rate = if stats.executions_24h > 0 {
            stats.successes_24h as f64 / stats.executions_24h as f64
        } else {
            0.0
        };
        Ok(SystemStatus {
            scheduler_running: self.scheduler.is_running(),
            active_jobs: self.scheduler.active_jobs(),
            next_execution: self.store.next_execution_at()?,
            db_connected: self.store.is_connected(),
            counts: StatusCounts {
                tasks: stats.tasks,
                enabled_tasks: stats.enabled_tasks,
                executions: stats.executions,
                credentials: stats.credentials,
                templates: stats.templates,
            },
            recent_activity: RecentActivity {
                executions_24h: stats.executions_24h,
                success_rate,
                failed_count: stats.failed_24h,
                pending_count: stats.pending_executions,
                recent_errors: stats.recent_errors,
            },
            uptime_seconds: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    /// I2: every granted credential name must resolve to an existing
    /// credential (a stored value is not required until run time).
    fn check_credentials_exist(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.store.get_credential(name).map_err(|_| {
                AutomatorError::Validation(format!("unknown credential {name:?} in grant list"))
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext").finish_non_exhaustive()
    }
}
