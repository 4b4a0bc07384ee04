//! SQLite-backed persistence for templates, tasks, executions and
//! credentials.
//!
//! A single [`Store`] owns the database connection behind a mutex; all
//! writes are serialized. Multi-row mutations run inside transactions, and
//! the scheduler's claim is a single conditional UPDATE so that restarts or
//! concurrent instances cannot double-fire a task.

pub mod schema;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use schema::apply_schema;
use types::{
    Credential, CredentialType, Execution, ExecutionFilter, ExecutionOutput, ExecutionPage,
    ExecutionStatus, ParamValues, ScheduleType, Task, TaskDraft, TaskFilter, TaskPatch, Template,
    TemplatePatch, StoreStats,
};

/// Error text used when a stale `running` row is closed by the recovery
/// sweep.
pub const RESTART_SWEEP_ERROR: &str = "daemon restarted during execution";

/// Storage-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("column encoding error: {0}")]
    Encoding(String),

    #[error("lock poisoned: {0}")]
    Lock(String),
}

impl From<StoreError> for crate::AutomatorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => crate::AutomatorError::NotFound(what),
            StoreError::Conflict(msg) => crate::AutomatorError::Conflict(msg),
            other => crate::AutomatorError::Storage(other.to_string()),
        }
    }
}

/// Format a timestamp the way every column stores it: RFC 3339 UTC with
/// fixed-width nanoseconds, so stored text compares lexicographically and
/// round-trips without precision loss.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Encoding(format!("bad timestamp {text:?}: {e}")))
}

fn parse_ts_opt(text: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    text.map(|t| parse_ts(&t)).transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Encoding(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Encoding(e.to_string()))
}

fn schedule_type_to_str(t: ScheduleType) -> &'static str {
    match t {
        ScheduleType::Cron => "cron",
        ScheduleType::Once => "once",
        ScheduleType::Interval => "interval",
    }
}

fn schedule_type_from_str(text: &str) -> Result<ScheduleType, StoreError> {
    match text {
        "cron" => Ok(ScheduleType::Cron),
        "once" => Ok(ScheduleType::Once),
        "interval" => Ok(ScheduleType::Interval),
        other => Err(StoreError::Encoding(format!("unknown schedule type {other:?}"))),
    }
}

fn status_to_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "running",
        ExecutionStatus::Success => "success",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Timeout => "timeout",
    }
}

fn status_from_str(text: &str) -> Result<ExecutionStatus, StoreError> {
    match text {
        "running" => Ok(ExecutionStatus::Running),
        "success" => Ok(ExecutionStatus::Success),
        "failed" => Ok(ExecutionStatus::Failed),
        "timeout" => Ok(ExecutionStatus::Timeout),
        other => Err(StoreError::Encoding(format!("unknown status {other:?}"))),
    }
}

fn credential_type_to_str(t: CredentialType) -> &'static str {
    match t {
        CredentialType::ApiKey => "api_key",
        CredentialType::OauthToken => "oauth_token",
        CredentialType::EnvVar => "env_var",
        CredentialType::Secret => "secret",
    }
}

fn credential_type_from_str(text: &str) -> Result<CredentialType, StoreError> {
    match text {
        "api_key" => Ok(CredentialType::ApiKey),
        "oauth_token" => Ok(CredentialType::OauthToken),
        "env_var" => Ok(CredentialType::EnvVar),
        "secret" => Ok(CredentialType::Secret),
        other => Err(StoreError::Encoding(format!("unknown credential type {other:?}"))),
    }
}

/// Map a uniqueness violation onto [`StoreError::Conflict`].
fn map_insert_err(e: rusqlite::Error, what: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &e
        && inner.code == rusqlite::ErrorCode::ConstraintViolation
    {
        return StoreError::Conflict(format!("{what} already exists"));
    }
    StoreError::Sqlite(e)
}

/// A due task together with the raw `next_run_at` column text observed when
/// it was read. The raw text is the claim token: [`Store::claim_task`]
/// conditions on it verbatim so that any concurrent change (another
/// scheduler instance, an external edit) defeats the claim.
#[derive(Debug, Clone)]
pub struct DueTask {
    pub task: Task,
    pub next_run_text: String,
}

/// SQLite-backed repository for the four automation entities.
///
/// Thread-safe via an internal `Mutex<Connection>`. All writes are
/// serialized; WAL mode lets readers proceed on the SQLite side, though we
/// still take the mutex for simplicity.
pub struct Store {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database file, applying the schema.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let conn = Connection::open(db_path)?;
        apply_schema(&conn)?;
        Ok(Self {
            path: Some(db_path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (tests and ephemeral runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    /// Cheap connectivity probe for the status operation.
    pub fn is_connected(&self) -> bool {
        self.lock()
            .and_then(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(StoreError::Sqlite)
            })
            .is_ok()
    }

    // ── Templates ───────────────────────────────────────────────────────────

    /// Insert a new template. Fails with `Conflict` on a duplicate id or
    /// name.
    pub fn insert_template(&self, template: &Template) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO templates \
             (id, name, description, category, code, params_schema, required_credentials, \
              suggested_schedule, is_builtin) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                template.id,
                template.name,
                template.description,
                template.category,
                template.code,
                to_json(&template.params_schema)?,
                to_json(&template.required_credentials)?,
                template.suggested_schedule,
                i64::from(template.is_builtin),
            ],
        )
        .map_err(|e| map_insert_err(e, &format!("template {:?}", template.id)))?;
        Ok(())
    }

    /// Seed templates unless a template with the same id already exists.
    /// Returns how many were inserted.
    pub fn seed_templates(&self, templates: &[Template]) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let mut inserted = 0;
        for template in templates {
            let n = tx.execute(
                "INSERT OR IGNORE INTO templates \
                 (id, name, description, category, code, params_schema, required_credentials, \
                  suggested_schedule, is_builtin) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    template.id,
                    template.name,
                    template.description,
                    template.category,
                    template.code,
                    to_json(&template.params_schema)?,
                    to_json(&template.required_credentials)?,
                    template.suggested_schedule,
                    i64::from(template.is_builtin),
                ],
            )?;
            inserted += n;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Fetch a template by id.
    pub fn get_template(&self, id: &str) -> Result<Template, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, description, category, code, params_schema, \
             required_credentials, suggested_schedule, is_builtin \
             FROM templates WHERE id = ?1",
            params![id],
            row_to_template,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("template {id:?}")))?
        .map_err(Into::into)
    }

    /// List templates, optionally restricted to one category, ordered by
    /// name.
    pub fn list_templates(&self, category: Option<&str>) -> Result<Vec<Template>, StoreError> {
        let conn = self.lock()?;
        let (sql, args): (&str, Vec<&dyn rusqlite::ToSql>) = match category {
            Some(ref cat) => (
                "SELECT id, name, description, category, code, params_schema, \
                 required_credentials, suggested_schedule, is_builtin \
                 FROM templates WHERE category = ?1 ORDER BY name",
                vec![cat],
            ),
            None => (
                "SELECT id, name, description, category, code, params_schema, \
                 required_credentials, suggested_schedule, is_builtin \
                 FROM templates ORDER BY name",
                vec![],
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(&args[..], row_to_template)?;
        let mut templates = Vec::new();
        for r in rows {
            templates.push(r??);
        }
        Ok(templates)
    }

    /// Apply a patch to a template. `id` and `is_builtin` never change.
    pub fn update_template(
        &self,
        id: &str,
        patch: &TemplatePatch,
    ) -> Result<Template, StoreError> {
        let mut template = self.get_template(id)?;
        if let Some(name) = &patch.name {
            template.name = name.clone();
        }
        if let Some(description) = &patch.description {
            template.description = description.clone();
        }
        if let Some(category) = &patch.category {
            template.category = category.clone();
        }
        if let Some(code) = &patch.code {
            template.code = code.clone();
        }
        if let Some(schema) = &patch.params_schema {
            template.params_schema = schema.clone();
        }
        if let Some(required) = &patch.required_credentials {
            template.required_credentials = required.clone();
        }
        if let Some(suggested) = &patch.suggested_schedule {
            template.suggested_schedule = suggested.clone();
        }

        let conn = self.lock()?;
        conn.execute(
            "UPDATE templates SET name = ?1, description = ?2, category = ?3, code = ?4, \
             params_schema = ?5, required_credentials = ?6, suggested_schedule = ?7 \
             WHERE id = ?8",
            params![
                template.name,
                template.description,
                template.category,
                template.code,
                to_json(&template.params_schema)?,
                to_json(&template.required_credentials)?,
                template.suggested_schedule,
                id,
            ],
        )
        .map_err(|e| map_insert_err(e, &format!("template named {:?}", template.name)))?;
        Ok(template)
    }

    /// Count tasks bound to a template (delete guard).
    pub fn tasks_using_template(&self, id: &str) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE template_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Delete a template. Refused for built-ins and for templates still
    /// referenced by a task.
    pub fn delete_template(&self, id: &str) -> Result<(), StoreError> {
        let template = self.get_template(id)?;
        if template.is_builtin {
            return Err(StoreError::Conflict(format!(
                "template {id:?} is built-in and cannot be deleted"
            )));
        }
        if self.tasks_using_template(id)? > 0 {
            return Err(StoreError::Conflict(format!(
                "template {id:?} is referenced by existing tasks"
            )));
        }
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM templates WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("template {id:?}")));
        }
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────────────

    /// Insert a task with its initial `next_run_at` and return the stored
    /// row.
    pub fn insert_task(
        &self,
        draft: &TaskDraft,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks \
             (template_id, name, params, schedule_type, schedule_value, credentials, enabled, \
              created_at, updated_at, last_run_at, next_run_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10)",
            params![
                draft.template_id,
                draft.name,
                to_json(&draft.params)?,
                schedule_type_to_str(draft.schedule_type),
                draft.schedule_value,
                to_json(&draft.credentials)?,
                i64::from(draft.enabled),
                fmt_ts(now),
                fmt_ts(now),
                next_run_at.map(fmt_ts),
            ],
        )
        .map_err(|e| map_insert_err(e, &format!("task named {:?}", draft.name)))?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_task(id)
    }

    /// Fetch a task by id.
    pub fn get_task(&self, id: i64) -> Result<Task, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, template_id, name, params, schedule_type, schedule_value, credentials, \
             enabled, created_at, updated_at, last_run_at, next_run_at \
             FROM tasks WHERE id = ?1",
            params![id],
            row_to_task,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?
        .map_err(Into::into)
    }

    /// List tasks matching the filter, ordered by id.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock()?;
        let mut sql = String::from(
            "SELECT id, template_id, name, params, schedule_type, schedule_value, credentials, \
             enabled, created_at, updated_at, last_run_at, next_run_at FROM tasks WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(enabled) = filter.enabled {
            sql.push_str(" AND enabled = ?");
            args.push(Box::new(i64::from(enabled)));
        }
        if let Some(template_id) = &filter.template_id {
            sql.push_str(" AND template_id = ?");
            args.push(Box::new(template_id.clone()));
        }
        if let Some(has_errors) = filter.has_errors {
            let clause = " AND (SELECT e.status FROM executions e WHERE e.task_id = tasks.id \
                           ORDER BY e.started_at DESC, e.id DESC LIMIT 1) IN ('failed', 'timeout')";
            if has_errors {
                sql.push_str(clause);
            } else {
                sql.push_str(" AND COALESCE((SELECT e.status FROM executions e \
                              WHERE e.task_id = tasks.id \
                              ORDER BY e.started_at DESC, e.id DESC LIMIT 1), '') \
                              NOT IN ('failed', 'timeout')");
            }
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(AsRef::as_ref).collect();
        let rows = stmt.query_map(&params_ref[..], row_to_task)?;
        let mut tasks = Vec::new();
        for r in rows {
            tasks.push(r??);
        }
        Ok(tasks)
    }

    /// Apply a patch plus a freshly computed `next_run_at` in one
    /// transaction.
    pub fn update_task(
        &self,
        id: i64,
        patch: &TaskPatch,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let mut task = self.get_task(id)?;
        if let Some(name) = &patch.name {
            task.name = name.clone();
        }
        if let Some(task_params) = &patch.params {
            task.params = task_params.clone();
        }
        if let Some(schedule_type) = patch.schedule_type {
            task.schedule_type = schedule_type;
        }
        if let Some(schedule_value) = &patch.schedule_value {
            task.schedule_value = schedule_value.clone();
        }
        if let Some(credentials) = &patch.credentials {
            task.credentials = credentials.clone();
        }
        if let Some(enabled) = patch.enabled {
            task.enabled = enabled;
        }

        let conn = self.lock()?;
        conn.execute(
            "UPDATE tasks SET name = ?1, params = ?2, schedule_type = ?3, schedule_value = ?4, \
             credentials = ?5, enabled = ?6, updated_at = ?7, next_run_at = ?8 WHERE id = ?9",
            params![
                task.name,
                to_json(&task.params)?,
                schedule_type_to_str(task.schedule_type),
                task.schedule_value,
                to_json(&task.credentials)?,
                i64::from(task.enabled),
                fmt_ts(now),
                next_run_at.map(fmt_ts),
                id,
            ],
        )
        .map_err(|e| map_insert_err(e, &format!("task named {:?}", task.name)))?;
        drop(conn);
        self.get_task(id)
    }

    /// Flip `enabled` and set the recomputed `next_run_at` atomically.
    pub fn set_task_enabled(
        &self,
        id: i64,
        enabled: bool,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE tasks SET enabled = ?1, next_run_at = ?2, updated_at = ?3 WHERE id = ?4",
            params![i64::from(enabled), next_run_at.map(fmt_ts), fmt_ts(now), id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        drop(conn);
        self.get_task(id)
    }

    /// Overwrite `next_run_at` (used by reschedule passes).
    pub fn set_next_run(
        &self,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE tasks SET next_run_at = ?1 WHERE id = ?2",
            params![next_run_at.map(fmt_ts), id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// Delete a task; its executions cascade away with it.
    pub fn delete_task(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// Enabled tasks whose `next_run_at` has arrived, ordered soonest first.
    ///
    /// `julianday` comparison tolerates foreign timestamp formats written by
    /// external edits to the database.
    pub fn get_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<DueTask>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, template_id, name, params, schedule_type, schedule_value, credentials, \
             enabled, created_at, updated_at, last_run_at, next_run_at \
             FROM tasks \
             WHERE enabled = 1 AND next_run_at IS NOT NULL \
               AND julianday(next_run_at) <= julianday(?1) \
             ORDER BY next_run_at ASC",
        )?;
        let rows = stmt.query_map(params![fmt_ts(now)], |row| {
            let next_run_text: String = row.get(11)?;
            Ok((row_to_task(row), next_run_text))
        })?;
        let mut due = Vec::new();
        for r in rows {
            let (task, next_run_text) = r?;
            due.push(DueTask {
                task: task??,
                next_run_text,
            });
        }
        Ok(due)
    }

    /// Atomically claim one fire of a task.
    ///
    /// Succeeds only when `next_run_at` still equals the text observed by
    /// [`Store::get_due_tasks`]; on success it stamps `last_run_at` and
    /// advances `next_run_at` in the same statement. Returns `false` when
    /// another claimant won.
    pub fn claim_task(
        &self,
        id: i64,
        observed_next: &str,
        new_next: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE tasks SET last_run_at = ?1, next_run_at = ?2 \
             WHERE id = ?3 AND next_run_at = ?4",
            params![fmt_ts(fired_at), new_next.map(fmt_ts), id, observed_next],
        )?;
        Ok(rows == 1)
    }

    // ── Executions ──────────────────────────────────────────────────────────

    /// Insert a `running` execution row, returning its id.
    pub fn insert_execution(
        &self,
        task_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO executions (task_id, started_at, status) VALUES (?1, ?2, 'running')",
            params![task_id, fmt_ts(started_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert an execution that is already terminal (pre-sandbox aborts:
    /// parameter mismatch, unavailable credentials). Single atomic insert.
    pub fn insert_finished_execution(
        &self,
        task_id: i64,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        status: ExecutionStatus,
        error: &str,
    ) -> Result<i64, StoreError> {
        debug_assert!(status.is_terminal());
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO executions (task_id, started_at, finished_at, status, error, \
             duration_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task_id,
                fmt_ts(started_at),
                fmt_ts(finished_at),
                status_to_str(status),
                error,
                duration_ms,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Move a `running` execution to a terminal state in one transaction.
    ///
    /// Refuses to touch rows that already reached a terminal status, keeping
    /// executions immutable after completion.
    pub fn finish_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        finished_at: DateTime<Utc>,
        duration_ms: i64,
        output: Option<&ExecutionOutput>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        debug_assert!(status.is_terminal());
        let conn = self.lock()?;
        let output_json = output.map(to_json).transpose()?;
        let rows = conn.execute(
            "UPDATE executions SET status = ?1, finished_at = ?2, duration_ms = ?3, \
             output = ?4, error = ?5 WHERE id = ?6 AND status = 'running'",
            params![
                status_to_str(status),
                fmt_ts(finished_at),
                duration_ms,
                output_json,
                error,
                id,
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::Conflict(format!(
                "execution {id} is not running"
            )));
        }
        Ok(())
    }

    /// Fetch one execution.
    pub fn get_execution(&self, id: i64) -> Result<Execution, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, task_id, started_at, finished_at, status, output, error, duration_ms \
             FROM executions WHERE id = ?1",
            params![id],
            row_to_execution,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?
        .map_err(Into::into)
    }

    /// List executions matching the filter, newest first, with the unpaged
    /// total.
    pub fn list_executions(&self, filter: &ExecutionFilter) -> Result<ExecutionPage, StoreError> {
        let conn = self.lock()?;
        let mut where_sql = String::from(" FROM executions WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(task_id) = filter.task_id {
            where_sql.push_str(" AND task_id = ?");
            args.push(Box::new(task_id));
        }
        if let Some(status) = filter.status {
            where_sql.push_str(" AND status = ?");
            args.push(Box::new(status_to_str(status)));
        }
        if let Some(start) = filter.start_date {
            where_sql.push_str(" AND julianday(started_at) >= julianday(?)");
            args.push(Box::new(fmt_ts(start)));
        }
        if let Some(end) = filter.end_date {
            where_sql.push_str(" AND julianday(started_at) <= julianday(?)");
            args.push(Box::new(fmt_ts(end)));
        }

        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(AsRef::as_ref).collect();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*){where_sql}"),
            &params_ref[..],
            |row| row.get(0),
        )?;

        let limit = i64::from(filter.limit.unwrap_or(50));
        let offset = i64::from(filter.offset.unwrap_or(0));
        let list_sql = format!(
            "SELECT id, task_id, started_at, finished_at, status, output, error, duration_ms\
             {where_sql} ORDER BY started_at DESC, id DESC LIMIT {limit} OFFSET {offset}"
        );
        let mut stmt = conn.prepare(&list_sql)?;
        let rows = stmt.query_map(&params_ref[..], row_to_execution)?;
        let mut items = Vec::new();
        for r in rows {
            items.push(r??);
        }
        Ok(ExecutionPage {
            items,
            total: total as u64,
        })
    }

    /// Recovery sweep: close every `running` row left behind by a previous
    /// process as `timeout`, computing `duration_ms` from its `started_at`.
    /// Returns how many rows were swept.
    pub fn sweep_stale_running(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let stale: Vec<(i64, DateTime<Utc>)> = {
            let mut stmt =
                tx.prepare("SELECT id, started_at FROM executions WHERE status = 'running'")?;
            let rows = stmt.query_map([], |row| {
                let id: i64 = row.get(0)?;
                let started: String = row.get(1)?;
                Ok((id, started))
            })?;
            let mut stale = Vec::new();
            for r in rows {
                let (id, started_text) = r?;
                stale.push((id, parse_ts(&started_text)?));
            }
            stale
        };
        for (id, started_at) in &stale {
            let duration_ms = (now - *started_at).num_milliseconds().max(0);
            tx.execute(
                "UPDATE executions SET status = 'timeout', finished_at = ?1, duration_ms = ?2, \
                 error = ?3 WHERE id = ?4",
                params![fmt_ts(now), duration_ms, RESTART_SWEEP_ERROR, id],
            )?;
        }
        tx.commit()?;
        Ok(stale.len() as u64)
    }

    /// Delete terminal executions older than `days`. Returns how many rows
    /// were pruned.
    pub fn prune_executions(&self, days: u32, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "DELETE FROM executions WHERE status != 'running' \
             AND julianday(started_at) < julianday(?1) - ?2",
            params![fmt_ts(now), f64::from(days)],
        )?;
        Ok(rows as u64)
    }

    // ── Credentials ─────────────────────────────────────────────────────────

    /// Insert a credential, optionally with an already-encrypted value.
    pub fn insert_credential(
        &self,
        name: &str,
        credential_type: CredentialType,
        description: Option<&str>,
        encrypted_value: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Credential, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO credentials (name, credential_type, description, created_at, \
             encrypted_value) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                credential_type_to_str(credential_type),
                description,
                fmt_ts(now),
                encrypted_value,
            ],
        )
        .map_err(|e| map_insert_err(e, &format!("credential {name:?}")))?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_credential_by_id(id)
    }

    /// Fetch a credential by name.
    pub fn get_credential(&self, name: &str) -> Result<Credential, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, credential_type, description, created_at, last_used_at, \
             encrypted_value FROM credentials WHERE name = ?1",
            params![name],
            row_to_credential,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("credential {name:?}")))?
        .map_err(Into::into)
    }

    /// Fetch a credential by id.
    pub fn get_credential_by_id(&self, id: i64) -> Result<Credential, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, credential_type, description, created_at, last_used_at, \
             encrypted_value FROM credentials WHERE id = ?1",
            params![id],
            row_to_credential,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("credential {id}")))?
        .map_err(Into::into)
    }

    /// List all credentials ordered by name.
    pub fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, credential_type, description, created_at, last_used_at, \
             encrypted_value FROM credentials ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_credential)?;
        let mut credentials = Vec::new();
        for r in rows {
            credentials.push(r??);
        }
        Ok(credentials)
    }

    /// Replace (or clear, with `None`) a credential's encrypted value.
    pub fn set_credential_value(
        &self,
        name: &str,
        encrypted_value: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE credentials SET encrypted_value = ?1 WHERE name = ?2",
            params![encrypted_value, name],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("credential {name:?}")));
        }
        Ok(())
    }

    /// Stamp `last_used_at` for every named credential.
    pub fn touch_credentials_used(
        &self,
        names: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if names.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        for name in names {
            tx.execute(
                "UPDATE credentials SET last_used_at = ?1 WHERE name = ?2",
                params![fmt_ts(at), name],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Names of tasks whose grant list references the credential (delete
    /// guard). Grant lists are JSON arrays, so membership is checked per
    /// task.
    pub fn tasks_using_credential(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name, credentials FROM tasks")?;
        let rows = stmt.query_map([], |row| {
            let task_name: String = row.get(0)?;
            let credentials: String = row.get(1)?;
            Ok((task_name, credentials))
        })?;
        let mut users = Vec::new();
        for r in rows {
            let (task_name, credentials_json) = r?;
            let granted: Vec<String> = from_json(&credentials_json)?;
            if granted.iter().any(|n| n == name) {
                users.push(task_name);
            }
        }
        Ok(users)
    }

    /// Delete a credential by id. Refused while any task references its
    /// name.
    pub fn delete_credential(&self, id: i64) -> Result<(), StoreError> {
        let credential = self.get_credential_by_id(id)?;
        let users = self.tasks_using_credential(&credential.name)?;
        if !users.is_empty() {
            return Err(StoreError::Conflict(format!(
                "credential {:?} is referenced by tasks: {}",
                credential.name,
                users.join(", ")
            )));
        }
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM credentials WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("credential {id}")));
        }
        Ok(())
    }

    // ── Stats ───────────────────────────────────────────────────────────────

    /// Aggregate counts for the system status operation.
    pub fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<u64, StoreError> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        let count_since = |sql: &str| -> Result<u64, StoreError> {
            let n: i64 = conn.query_row(sql, params![fmt_ts(now)], |row| row.get(0))?;
            Ok(n as u64)
        };

        Ok(StoreStats {
            tasks: count("SELECT COUNT(*) FROM tasks")?,
            enabled_tasks: count("SELECT COUNT(*) FROM tasks WHERE enabled = 1")?,
            executions: count("SELECT COUNT(*) FROM executions")?,
            credentials: count("SELECT COUNT(*) FROM credentials")?,
            templates: count("SELECT COUNT(*) FROM templates")?,
            pending_executions: count("SELECT COUNT(*) FROM executions WHERE status = 'running'")?,
            recent_errors: count_since(
                "SELECT COUNT(*) FROM executions WHERE status IN ('failed', 'timeout') \
                 AND julianday(started_at) >= julianday(?1) - 1.0",
            )?,
            executions_24h: count_since(
                "SELECT COUNT(*) FROM executions \
                 WHERE julianday(started_at) >= julianday(?1) - 1.0",
            )?,
            successes_24h: count_since(
                "SELECT COUNT(*) FROM executions WHERE status = 'success' \
                 AND julianday(started_at) >= julianday(?1) - 1.0",
            )?,
            failed_24h: count_since(
                "SELECT COUNT(*) FROM executions WHERE status = 'failed' \
                 AND julianday(started_at) >= julianday(?1) - 1.0",
            )?,
        })
    }

    /// Earliest upcoming `next_run_at` across enabled tasks.
    pub fn next_execution_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.lock()?;
        let next: Option<String> = conn.query_row(
            "SELECT MIN(next_run_at) FROM tasks WHERE enabled = 1 AND next_run_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        parse_ts_opt(next)
    }
}

// ── Row mappers ─────────────────────────────────────────────────────────────
//
// Each mapper returns `rusqlite::Result<Result<T, StoreError>>` so SQLite
// errors and column-encoding errors stay distinguishable at the call site.

type MappedRow<T> = rusqlite::Result<Result<T, StoreError>>;

fn row_to_template(row: &Row<'_>) -> MappedRow<Template> {
    let params_schema: String = row.get(5)?;
    let required_credentials: String = row.get(6)?;
    let is_builtin: i64 = row.get(8)?;
    Ok((|| {
        Ok(Template {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            category: row.get(3)?,
            code: row.get(4)?,
            params_schema: from_json(&params_schema)?,
            required_credentials: from_json(&required_credentials)?,
            suggested_schedule: row.get(7)?,
            is_builtin: is_builtin != 0,
        })
    })())
}

fn row_to_task(row: &Row<'_>) -> MappedRow<Task> {
    let task_params: String = row.get(3)?;
    let schedule_type: String = row.get(4)?;
    let credentials: String = row.get(6)?;
    let enabled: i64 = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let last_run_at: Option<String> = row.get(10)?;
    let next_run_at: Option<String> = row.get(11)?;
    Ok((|| {
        let task_params: ParamValues = from_json(&task_params)?;
        Ok(Task {
            id: row.get(0)?,
            template_id: row.get(1)?,
            name: row.get(2)?,
            params: task_params,
            schedule_type: schedule_type_from_str(&schedule_type)?,
            schedule_value: row.get(5)?,
            credentials: from_json(&credentials)?,
            enabled: enabled != 0,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
            last_run_at: parse_ts_opt(last_run_at)?,
            next_run_at: parse_ts_opt(next_run_at)?,
        })
    })())
}

fn row_to_execution(row: &Row<'_>) -> MappedRow<Execution> {
    let started_at: String = row.get(2)?;
    let finished_at: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    let output: Option<String> = row.get(5)?;
    Ok((|| {
        Ok(Execution {
            id: row.get(0)?,
            task_id: row.get(1)?,
            started_at: parse_ts(&started_at)?,
            finished_at: parse_ts_opt(finished_at)?,
            status: status_from_str(&status)?,
            output: output.as_deref().map(from_json).transpose()?,
            error: row.get(6)?,
            duration_ms: row.get(7)?,
        })
    })())
}

fn row_to_credential(row: &Row<'_>) -> MappedRow<Credential> {
    let credential_type: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    let last_used_at: Option<String> = row.get(5)?;
    Ok((|| {
        Ok(Credential {
            id: row.get(0)?,
            name: row.get(1)?,
            credential_type: credential_type_from_str(&credential_type)?,
            description: row.get(3)?,
            created_at: parse_ts(&created_at)?,
            last_used_at: parse_ts_opt(last_used_at)?,
            encrypted_value: row.get(6)?,
        })
    })())
}
