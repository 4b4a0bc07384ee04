//! SQLite DDL definitions for the automation store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation.

use rusqlite::Connection;

/// Complete DDL for the automation database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes.
PRAGMA journal_mode = WAL;

-- Enforce foreign key constraints (required for the execution cascade).
PRAGMA foreign_keys = ON;

-- Reusable script recipes.
CREATE TABLE IF NOT EXISTS templates (
    id                   TEXT PRIMARY KEY,
    name                 TEXT NOT NULL UNIQUE,
    description          TEXT,
    category             TEXT,
    code                 TEXT NOT NULL,
    params_schema        TEXT NOT NULL DEFAULT '[]',  -- JSON array of ParamSpec
    required_credentials TEXT NOT NULL DEFAULT '[]',  -- JSON array of names
    suggested_schedule   TEXT,
    is_builtin           INTEGER NOT NULL DEFAULT 0
);

-- Scheduled template instances.
CREATE TABLE IF NOT EXISTS tasks (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    template_id    TEXT NOT NULL REFERENCES templates(id),
    name           TEXT NOT NULL UNIQUE,
    params         TEXT NOT NULL DEFAULT '{}',   -- JSON object keyed by param name
    schedule_type  TEXT NOT NULL,                -- cron | once | interval
    schedule_value TEXT NOT NULL,
    credentials    TEXT NOT NULL DEFAULT '[]',   -- JSON array of credential names
    enabled        INTEGER NOT NULL DEFAULT 1,
    created_at     TEXT NOT NULL,                -- RFC 3339 UTC
    updated_at     TEXT NOT NULL,
    last_run_at    TEXT,
    next_run_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON tasks(enabled, next_run_at);
CREATE INDEX IF NOT EXISTS idx_tasks_template ON tasks(template_id);

-- One row per attempted run. Cascades away with its task.
CREATE TABLE IF NOT EXISTS executions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    status      TEXT NOT NULL,                  -- running | success | failed | timeout
    output      TEXT,                           -- JSON ExecutionOutput
    error       TEXT,
    duration_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_executions_task    ON executions(task_id, started_at);
CREATE INDEX IF NOT EXISTS idx_executions_status  ON executions(status);
CREATE INDEX IF NOT EXISTS idx_executions_started ON executions(started_at);

-- Named secrets; the value column holds an opaque AEAD blob or NULL.
CREATE TABLE IF NOT EXISTS credentials (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    credential_type TEXT NOT NULL,              -- api_key | oauth_token | env_var | secret
    description     TEXT,
    created_at      TEXT NOT NULL,
    last_used_at    TEXT,
    encrypted_value TEXT
);
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times — all statements use `IF NOT EXISTS`.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn schema_applies_twice() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        apply_schema(&conn).unwrap();
    }

    #[test]
    fn execution_cascade_is_declared() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let ddl: String = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE name = 'executions'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(ddl.contains("ON DELETE CASCADE"));
    }
}
