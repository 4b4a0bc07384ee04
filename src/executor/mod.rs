//! Runs one task's script to a terminal execution record.
//!
//! The executor owns the full run lifecycle: parameter validation against
//! the template schema, credential decryption, the `running` row, the
//! watchdog timeout, bounded console capture, and the single terminal
//! update. User-script failures are data — they end up in the execution
//! row, never as daemon control flow.

pub mod host;
pub mod output;
pub mod protocol;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::config::ExecutorConfig;
use crate::store::types::{
    Execution, ExecutionOutput, ExecutionStatus, ParamSpec, ParamValues, Task,
};
use crate::store::Store;
use crate::vault::Vault;
use host::{HostError, ScriptHost};
use output::{drain_console, shared_console};
use protocol::ScriptInput;

/// Per-run options for [`Executor::execute`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Watchdog budget in milliseconds. Defaults to the configured value;
    /// always capped at the configured hard maximum.
    pub timeout_ms: Option<u64>,
}

/// The final record of one run, plus convenience flags for the adapters.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution: Execution,
    pub success: bool,
    pub error: Option<String>,
}

/// Executes tasks against a script host.
pub struct Executor {
    store: Arc<Store>,
    vault: Arc<Vault>,
    script_host: Arc<dyn ScriptHost>,
    config: ExecutorConfig,
    /// Task ids with a run currently in flight. One run per task at a time,
    /// across the scheduler and manual entry points alike.
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Removes the task id from the in-flight set even when the run future is
/// cancelled.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<i64>>>,
    task_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.task_id);
        }
    }
}

impl Executor {
    /// Create an executor.
    pub fn new(
        store: Arc<Store>,
        vault: Arc<Vault>,
        script_host: Arc<dyn ScriptHost>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            vault,
            script_host,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Returns `true` while a run of this task is in flight.
    #[must_use]
    pub fn is_running(&self, task_id: i64) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(&task_id))
            .unwrap_or(false)
    }

    /// Number of runs currently in flight.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.in_flight.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// Run the task once and persist an execution record.
    ///
    /// Returns `Err` only when no record could be produced at all: unknown
    /// task or template, a second concurrent run of the same task, or a
    /// storage failure. Script failures and timeouts come back as `Ok` with
    /// a terminal `failed`/`timeout` record.
    pub async fn execute(
        &self,
        task_id: i64,
        opts: ExecuteOptions,
    ) -> crate::Result<ExecutionOutcome> {
        let task = self.store.get_task(task_id)?;
        let template = self.store.get_template(&task.template_id)?;

        let _guard = self.claim_in_flight(task_id)?;

        let timeout_ms = opts
            .timeout_ms
            .unwrap_or(self.config.default_timeout_ms)
            .min(self.config.max_timeout_ms)
            .max(1);

        // Pre-sandbox aborts persist a terminal row and stop here.
        let params = match validate_params(&template.params_schema, &task.params) {
            Ok(params) => params,
            Err(message) => {
                return self.abort_before_start(&task, &message);
            }
        };
        let credentials = match self.resolve_credentials(&task) {
            Ok(credentials) => credentials,
            Err(message) => {
                return self.abort_before_start(&task, &message);
            }
        };

        let started_at = Utc::now();
        let execution_id = self.store.insert_execution(task.id, started_at)?;
        tracing::debug!(task_id = task.id, execution_id, "execution started");

        let console = shared_console(self.config.max_output_bytes);
        let input = ScriptInput {
            code: template.code.clone(),
            params,
            credentials,
        };

        let run = self.script_host.run(input, Arc::clone(&console));
        let (status, return_value, error) =
            match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
                Ok(Ok(value)) => (ExecutionStatus::Success, value, None),
                Ok(Err(HostError::Script(message))) => {
                    (ExecutionStatus::Failed, None, Some(message))
                }
                Ok(Err(host_error)) => {
                    (ExecutionStatus::Failed, None, Some(host_error.to_string()))
                }
                Err(_) => (
                    ExecutionStatus::Timeout,
                    None,
                    Some(format!("execution exceeded timeout of {timeout_ms}ms")),
                ),
            };

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0);
        let execution_output = ExecutionOutput {
            console: drain_console(console),
            return_value,
        };
        self.store.finish_execution(
            execution_id,
            status,
            finished_at,
            duration_ms,
            Some(&execution_output),
            error.as_deref(),
        )?;

        let execution = self.store.get_execution(execution_id)?;
        tracing::info!(
            task_id = task.id,
            execution_id,
            status = %status,
            duration_ms,
            "execution finished"
        );
        Ok(ExecutionOutcome {
            success: status == ExecutionStatus::Success,
            error,
            execution,
        })
    }

    fn claim_in_flight(&self, task_id: i64) -> crate::Result<InFlightGuard> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|e| crate::AutomatorError::Internal(format!("lock poisoned: {e}")))?;
        if !set.insert(task_id) {
            return Err(crate::AutomatorError::Conflict(format!(
                "task {task_id} already has an execution in progress"
            )));
        }
        Ok(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            task_id,
        })
    }

    /// Persist a `failed` record for a run that never reached the sandbox.
    fn abort_before_start(
        &self,
        task: &Task,
        message: &str,
    ) -> crate::Result<ExecutionOutcome> {
        let now = Utc::now();
        let execution_id = self.store.insert_finished_execution(
            task.id,
            now,
            now,
            ExecutionStatus::Failed,
            message,
        )?;
        tracing::warn!(task_id = task.id, error = %message, "execution aborted before start");
        Ok(ExecutionOutcome {
            execution: self.store.get_execution(execution_id)?,
            success: false,
            error: Some(message.to_owned()),
        })
    }

    /// Decrypt every granted credential, or name the first unavailable one.
    ///
    /// `last_used_at` is stamped only after the whole grant list resolved;
    /// a failed name leaves every stamp untouched.
    fn resolve_credentials(&self, task: &Task) -> Result<BTreeMap<String, String>, String> {
        if task.credentials.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut resolved = BTreeMap::new();
        for name in &task.credentials {
            let unavailable = || format!("credential {name} unavailable");
            let credential = self.store.get_credential(name).map_err(|_| unavailable())?;
            let blob = credential.encrypted_value.ok_or_else(unavailable)?;
            let plaintext = self.vault.decrypt(&blob).map_err(|_| unavailable())?;
            resolved.insert(name.clone(), plaintext);
        }

        if let Err(e) = self
            .store
            .touch_credentials_used(&task.credentials, Utc::now())
        {
            tracing::warn!(error = %e, "cannot stamp credential last_used_at");
        }
        Ok(resolved)
    }
}

/// Check task parameter values against the template's declared schema.
///
/// Required parameters must be present, every present value must match its
/// declared type, and defaults fill in missing optional parameters. Values
/// for undeclared names pass through untouched.
pub fn validate_params(
    schema: &[ParamSpec],
    provided: &ParamValues,
) -> Result<ParamValues, String> {
    let mut validated = provided.clone();
    for spec in schema {
        match provided.get(&spec.name) {
            Some(value) => {
                if !spec.param_type.matches(value) {
                    return Err(format!(
                        "parameter {:?} expects {} but got {value}",
                        spec.name, spec.param_type
                    ));
                }
            }
            None => {
                if let Some(default) = &spec.default {
                    validated.insert(spec.name.clone(), default.clone());
                } else if spec.required {
                    return Err(format!("missing required parameter {:?}", spec.name));
                }
            }
        }
    }
    Ok(validated)
}
