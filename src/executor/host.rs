//! Script hosts: where user code actually runs.
//!
//! [`ScriptHost`] is the seam between the executor and the runtime that
//! evaluates user scripts. The production implementation,
//! [`NodeScriptHost`], spawns a Node.js subprocess per run: the harness
//! receives `{code, params, credentials}` on stdin and reports console
//! lines and the final result as NDJSON on stdout (see
//! [`super::protocol`]). Subprocess isolation means user code cannot reach
//! the store, the vault, or other tasks' state; `fetch`, timers and
//! `async`/`await` come from the Node runtime itself.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::output::SharedConsole;
use super::protocol::{MAX_LINE_BYTES, ScriptEvent, ScriptInput};

/// Script host errors. `Script` is the user's own failure; everything else
/// is the host's.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Failed to spawn the host subprocess.
    #[error("failed to spawn script host: {0}")]
    Spawn(#[source] std::io::Error),

    /// No usable script runtime on this machine.
    #[error("script runtime not found: {0}")]
    RuntimeUnavailable(String),

    /// The host violated the NDJSON protocol.
    #[error("script host protocol error: {0}")]
    Protocol(String),

    /// The user script threw, or its return value was not serialisable.
    #[error("{0}")]
    Script(String),

    /// I/O failure talking to the host.
    #[error("script host I/O error: {0}")]
    Io(String),
}

/// Runs one script to completion, streaming console lines into `console`.
///
/// Implementations must flush console events into the shared buffer as they
/// arrive: when the executor's watchdog cancels the returned future,
/// already-flushed lines are retained while the run itself is killed.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Execute `input.code` and return its (already JSON-serialised) result
    /// value, `None` when the script returned nothing.
    async fn run(
        &self,
        input: ScriptInput,
        console: SharedConsole,
    ) -> Result<Option<serde_json::Value>, HostError>;
}

/// JavaScript harness evaluated by `node -e`.
///
/// Builds the sandbox surface (`params`, `credentials`, `console`, `sleep`)
/// around the user code, which runs as the body of an async function.
const HARNESS_JS: &str = r#"
"use strict";
const chunks = [];
const emit = (obj) => process.stdout.write(JSON.stringify(obj) + "\n");
const fmt = (args) =>
  args.map((a) => (typeof a === "string" ? a : JSON.stringify(a))).join(" ");
process.stdin.on("data", (c) => chunks.push(c));
process.stdin.on("end", async () => {
  let input;
  try {
    input = JSON.parse(Buffer.concat(chunks).toString("utf8"));
  } catch (e) {
    emit({ event: "error", message: "invalid input payload: " + e.message });
    return;
  }
  const consoleApi = {
    log: (...args) => emit({ event: "console", level: "log", message: fmt(args) }),
    warn: (...args) => emit({ event: "console", level: "warn", message: fmt(args) }),
    error: (...args) => emit({ event: "console", level: "error", message: fmt(args) }),
  };
  const sleep = (ms) => new Promise((resolve) => setTimeout(resolve, ms));
  const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;
  try {
    const run = new AsyncFunction("params", "credentials", "console", "sleep", input.code);
    const value = await run(input.params, input.credentials, consoleApi, sleep);
    if (value === undefined) {
      emit({ event: "result" });
      return;
    }
    let text;
    try {
      text = JSON.stringify(value);
    } catch (e) {
      text = undefined;
    }
    if (text === undefined) {
      emit({ event: "error", message: "return value not serialisable" });
      return;
    }
    emit({ event: "result", value: JSON.parse(text) });
  } catch (e) {
    emit({ event: "error", message: e && e.message ? String(e.message) : String(e) });
  }
});
"#;

/// Production host: one Node.js subprocess per run.
pub struct NodeScriptHost {
    node_path: PathBuf,
}

impl std::fmt::Debug for NodeScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeScriptHost")
            .field("node_path", &self.node_path)
            .finish()
    }
}

impl NodeScriptHost {
    /// Locate `node` on PATH.
    pub fn discover() -> Result<Self, HostError> {
        let node_path = which::which("node").map_err(|e| {
            HostError::RuntimeUnavailable(format!("node not found on PATH: {e}"))
        })?;
        tracing::debug!(path = %node_path.display(), "node runtime discovered");
        Ok(Self { node_path })
    }

    /// Use an explicit runtime binary.
    #[must_use]
    pub fn with_path(node_path: PathBuf) -> Self {
        Self { node_path }
    }
}

#[async_trait]
impl ScriptHost for NodeScriptHost {
    async fn run(
        &self,
        input: ScriptInput,
        console: SharedConsole,
    ) -> Result<Option<serde_json::Value>, HostError> {
        let mut child = tokio::process::Command::new(&self.node_path)
            .arg("-e")
            .arg(HARNESS_JS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            // The watchdog cancels this future on timeout; the child must
            // die with it.
            .kill_on_drop(true)
            .spawn()
            .map_err(HostError::Spawn)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::Protocol("child stdin not piped".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Protocol("child stdout not piped".to_owned()))?;

        let line = input
            .to_line()
            .map_err(|e| HostError::Protocol(format!("cannot serialise input: {e}")))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HostError::Io(format!("cannot write input: {e}")))?;
        // EOF tells the harness the payload is complete.
        drop(stdin);

        let mut reader = BufReader::new(stdout);
        let mut buf = String::new();
        let outcome = loop {
            buf.clear();
            let bytes_read = reader
                .read_line(&mut buf)
                .await
                .map_err(|e| HostError::Io(format!("cannot read host output: {e}")))?;
            if bytes_read == 0 {
                break None;
            }
            if bytes_read > MAX_LINE_BYTES {
                return Err(HostError::Protocol(format!(
                    "event line exceeded {MAX_LINE_BYTES} bytes"
                )));
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event: ScriptEvent = serde_json::from_str(trimmed)
                .map_err(|e| HostError::Protocol(format!("bad event line: {e}")))?;
            match event {
                ScriptEvent::Console { level, message } => {
                    if let Ok(mut buffer) = console.lock() {
                        buffer.push(level, message);
                    }
                }
                ScriptEvent::Result { value } => break Some(Ok(value)),
                ScriptEvent::Error { message } => break Some(Err(HostError::Script(message))),
            }
        };

        let status = child
            .wait()
            .await
            .map_err(|e| HostError::Io(format!("cannot reap script host: {e}")))?;

        match outcome {
            Some(result) => result,
            None => Err(HostError::Protocol(format!(
                "script host exited without a result (status {status})"
            ))),
        }
    }
}

/// Script host backed by a closure — the injectable-executor pattern used
/// throughout the test suite.
pub struct FnScriptHost<F>(pub F);

#[async_trait]
impl<F, Fut> ScriptHost for FnScriptHost<F>
where
    F: Fn(ScriptInput, SharedConsole) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Option<serde_json::Value>, HostError>>
        + Send
        + 'static,
{
    async fn run(
        &self,
        input: ScriptInput,
        console: SharedConsole,
    ) -> Result<Option<serde_json::Value>, HostError> {
        (self.0)(input, console).await
    }
}
