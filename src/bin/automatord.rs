//! Automation daemon entry point.
//!
//! Starts the store, vault, executor and scheduler, then serves the HTTP
//! control plane — plus the stdio JSON-RPC bridge when `--stdio` is given.
//! In stdio mode all tracing goes to stderr so stdout stays a clean JSON
//! protocol channel.
//!
//! Exit code 0 on clean shutdown, 1 on startup failure.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use personal_automator::config::LOCK_FILENAME;
use personal_automator::executor::host::NodeScriptHost;
use personal_automator::server::{http, mcp};
use personal_automator::{
    AppContext, AutomatorConfig, Executor, Scheduler, Store, Vault, templates,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout may carry the JSON-RPC protocol; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let stdio_mode = std::env::args().any(|arg| arg == "--stdio");
    let config = AutomatorConfig::from_env();
    let data_dir = config.resolve_data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;

    // Single-writer guard: held for the life of the process.
    let _lock = acquire_daemon_lock(&data_dir)?;

    let store = Arc::new(Store::open(&config.db_path()).context("cannot open database")?);
    let seeded = store
        .seed_templates(&templates::builtin_templates())
        .context("cannot seed built-in templates")?;
    if seeded > 0 {
        tracing::info!(seeded, "seeded built-in templates");
    }

    let vault = Arc::new(Vault::new(&data_dir));
    let script_host =
        Arc::new(NodeScriptHost::discover().context("script runtime unavailable")?);
    let executor = Arc::new(Executor::new(
        Arc::clone(&store),
        Arc::clone(&vault),
        script_host,
        config.executor.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&executor),
        config.scheduler,
    ));
    scheduler.start().context("cannot start scheduler")?;

    let ctx = Arc::new(AppContext::new(
        store,
        vault,
        Arc::clone(&executor),
        Arc::clone(&scheduler),
    ));

    tracing::info!(
        data_dir = %data_dir.display(),
        stdio = stdio_mode,
        "automatord started"
    );

    let http_ctx = Arc::clone(&ctx);
    let http_port = config.http_port;
    if stdio_mode {
        // HTTP keeps serving in the background; the bridge owns stdio and
        // ends the process when stdin closes.
        let http_task = tokio::spawn(async move {
            if let Err(e) = http::serve(http_ctx, http_port, std::future::pending::<()>()).await {
                tracing::error!(error = %e, "HTTP control plane failed");
            }
        });
        let bridge_result = mcp::run_stdio_bridge(Arc::clone(&ctx)).await;
        http_task.abort();
        bridge_result.context("stdio bridge failed")?;
    } else {
        http::serve(http_ctx, http_port, shutdown_signal())
            .await
            .context("HTTP control plane failed")?;
    }

    scheduler.stop().await;
    tracing::info!("automatord shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "cannot listen for shutdown signal"),
    }
}

/// Take an exclusive advisory lock beside the database so a second daemon
/// instance fails fast instead of racing the single-writer store.
fn acquire_daemon_lock(data_dir: &Path) -> anyhow::Result<std::fs::File> {
    let path = data_dir.join(LOCK_FILENAME);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("cannot open lock file {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            anyhow::bail!(
                "another automatord instance already holds {}",
                path.display()
            );
        }
    }

    Ok(file)
}
