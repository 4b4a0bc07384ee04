//! Scheduler: decides when enabled tasks fire and dispatches them.
//!
//! A single tick loop wakes at most once per second (earlier on task
//! changes), reads due tasks from the store, and runs a claim-then-dispatch
//! round per task. The claim — an atomic compare-and-swap on
//! `tasks.next_run_at` — is the sole source of truth for "this fire is
//! ours": no scheduling state lives in memory beyond what a tick reads, so
//! restarts and external edits to the database are always honoured.

pub mod fire_time;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::executor::{ExecuteOptions, Executor};
use crate::store::types::ScheduleType;
use crate::store::{DueTask, Store};
use fire_time::ScheduleSpec;

/// Longest the tick loop sleeps between wakes.
const TICK_INTERVAL: StdDuration = StdDuration::from_secs(1);

struct SchedulerInner {
    store: Arc<Store>,
    executor: Arc<Executor>,
    config: SchedulerConfig,
    /// Bounds concurrent dispatched executions.
    gate: Arc<Semaphore>,
    /// Woken by `on_task_changed` so edits take effect before the next
    /// timed tick.
    changed: Notify,
    running: AtomicBool,
    /// Epoch day of the last retention prune.
    last_prune_day: AtomicI64,
}

/// Background scheduler driving the tick loop.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    stop_tx: std::sync::Mutex<Option<watch::Sender<bool>>>,
    tracker: std::sync::Mutex<TaskTracker>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a stopped scheduler.
    pub fn new(store: Arc<Store>, executor: Arc<Executor>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                executor,
                gate: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
                config,
                changed: Notify::new(),
                running: AtomicBool::new(false),
                last_prune_day: AtomicI64::new(0),
            }),
            loop_handle: std::sync::Mutex::new(None),
            stop_tx: std::sync::Mutex::new(None),
            tracker: std::sync::Mutex::new(TaskTracker::new()),
        }
    }

    /// Start the tick loop. Idempotent.
    ///
    /// Performs the recovery sweep (stale `running` executions become
    /// `timeout`) and fills in missing `next_run_at` values for enabled
    /// tasks. A `next_run_at` already in the past is deliberately left
    /// alone: the first tick claims it, which yields exactly one immediate
    /// catch-up fire per task after a restart.
    pub fn start(&self) -> crate::Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let now = Utc::now();
        let swept = self.inner.store.sweep_stale_running(now)?;
        if swept > 0 {
            info!(swept, "recovery sweep closed stale running executions");
        }
        self.inner.schedule_missing(now);

        let (stop_tx, stop_rx) = watch::channel(false);
        let tracker = TaskTracker::new();
        let inner = Arc::clone(&self.inner);
        let loop_tracker = tracker.clone();
        let handle = tokio::spawn(async move {
            run_loop(inner, stop_rx, loop_tracker).await;
        });

        if let Ok(mut guard) = self.stop_tx.lock() {
            *guard = Some(stop_tx);
        }
        if let Ok(mut guard) = self.loop_handle.lock() {
            *guard = Some(handle);
        }
        if let Ok(mut guard) = self.tracker.lock() {
            *guard = tracker;
        }

        info!(
            max_concurrent = self.inner.config.max_concurrent,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop the tick loop and wait (bounded by the grace period) for
    /// in-flight executions. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let stop_tx = self.stop_tx.lock().ok().and_then(|mut guard| guard.take());
        if let Some(tx) = stop_tx {
            let _ = tx.send(true);
        }
        let handle = self
            .loop_handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let tracker = match self.tracker.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        tracker.close();
        let grace = StdDuration::from_secs(self.inner.config.stop_grace_secs);
        if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
            warn!(
                grace_secs = self.inner.config.stop_grace_secs,
                "in-flight executions still running after grace period"
            );
        }
        info!("scheduler stopped");
    }

    /// Recompute `next_run_at` for every enabled task from its schedule
    /// and `last_run_at` (or from now when it never ran).
    pub fn reschedule_all(&self) -> crate::Result<()> {
        let now = Utc::now();
        let tasks = self.inner.store.list_tasks(&crate::store::types::TaskFilter {
            enabled: Some(true),
            ..Default::default()
        })?;
        for task in tasks {
            match ScheduleSpec::parse(task.schedule_type, &task.schedule_value) {
                Ok(spec) => {
                    let next = spec.next_fire(task.last_run_at, now);
                    if let Err(e) = self.inner.store.set_next_run(task.id, next) {
                        warn!(task_id = task.id, error = %e, "cannot reschedule task");
                    }
                }
                Err(e) => self.inner.disable_broken_task(task.id, &e.to_string(), now),
            }
        }
        self.inner.changed.notify_one();
        Ok(())
    }

    /// Wake the tick loop after a task was created, updated, toggled or
    /// deleted. Cheap: the new scheduling state is already in the store.
    pub fn on_task_changed(&self, task_id: i64) {
        debug!(task_id, "task changed, waking scheduler");
        self.inner.changed.notify_one();
    }

    /// Number of enabled tasks currently tracked.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.inner
            .store
            .list_tasks(&crate::store::types::TaskFilter {
                enabled: Some(true),
                ..Default::default()
            })
            .map(|tasks| tasks.len())
            .unwrap_or(0)
    }

    /// Whether the tick loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of executions currently dispatched and in flight.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.inner.executor.active_count()
    }
}

async fn run_loop(
    inner: Arc<SchedulerInner>,
    mut stop_rx: watch::Receiver<bool>,
    tracker: TaskTracker,
) {
    loop {
        inner.tick(&tracker).await;

        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = inner.changed.notified() => {}
            _ = tokio::time::sleep(TICK_INTERVAL) => {}
        }
    }
    debug!("scheduler tick loop exited");
}

impl SchedulerInner {
    /// Fill in `next_run_at` for enabled tasks that have none (fresh
    /// database, or tasks whose schedule previously failed to parse).
    fn schedule_missing(&self, now: DateTime<Utc>) {
        let tasks = match self.store.list_tasks(&crate::store::types::TaskFilter {
            enabled: Some(true),
            ..Default::default()
        }) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "cannot list tasks for initial scheduling");
                return;
            }
        };
        for task in tasks {
            if task.next_run_at.is_some() {
                continue;
            }
            match ScheduleSpec::parse(task.schedule_type, &task.schedule_value) {
                Ok(spec) => {
                    let next = spec.next_fire(task.last_run_at, now);
                    if let Err(e) = self.store.set_next_run(task.id, next) {
                        warn!(task_id = task.id, error = %e, "cannot schedule task");
                    }
                }
                Err(e) => self.disable_broken_task(task.id, &e.to_string(), now),
            }
        }
    }

    /// One claim-then-dispatch round over the due tasks.
    async fn tick(&self, tracker: &TaskTracker) {
        let now = Utc::now();
        let due = match self.store.get_due_tasks(now) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "cannot read due tasks, skipping tick");
                return;
            }
        };

        for due_task in due {
            if !self.claim_and_dispatch(due_task, now, tracker) {
                // Gate saturated: leave the rest unclaimed for the next tick.
                break;
            }
        }

        self.maybe_prune(now);
    }

    /// Returns `false` when the concurrency gate is saturated.
    fn claim_and_dispatch(
        &self,
        due_task: DueTask,
        now: DateTime<Utc>,
        tracker: &TaskTracker,
    ) -> bool {
        let task = due_task.task;

        let next = match ScheduleSpec::parse(task.schedule_type, &task.schedule_value) {
            Ok(spec) => spec.next_fire(Some(now), now),
            Err(e) => {
                self.disable_broken_task(task.id, &e.to_string(), now);
                return true;
            }
        };

        let Ok(permit) = Arc::clone(&self.gate).try_acquire_owned() else {
            debug!(task_id = task.id, "concurrency gate saturated, deferring");
            return false;
        };

        match self
            .store
            .claim_task(task.id, &due_task.next_run_text, next, now)
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = task.id, "claim lost, another instance fired");
                return true;
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "claim failed");
                return true;
            }
        }

        // A one-shot schedule is spent the moment it is claimed.
        if task.schedule_type == ScheduleType::Once
            && let Err(e) = self.store.set_task_enabled(task.id, false, None, now)
        {
            warn!(task_id = task.id, error = %e, "cannot disable fired once-task");
        }

        if self.executor.is_running(task.id) {
            // Previous run still in flight: the claim above already advanced
            // the schedule, so this occurrence is skipped, not queued.
            debug!(task_id = task.id, "previous run in flight, skipping occurrence");
            return true;
        }

        let executor = Arc::clone(&self.executor);
        let task_id = task.id;
        tracker.spawn(async move {
            let _permit = permit;
            match executor.execute(task_id, ExecuteOptions::default()).await {
                Ok(outcome) => {
                    if !outcome.success {
                        debug!(
                            task_id,
                            error = outcome.error.as_deref().unwrap_or("unknown"),
                            "scheduled execution ended unsuccessfully"
                        );
                    }
                }
                Err(e) => {
                    warn!(task_id, error = %e, "scheduled dispatch failed");
                }
            }
        });
        true
    }

    /// Malformed schedules disable the task rather than breaking the loop.
    fn disable_broken_task(&self, task_id: i64, reason: &str, now: DateTime<Utc>) {
        warn!(task_id, error = %reason, "schedule unusable, disabling task");
        if let Err(e) = self.store.set_task_enabled(task_id, false, None, now) {
            warn!(task_id, error = %e, "cannot disable task");
        }
    }

    /// Retention housekeeping: prune old terminal executions once per day.
    fn maybe_prune(&self, now: DateTime<Utc>) {
        let today = now.timestamp() / 86_400;
        let last = self.last_prune_day.load(Ordering::Relaxed);
        if last == today {
            return;
        }
        if self
            .last_prune_day
            .compare_exchange(last, today, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        match self.store.prune_executions(self.config.retention_days, now) {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "pruned old execution records"),
            Err(e) => warn!(error = %e, "retention prune failed"),
        }
    }
}
