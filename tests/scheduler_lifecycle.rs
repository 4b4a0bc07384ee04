//! Scheduler integration: interval firing, missed-fire coalescing, once
//! semantics, recovery sweep, and failure isolation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use personal_automator::executor::host::{FnScriptHost, HostError};
use personal_automator::store::RESTART_SWEEP_ERROR;
use personal_automator::store::types::{ExecutionFilter, ExecutionStatus, ScheduleType, TaskDraft};

use common::{daemon_with_host, echo_host, interval_draft, message_template};

#[tokio::test]
async fn interval_task_fires_at_least_twice() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .store
        .insert_template(&message_template("log-message"))
        .unwrap();
    let task = daemon
        .ctx
        .create_task(interval_draft("log-message", "greeter", "1"))
        .unwrap();

    daemon.scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    daemon.scheduler.stop().await;

    let page = daemon
        .store
        .list_executions(&ExecutionFilter {
            task_id: Some(task.id),
            ..ExecutionFilter::default()
        })
        .unwrap();
    assert!(
        page.total >= 2,
        "expected at least 2 executions, got {}",
        page.total
    );
    for execution in &page.items {
        assert_eq!(execution.status, ExecutionStatus::Success);
        let output = execution.output.as_ref().expect("output recorded");
        assert!(output.console.iter().any(|line| line.message == "hi"));
    }
}

#[tokio::test]
async fn missed_fires_coalesce_to_one_catch_up() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .store
        .insert_template(&message_template("log-message"))
        .unwrap();

    // Interval-60 task whose next fire is long overdue, as after downtime.
    let now = Utc::now();
    let stale_next = now - chrono::Duration::minutes(9);
    let task = daemon
        .store
        .insert_task(
            &interval_draft("log-message", "behind", "60"),
            Some(stale_next),
            now - chrono::Duration::minutes(10),
        )
        .unwrap();

    daemon.scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    daemon.scheduler.stop().await;

    let page = daemon
        .store
        .list_executions(&ExecutionFilter {
            task_id: Some(task.id),
            ..ExecutionFilter::default()
        })
        .unwrap();
    assert_eq!(page.total, 1, "backlog must not be replayed");

    let task = daemon.store.get_task(task.id).unwrap();
    let next = task.next_run_at.expect("rescheduled");
    let delta = (next - Utc::now()).num_seconds();
    assert!(
        (50..=62).contains(&delta),
        "next fire should be one period out, got {delta}s"
    );
}

#[tokio::test]
async fn once_task_fires_once_and_disables_itself() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .store
        .insert_template(&message_template("log-message"))
        .unwrap();

    let at = Utc::now() + chrono::Duration::seconds(1);
    let draft = TaskDraft {
        template_id: "log-message".to_owned(),
        name: "one-shot".to_owned(),
        params: common::message_params("hi"),
        schedule_type: ScheduleType::Once,
        schedule_value: at.to_rfc3339(),
        credentials: Vec::new(),
        enabled: true,
    };
    let task = daemon.ctx.create_task(draft).unwrap();
    assert!(task.next_run_at.is_some());

    daemon.scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    daemon.scheduler.stop().await;

    let page = daemon
        .store
        .list_executions(&ExecutionFilter {
            task_id: Some(task.id),
            ..ExecutionFilter::default()
        })
        .unwrap();
    assert_eq!(page.total, 1);

    let task = daemon.store.get_task(task.id).unwrap();
    assert!(!task.enabled, "once-task disables after firing");
    assert!(task.next_run_at.is_none());
}

#[tokio::test]
async fn recovery_sweep_closes_stale_running_rows() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .store
        .insert_template(&message_template("log-message"))
        .unwrap();
    let now = Utc::now();
    let task = daemon
        .store
        .insert_task(&interval_draft("log-message", "crashed", "3600"), None, now)
        .unwrap();

    // A run the previous daemon never finished.
    let stale_id = daemon
        .store
        .insert_execution(task.id, now - chrono::Duration::hours(1))
        .unwrap();

    daemon.scheduler.start().unwrap();
    daemon.scheduler.stop().await;

    let execution = daemon.store.get_execution(stale_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert_eq!(execution.error.as_deref(), Some(RESTART_SWEEP_ERROR));
    assert!(execution.error.unwrap().contains("restarted"));
    assert!(execution.finished_at.is_some());
    let duration = execution.duration_ms.unwrap();
    assert!((3_500_000..=3_700_000).contains(&duration));
}

#[tokio::test]
async fn malformed_schedule_disables_task_without_breaking_loop() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .store
        .insert_template(&message_template("log-message"))
        .unwrap();
    let now = Utc::now();

    // A cron expression that went bad after an external edit; it is already
    // due so the first tick trips over it.
    let broken = TaskDraft {
        template_id: "log-message".to_owned(),
        name: "broken-cron".to_owned(),
        params: common::message_params("hi"),
        schedule_type: ScheduleType::Cron,
        schedule_value: "not a cron".to_owned(),
        credentials: Vec::new(),
        enabled: true,
    };
    let broken_task = daemon
        .store
        .insert_task(&broken, Some(now - chrono::Duration::seconds(5)), now)
        .unwrap();
    let healthy = daemon
        .ctx
        .create_task(interval_draft("log-message", "healthy", "1"))
        .unwrap();

    daemon.scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(1800)).await;
    daemon.scheduler.stop().await;

    let broken_task = daemon.store.get_task(broken_task.id).unwrap();
    assert!(!broken_task.enabled, "unusable schedule disables the task");

    // The rest of the tick kept going.
    let page = daemon
        .store
        .list_executions(&ExecutionFilter {
            task_id: Some(healthy.id),
            ..ExecutionFilter::default()
        })
        .unwrap();
    assert!(page.total >= 1);
}

#[tokio::test]
async fn overlapping_occurrence_is_skipped_not_queued() {
    // Host that takes 3 s per run while the task fires every second.
    let runs = Arc::new(AtomicUsize::new(0));
    let run_counter = Arc::clone(&runs);
    let slow_host = Arc::new(FnScriptHost(move |_input, _console| {
        let run_counter = Arc::clone(&run_counter);
        async move {
            run_counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok::<_, HostError>(None)
        }
    }));

    let daemon = daemon_with_host(slow_host);
    daemon
        .store
        .insert_template(&message_template("log-message"))
        .unwrap();
    daemon
        .ctx
        .create_task(interval_draft("log-message", "slowpoke", "1"))
        .unwrap();

    daemon.scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(2800)).await;

    // Later occurrences were claimed and skipped while the first run held
    // the task.
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    daemon.scheduler.stop().await;
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let daemon = daemon_with_host(echo_host());
    assert!(!daemon.scheduler.is_running());

    daemon.scheduler.start().unwrap();
    daemon.scheduler.start().unwrap();
    assert!(daemon.scheduler.is_running());

    daemon.scheduler.stop().await;
    daemon.scheduler.stop().await;
    assert!(!daemon.scheduler.is_running());
}

#[tokio::test]
async fn job_count_tracks_enabled_tasks() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .store
        .insert_template(&message_template("log-message"))
        .unwrap();
    assert_eq!(daemon.scheduler.job_count(), 0);

    let task = daemon
        .ctx
        .create_task(interval_draft("log-message", "counted", "60"))
        .unwrap();
    assert_eq!(daemon.scheduler.job_count(), 1);

    daemon.ctx.toggle_task(task.id).unwrap();
    assert_eq!(daemon.scheduler.job_count(), 0);
}
