//! Control-plane integration: round-trip laws, referential guards, and the
//! plaintext-never-in-listings property.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use personal_automator::AutomatorError;
use personal_automator::server::ops::CredentialDraft;
use personal_automator::store::types::{
    CredentialType, ExecutionFilter, TaskFilter, TaskPatch, TemplatePatch,
};

use common::{bare_template, daemon_with_host, echo_host, interval_draft, message_template};

#[tokio::test]
async fn template_create_get_update_round_trip() {
    let daemon = daemon_with_host(echo_host());
    let created = daemon
        .ctx
        .create_template(message_template("greeting"))
        .unwrap();
    assert!(!created.is_builtin, "operators cannot mint built-ins");

    let fetched = daemon.ctx.get_template("greeting").unwrap();
    assert_eq!(fetched.name, created.name);
    assert_eq!(fetched.code, created.code);

    let updated = daemon
        .ctx
        .update_template(
            "greeting",
            &TemplatePatch {
                description: Some(Some("now with docs".to_owned())),
                ..TemplatePatch::default()
            },
        )
        .unwrap();
    assert_eq!(updated.description.as_deref(), Some("now with docs"));
    assert_eq!(updated.id, "greeting");

    let refetched = daemon.ctx.get_template("greeting").unwrap();
    assert_eq!(refetched.description.as_deref(), Some("now with docs"));
}

#[tokio::test]
async fn task_create_requires_valid_references() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .ctx
        .create_template(message_template("log-message"))
        .unwrap();

    // Unknown template.
    let err = daemon
        .ctx
        .create_task(interval_draft("no-such-template", "orphan", "60"))
        .unwrap_err();
    assert!(matches!(err, AutomatorError::NotFound(_)));

    // Unknown credential in the grant list.
    let mut draft = interval_draft("log-message", "granted", "60");
    draft.credentials = vec!["GHOST".to_owned()];
    let err = daemon.ctx.create_task(draft).unwrap_err();
    assert!(matches!(err, AutomatorError::Validation(_)));

    // Missing required parameter.
    let mut draft = interval_draft("log-message", "paramless", "60");
    draft.params.clear();
    let err = daemon.ctx.create_task(draft).unwrap_err();
    assert!(matches!(err, AutomatorError::Validation(_)));

    // Bad schedule expression.
    let mut draft = interval_draft("log-message", "bad-schedule", "60");
    draft.schedule_value = "zero".to_owned();
    let err = daemon.ctx.create_task(draft).unwrap_err();
    assert!(matches!(err, AutomatorError::Validation(_)));
}

#[tokio::test]
async fn enabled_task_always_has_next_run() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .ctx
        .create_template(message_template("log-message"))
        .unwrap();

    let task = daemon
        .ctx
        .create_task(interval_draft("log-message", "invariant", "60"))
        .unwrap();
    assert!(task.enabled);
    assert!(task.next_run_at.is_some(), "create must schedule");

    let task = daemon
        .ctx
        .update_task(
            task.id,
            TaskPatch {
                schedule_value: Some("120".to_owned()),
                ..TaskPatch::default()
            },
        )
        .unwrap();
    assert!(task.next_run_at.is_some(), "update must reschedule");

    let disabled = daemon.ctx.toggle_task(task.id).unwrap();
    assert!(!disabled.enabled);
    assert!(disabled.next_run_at.is_none(), "disabled tasks lose next_run_at");

    let enabled = daemon.ctx.toggle_task(task.id).unwrap();
    assert!(enabled.enabled, "toggle twice is identity on enabled");
    assert!(enabled.next_run_at.is_some(), "toggle must reschedule");
}

#[tokio::test]
async fn credential_delete_guard_matches_spec_scenario() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .ctx
        .create_template(message_template("log-message"))
        .unwrap();

    let credential = daemon
        .ctx
        .create_credential(CredentialDraft {
            name: "X".to_owned(),
            credential_type: CredentialType::Secret,
            description: None,
            value: Some("hunter2".to_owned()),
        })
        .unwrap();

    let mut draft = interval_draft("log-message", "uses-x", "60");
    draft.credentials = vec!["X".to_owned()];
    let task = daemon.ctx.create_task(draft).unwrap();

    let err = daemon.ctx.delete_credential(credential.id).unwrap_err();
    assert!(matches!(err, AutomatorError::Conflict(_)));

    daemon.ctx.delete_task(task.id).unwrap();
    daemon.ctx.delete_credential(credential.id).unwrap();
    assert!(daemon.ctx.list_credentials().unwrap().is_empty());
}

#[tokio::test]
async fn template_delete_guard_and_builtin_protection() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .store
        .seed_templates(&personal_automator::templates::builtin_templates())
        .unwrap();

    let builtin_id = personal_automator::templates::builtin_templates()[0].id.clone();
    let err = daemon.ctx.delete_template(&builtin_id).unwrap_err();
    assert!(matches!(err, AutomatorError::Conflict(_)));

    daemon
        .ctx
        .create_template(message_template("removable"))
        .unwrap();
    let task = daemon
        .ctx
        .create_task(interval_draft("removable", "holder", "60"))
        .unwrap();
    let err = daemon.ctx.delete_template("removable").unwrap_err();
    assert!(matches!(err, AutomatorError::Conflict(_)));

    daemon.ctx.delete_task(task.id).unwrap();
    daemon.ctx.delete_template("removable").unwrap();
}

#[tokio::test]
async fn plaintext_never_appears_in_any_listing_shape() {
    let daemon = daemon_with_host(echo_host());
    let secret = "s3kr1t-plaintext-value";

    daemon
        .ctx
        .create_credential(CredentialDraft {
            name: "API_KEY".to_owned(),
            credential_type: CredentialType::ApiKey,
            description: Some("for tests".to_owned()),
            value: Some(secret.to_owned()),
        })
        .unwrap();
    daemon
        .ctx
        .create_template(message_template("log-message"))
        .unwrap();
    let mut draft = interval_draft("log-message", "keyed", "60");
    draft.credentials = vec!["API_KEY".to_owned()];
    let task = daemon.ctx.create_task(draft).unwrap();

    let surfaces = [
        serde_json::to_string(&daemon.ctx.list_credentials().unwrap()).unwrap(),
        serde_json::to_string(&daemon.ctx.list_templates(None).unwrap()).unwrap(),
        serde_json::to_string(&daemon.ctx.list_tasks(&TaskFilter::default()).unwrap()).unwrap(),
        serde_json::to_string(&daemon.ctx.get_task(task.id).unwrap()).unwrap(),
        serde_json::to_string(
            &daemon
                .ctx
                .list_executions(&ExecutionFilter::default())
                .unwrap(),
        )
        .unwrap(),
        serde_json::to_string(&daemon.ctx.status().unwrap()).unwrap(),
    ];
    for surface in surfaces {
        assert!(
            !surface.contains(secret),
            "plaintext leaked into listing: {surface}"
        );
    }

    // The listing view shows only the value's presence.
    let infos = daemon.ctx.list_credentials().unwrap();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].has_value);
}

#[tokio::test]
async fn credential_value_lifecycle_toggles_has_value() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .ctx
        .create_credential(CredentialDraft {
            name: "ROTATING".to_owned(),
            credential_type: CredentialType::OauthToken,
            description: None,
            value: None,
        })
        .unwrap();
    assert!(!daemon.ctx.list_credentials().unwrap()[0].has_value);

    daemon
        .ctx
        .update_credential_value("ROTATING", "fresh-token")
        .unwrap();
    assert!(daemon.ctx.list_credentials().unwrap()[0].has_value);

    daemon.ctx.clear_credential_value("ROTATING").unwrap();
    assert!(!daemon.ctx.list_credentials().unwrap()[0].has_value);

    let err = daemon
        .ctx
        .update_credential_value("MISSING", "x")
        .unwrap_err();
    assert!(matches!(err, AutomatorError::NotFound(_)));
}

#[tokio::test]
async fn status_reports_counts_and_scheduler_state() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .ctx
        .create_template(bare_template("noop"))
        .unwrap();
    daemon
        .ctx
        .create_task(common::interval_draft_no_params("noop", "idle", "3600"))
        .unwrap();

    let status = daemon.ctx.status().unwrap();
    assert!(!status.scheduler_running);
    assert!(status.db_connected);
    assert_eq!(status.counts.tasks, 1);
    assert_eq!(status.counts.enabled_tasks, 1);
    assert_eq!(status.counts.templates, 1);
    assert!(status.next_execution.is_some());
    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));

    daemon.scheduler.start().unwrap();
    let status = daemon.ctx.status().unwrap();
    assert!(status.scheduler_running);
    daemon.scheduler.stop().await;
}

#[tokio::test]
async fn duplicate_names_conflict() {
    let daemon = daemon_with_host(echo_host());
    daemon
        .ctx
        .create_template(message_template("log-message"))
        .unwrap();
    daemon
        .ctx
        .create_task(interval_draft("log-message", "same-name", "60"))
        .unwrap();
    let err = daemon
        .ctx
        .create_task(interval_draft("log-message", "same-name", "60"))
        .unwrap_err();
    assert!(matches!(err, AutomatorError::Conflict(_)));

    let err = daemon
        .ctx
        .create_template(message_template("log-message"))
        .unwrap_err();
    assert!(matches!(err, AutomatorError::Conflict(_)));
}
