//! HTTP control-plane adapter.
//!
//! A thin axum layer over [`AppContext`]: deserialize, call the operation,
//! map the error kind onto a status code. No business rules live here.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use serde::Deserialize;

use super::ops::{AppContext, CredentialDraft};
use crate::AutomatorError;
use crate::store::types::{
    ExecutionFilter, TaskDraft, TaskFilter, TaskPatch, Template, TemplatePatch,
};

/// Build the control-plane router.
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/templates", get(list_templates).post(create_template))
        .route(
            "/api/templates/{id}",
            get(get_template).patch(update_template).delete(delete_template),
        )
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/toggle", post(toggle_task))
        .route("/api/tasks/{id}/execute", post(execute_task))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/credentials", get(list_credentials).post(create_credential))
        .route("/api/credentials/{id}", delete(delete_credential))
        .route(
            "/api/credentials/{name}/value",
            put(update_credential_value).delete(clear_credential_value),
        )
        .with_state(ctx)
}

/// Serve the router until shutdown is signalled.
pub async fn serve(
    ctx: Arc<AppContext>,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| {
            AutomatorError::Internal(format!("cannot bind HTTP listener on port {port}: {e}"))
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| AutomatorError::Internal(e.to_string()))?;
    tracing::info!("control plane listening on http://{local_addr}");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AutomatorError::Internal(format!("HTTP server failed: {e}")))
}

/// Map an error kind onto its HTTP status.
fn error_status(err: &AutomatorError) -> StatusCode {
    match err.kind() {
        "not_found" => StatusCode::NOT_FOUND,
        "conflict" => StatusCode::CONFLICT,
        "validation" => StatusCode::UNPROCESSABLE_ENTITY,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "credential_unavailable" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct ApiError(AutomatorError);

impl From<AutomatorError> for ApiError {
    fn from(err: AutomatorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = error_status(&self.0);
        let body = axum::Json(serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn json<T: serde::Serialize>(value: T) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!(value))
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn status(State(ctx): State<Arc<AppContext>>) -> ApiResult<impl IntoResponse> {
    Ok(json(ctx.status()?))
}

// ── Templates ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TemplateListQuery {
    category: Option<String>,
}

async fn list_templates(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<TemplateListQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(json(ctx.list_templates(query.category.as_deref())?))
}

async fn get_template(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(json(ctx.get_template(&id)?))
}

async fn create_template(
    State(ctx): State<Arc<AppContext>>,
    axum::Json(template): axum::Json<Template>,
) -> ApiResult<impl IntoResponse> {
    Ok((StatusCode::CREATED, json(ctx.create_template(template)?)))
}

async fn update_template(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    axum::Json(patch): axum::Json<TemplatePatch>,
) -> ApiResult<impl IntoResponse> {
    Ok(json(ctx.update_template(&id, &patch)?))
}

async fn delete_template(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ctx.delete_template(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Tasks ───────────────────────────────────────────────────────────────────

async fn list_tasks(
    State(ctx): State<Arc<AppContext>>,
    Query(filter): Query<TaskFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(json(ctx.list_tasks(&filter)?))
}

async fn get_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(json(ctx.get_task(id)?))
}

async fn create_task(
    State(ctx): State<Arc<AppContext>>,
    axum::Json(draft): axum::Json<TaskDraft>,
) -> ApiResult<impl IntoResponse> {
    Ok((StatusCode::CREATED, json(ctx.create_task(draft)?)))
}

async fn update_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
    axum::Json(patch): axum::Json<TaskPatch>,
) -> ApiResult<impl IntoResponse> {
    Ok(json(ctx.update_task(id, patch)?))
}

async fn delete_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    ctx.delete_task(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(json(ctx.toggle_task(id)?))
}

#[derive(Deserialize, Default)]
struct ExecuteBody {
    timeout_ms: Option<u64>,
}

async fn execute_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
    body: axum::body::Bytes,
) -> ApiResult<impl IntoResponse> {
    // The body is optional; an empty POST runs with default options.
    let options: ExecuteBody = if body.is_empty() {
        ExecuteBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            ApiError(AutomatorError::Validation(format!("invalid body: {e}")))
        })?
    };
    let outcome = ctx.execute_task(id, options.timeout_ms).await?;
    Ok(json(serde_json::json!({
        "execution": outcome.execution,
        "success": outcome.success,
        "error": outcome.error,
    })))
}

// ── Executions ──────────────────────────────────────────────────────────────

async fn list_executions(
    State(ctx): State<Arc<AppContext>>,
    Query(filter): Query<ExecutionFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(json(ctx.list_executions(&filter)?))
}

async fn get_execution(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(json(ctx.get_execution(id)?))
}

// ── Credentials ─────────────────────────────────────────────────────────────

async fn list_credentials(State(ctx): State<Arc<AppContext>>) -> ApiResult<impl IntoResponse> {
    Ok(json(ctx.list_credentials()?))
}

async fn create_credential(
    State(ctx): State<Arc<AppContext>>,
    axum::Json(draft): axum::Json<CredentialDraft>,
) -> ApiResult<impl IntoResponse> {
    Ok((StatusCode::CREATED, json(ctx.create_credential(draft)?)))
}

#[derive(Deserialize)]
struct ValueBody {
    value: String,
}

async fn update_credential_value(
    State(ctx): State<Arc<AppContext>>,
    Path(name): Path<String>,
    axum::Json(body): axum::Json<ValueBody>,
) -> ApiResult<impl IntoResponse> {
    ctx.update_credential_value(&name, &body.value)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_credential_value(
    State(ctx): State<Arc<AppContext>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ctx.clear_credential_value(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_credential(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    ctx.delete_credential(id)?;
    Ok(StatusCode::NO_CONTENT)
}
