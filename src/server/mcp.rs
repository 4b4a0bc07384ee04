//! Stdio JSON-RPC control-plane adapter.
//!
//! Reads newline-delimited JSON-RPC 2.0 requests from stdin, dispatches
//! them through [`AppContext`], and writes responses as newline-delimited
//! JSON to stdout.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

use super::ops::{AppContext, CredentialDraft};
use crate::AutomatorError;
use crate::store::types::{
    ExecutionFilter, TaskDraft, TaskFilter, TaskPatch, Template, TemplatePatch,
};

/// The JSON-RPC version string. Always `"2.0"`.
const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Value,
}

/// A JSON-RPC 2.0 response, success or error.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

/// A JSON-RPC 2.0 error object. `data.kind` carries the daemon's stable
/// error kind.
#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: Some(result),
            error: None,
            id,
        }
    }

    fn err(id: Value, code: i32, message: impl Into<String>, kind: Option<&str>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: kind.map(|k| serde_json::json!({ "kind": k })),
            }),
            id,
        }
    }

    fn from_app_error(id: Value, err: &AutomatorError) -> Self {
        Self::err(id, -32000, err.to_string(), Some(err.kind()))
    }
}

/// Run the stdio bridge until stdin closes.
pub async fn run_stdio_bridge(ctx: Arc<AppContext>) -> crate::Result<()> {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut writer = BufWriter::new(tokio::io::stdout());
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await.map_err(|e| {
            AutomatorError::Internal(format!("failed to read from stdin: {e}"))
        })?;
        // EOF
        if bytes_read == 0 {
            tracing::info!("stdin closed (EOF); shutting down stdio bridge");
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(trimmed) {
            Ok(request) => dispatch(&ctx, request).await,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse JSON-RPC request");
                RpcResponse::err(Value::Null, -32700, format!("parse error: {e}"), None)
            }
        };

        let json = serde_json::to_string(&response).map_err(|e| {
            AutomatorError::Internal(format!("failed to serialize response: {e}"))
        })?;
        write_line(&mut writer, &json).await?;
    }

    Ok(())
}

async fn write_line(
    writer: &mut BufWriter<tokio::io::Stdout>,
    json: &str,
) -> crate::Result<()> {
    writer.write_all(json.as_bytes()).await.map_err(|e| {
        AutomatorError::Internal(format!("failed to write to stdout: {e}"))
    })?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| AutomatorError::Internal(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| AutomatorError::Internal(format!("failed to flush stdout: {e}")))?;
    Ok(())
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    // Omitted params mean "no arguments".
    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| RpcError {
        code: -32602,
        message: format!("invalid params: {e}"),
        data: Some(serde_json::json!({ "kind": "validation" })),
    })
}

#[derive(Debug, Deserialize)]
struct IdParam {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct StringIdParam {
    id: String,
}

#[derive(Debug, Deserialize)]
struct NameValueParam {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct NameParam {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ExecuteParam {
    id: i64,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TemplateListParam {
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TemplateUpdateParam {
    id: String,
    #[serde(flatten)]
    patch: TemplatePatch,
}

#[derive(Debug, Deserialize)]
struct TaskUpdateParam {
    id: i64,
    #[serde(flatten)]
    patch: TaskPatch,
}

/// Route one request to its operation.
async fn dispatch(ctx: &AppContext, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    let result = route(ctx, &request.method, request.params).await;
    match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err(RouteError::UnknownMethod) => RpcResponse::err(
            id,
            -32601,
            format!("unknown method {:?}", request.method),
            None,
        ),
        Err(RouteError::Params(e)) => RpcResponse {
            jsonrpc: JSONRPC_VERSION,
            result: None,
            error: Some(e),
            id,
        },
        Err(RouteError::App(e)) => RpcResponse::from_app_error(id, &e),
    }
}

enum RouteError {
    UnknownMethod,
    Params(RpcError),
    App(AutomatorError),
}

impl From<AutomatorError> for RouteError {
    fn from(e: AutomatorError) -> Self {
        Self::App(e)
    }
}

impl From<RpcError> for RouteError {
    fn from(e: RpcError) -> Self {
        Self::Params(e)
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, RouteError> {
    serde_json::to_value(value)
        .map_err(|e| RouteError::App(AutomatorError::Internal(e.to_string())))
}

async fn route(ctx: &AppContext, method: &str, params: Value) -> Result<Value, RouteError> {
    match method {
        "automator.template.list" => {
            let p: TemplateListParam = parse_params(params)?;
            to_value(ctx.list_templates(p.category.as_deref())?)
        }
        "automator.template.get" => {
            let p: StringIdParam = parse_params(params)?;
            to_value(ctx.get_template(&p.id)?)
        }
        "automator.template.create" => {
            let template: Template = parse_params(params)?;
            to_value(ctx.create_template(template)?)
        }
        "automator.template.update" => {
            let p: TemplateUpdateParam = parse_params(params)?;
            to_value(ctx.update_template(&p.id, &p.patch)?)
        }
        "automator.template.delete" => {
            let p: StringIdParam = parse_params(params)?;
            ctx.delete_template(&p.id)?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        "automator.task.list" => {
            let filter: TaskFilter = parse_params(params)?;
            to_value(ctx.list_tasks(&filter)?)
        }
        "automator.task.get" => {
            let p: IdParam = parse_params(params)?;
            to_value(ctx.get_task(p.id)?)
        }
        "automator.task.create" => {
            let draft: TaskDraft = parse_params(params)?;
            to_value(ctx.create_task(draft)?)
        }
        "automator.task.update" => {
            let p: TaskUpdateParam = parse_params(params)?;
            to_value(ctx.update_task(p.id, p.patch)?)
        }
        "automator.task.delete" => {
            let p: IdParam = parse_params(params)?;
            ctx.delete_task(p.id)?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        "automator.task.toggle" => {
            let p: IdParam = parse_params(params)?;
            to_value(ctx.toggle_task(p.id)?)
        }
        "automator.task.execute" => {
            let p: ExecuteParam = parse_params(params)?;
            let outcome = ctx.execute_task(p.id, p.timeout_ms).await?;
            Ok(serde_json::json!({
                "execution": outcome.execution,
                "success": outcome.success,
                "error": outcome.error,
            }))
        }
        "automator.execution.list" => {
            let filter: ExecutionFilter = parse_params(params)?;
            to_value(ctx.list_executions(&filter)?)
        }
        "automator.execution.get" => {
            let p: IdParam = parse_params(params)?;
            to_value(ctx.get_execution(p.id)?)
        }
        "automator.credential.list" => to_value(ctx.list_credentials()?),
        "automator.credential.create" => {
            let draft: CredentialDraft = parse_params(params)?;
            to_value(ctx.create_credential(draft)?)
        }
        "automator.credential.update_value" => {
            let p: NameValueParam = parse_params(params)?;
            ctx.update_credential_value(&p.name, &p.value)?;
            Ok(serde_json::json!({ "updated": true }))
        }
        "automator.credential.clear_value" => {
            let p: NameParam = parse_params(params)?;
            ctx.clear_credential_value(&p.name)?;
            Ok(serde_json::json!({ "cleared": true }))
        }
        "automator.credential.delete" => {
            let p: IdParam = parse_params(params)?;
            ctx.delete_credential(p.id)?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        "automator.system.status" => to_value(ctx.status()?),
        _ => Err(RouteError::UnknownMethod),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn request_parses_with_defaulted_params() {
        let request: RpcRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"automator.system.status","id":1}"#,
        )
        .unwrap();
        assert_eq!(request.method, "automator.system.status");
        assert!(request.params.is_null());
    }

    #[test]
    fn error_response_carries_kind() {
        let response = RpcResponse::from_app_error(
            serde_json::json!(7),
            &AutomatorError::NotFound("task 9".into()),
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], serde_json::json!(-32000));
        assert_eq!(json["error"]["data"]["kind"], serde_json::json!("not_found"));
        assert!(json.get("result").is_none());
    }

    #[test]
    fn ok_response_omits_error() {
        let response = RpcResponse::ok(serde_json::json!(1), serde_json::json!({"x": 1}));
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["result"]["x"], serde_json::json!(1));
    }
}
