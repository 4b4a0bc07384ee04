//! Built-in template seed data.
//!
//! Seeded on first initialization when absent; `is_builtin` marks them
//! non-deletable. The scripts themselves are ordinary user-level JavaScript
//! against the sandbox surface (`params`, `credentials`, `console`).

use crate::store::types::{ParamSpec, ParamType, Template};

/// The built-in templates shipped with the daemon.
#[must_use]
pub fn builtin_templates() -> Vec<Template> {
    vec![
        Template {
            id: "log-message".to_owned(),
            name: "Log a message".to_owned(),
            description: Some("Writes a message to the execution console.".to_owned()),
            category: Some("examples".to_owned()),
            code: "console.log(params.message);\nreturn params.message;".to_owned(),
            params_schema: vec![ParamSpec {
                name: "message".to_owned(),
                param_type: ParamType::String,
                required: true,
                default: None,
                description: Some("Text to log".to_owned()),
            }],
            required_credentials: Vec::new(),
            suggested_schedule: Some("*/5 * * * *".to_owned()),
            is_builtin: true,
        },
        Template {
            id: "http-check".to_owned(),
            name: "HTTP health check".to_owned(),
            description: Some(
                "Fetches a URL and fails when the response is not OK.".to_owned(),
            ),
            category: Some("monitoring".to_owned()),
            code: "const response = await fetch(params.url);\n\
                   if (!response.ok) {\n\
                     throw new Error(`${params.url} responded ${response.status}`);\n\
                   }\n\
                   console.log(`${params.url} is up (${response.status})`);\n\
                   return { status: response.status };"
                .to_owned(),
            params_schema: vec![ParamSpec {
                name: "url".to_owned(),
                param_type: ParamType::String,
                required: true,
                default: None,
                description: Some("URL to probe".to_owned()),
            }],
            required_credentials: Vec::new(),
            suggested_schedule: Some("*/15 * * * *".to_owned()),
            is_builtin: true,
        },
        Template {
            id: "webhook-notify".to_owned(),
            name: "Webhook notification".to_owned(),
            description: Some("Posts a JSON message to a webhook URL.".to_owned()),
            category: Some("notifications".to_owned()),
            code: "const response = await fetch(credentials.WEBHOOK_URL, {\n\
                     method: \"POST\",\n\
                     headers: { \"content-type\": \"application/json\" },\n\
                     body: JSON.stringify({ text: params.text }),\n\
                   });\n\
                   if (!response.ok) {\n\
                     throw new Error(`webhook responded ${response.status}`);\n\
                   }\n\
                   return { delivered: true };"
                .to_owned(),
            params_schema: vec![ParamSpec {
                name: "text".to_owned(),
                param_type: ParamType::String,
                required: false,
                default: Some(serde_json::json!("ping")),
                description: Some("Message body".to_owned()),
            }],
            required_credentials: vec!["WEBHOOK_URL".to_owned()],
            suggested_schedule: None,
            is_builtin: true,
        },
    ]
}
