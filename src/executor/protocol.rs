//! NDJSON line protocol between the daemon and a script host process.
//!
//! The daemon writes one [`ScriptInput`] JSON line to the host's stdin and
//! closes it. The host answers with a stream of [`ScriptEvent`] lines on
//! stdout: any number of `console` events followed by exactly one `result`
//! or `error` event. Stdout carries nothing else.

use serde::{Deserialize, Serialize};

use crate::store::types::{ConsoleLevel, ParamValues};

/// Maximum accepted bytes per event line from the host.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// Error message emitted by the host when the script's return value cannot
/// be serialised to JSON.
pub const NON_SERIALISABLE_RETURN: &str = "return value not serialisable";

/// Everything a script run needs, delivered over stdin so that secrets
/// never appear in argv or the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptInput {
    /// User script source text.
    pub code: String,
    /// Validated parameter values (defaults already substituted).
    pub params: ParamValues,
    /// Decrypted plaintexts for the task's granted credentials.
    pub credentials: std::collections::BTreeMap<String, String>,
}

impl ScriptInput {
    /// Serialise to a single JSON line (with trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// One event line from the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScriptEvent {
    /// A console line flushed by the sandbox `console` object.
    Console {
        level: ConsoleLevel,
        message: String,
    },
    /// Successful completion. `value` is absent when the script returned
    /// nothing.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    /// The script threw, or its return value could not be serialised.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn input_line_round_trip() {
        let mut credentials = std::collections::BTreeMap::new();
        credentials.insert("SLACK_WEBHOOK_URL".to_owned(), "https://example/hook".to_owned());
        let input = ScriptInput {
            code: "return credentials.SLACK_WEBHOOK_URL".to_owned(),
            params: ParamValues::new(),
            credentials,
        };
        let line = input.to_line().unwrap();
        assert!(line.ends_with('\n'));
        let parsed: ScriptInput = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed.code, input.code);
        assert_eq!(
            parsed.credentials.get("SLACK_WEBHOOK_URL").map(String::as_str),
            Some("https://example/hook")
        );
    }

    #[test]
    fn console_event_parses() {
        let event: ScriptEvent =
            serde_json::from_str(r#"{"event":"console","level":"warn","message":"careful"}"#)
                .unwrap();
        match event {
            ScriptEvent::Console { level, message } => {
                assert_eq!(level, ConsoleLevel::Warn);
                assert_eq!(message, "careful");
            }
            other => panic!("expected console event, got {other:?}"),
        }
    }

    #[test]
    fn result_event_value_is_optional() {
        let bare: ScriptEvent = serde_json::from_str(r#"{"event":"result"}"#).unwrap();
        assert!(matches!(bare, ScriptEvent::Result { value: None }));

        let valued: ScriptEvent =
            serde_json::from_str(r#"{"event":"result","value":{"ok":true}}"#).unwrap();
        match valued {
            ScriptEvent::Result { value: Some(v) } => {
                assert_eq!(v, serde_json::json!({"ok": true}));
            }
            other => panic!("expected valued result, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_tag_is_rejected() {
        let parsed = serde_json::from_str::<ScriptEvent>(r#"{"event":"exfiltrate"}"#);
        assert!(parsed.is_err());
    }
}
