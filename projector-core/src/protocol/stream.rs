//! Stream command parsing and reply encoding.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// One command extracted from a message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamCommand {
    /// `{"stream": bool}`
    SetStreaming(bool),
    /// `{"get": "stream"}`
    GetStream,
    /// `{"get": "ping"}`
    Ping,
    /// `{"set": "answer", "answer": ...}`; the envelope is validated later,
    /// only if a session is running.
    SetAnswer(Value),
}

/// Parse one message into its commands, in `stream`, `get`, `set` order.
pub fn parse_commands(text: &str) -> Result<Vec<StreamCommand>, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let mut commands = Vec::new();
    if let Some(stream) = object.get("stream") {
        let start = stream.as_bool().ok_or(ProtocolError::InvalidField {
            key: "stream",
            expected: "a boolean",
        })?;
        commands.push(StreamCommand::SetStreaming(start));
    }
    if let Some(target) = target(&object, "get")? {
        commands.push(match target {
            "stream" => StreamCommand::GetStream,
            "ping" => StreamCommand::Ping,
            other => {
                return Err(ProtocolError::UnknownTarget {
                    key: "get",
                    value: other.into(),
                });
            }
        });
    }
    if let Some(target) = target(&object, "set")? {
        match target {
            "answer" => {
                // Without an `answer` payload there is nothing to apply.
                if let Some(answer) = object.get("answer") {
                    commands.push(StreamCommand::SetAnswer(answer.clone()));
                }
            }
            other => {
                return Err(ProtocolError::UnknownTarget {
                    key: "set",
                    value: other.into(),
                });
            }
        }
    }

    if commands.is_empty() && !object.contains_key("set") {
        return Err(ProtocolError::NoCommand);
    }
    Ok(commands)
}

fn target<'a>(object: &'a Map<String, Value>, key: &'static str) -> Result<Option<&'a str>, ProtocolError> {
    match object.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ProtocolError::InvalidField {
            key,
            expected: "a string",
        }),
    }
}

// ── Replies ──────────────────────────────────────────────────────

/// A reply written back on the command channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Status {
        #[serde(rename = "isStreaming")]
        is_streaming: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        offer: Option<Value>,
    },
    Pong {
        pong: bool,
    },
    Success {
        success: bool,
    },
    Error {
        error: bool,
        message: String,
    },
}

impl Reply {
    pub fn success() -> Self {
        Reply::Success { success: true }
    }

    pub fn pong() -> Self {
        Reply::Pong { pong: true }
    }

    pub fn error(message: impl ToString) -> Self {
        Reply::Error {
            error: true,
            message: message.to_string(),
        }
    }

    pub fn not_streaming() -> Self {
        Reply::Status {
            is_streaming: false,
            offer: None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }

    /// Single-line JSON encoding.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"error":true,"message":"reply encoding failed: {e}"}}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_each_command() {
        assert_eq!(
            parse_commands(r#"{"stream": true}"#).unwrap(),
            vec![StreamCommand::SetStreaming(true)]
        );
        assert_eq!(
            parse_commands(r#"{"get": "stream"}"#).unwrap(),
            vec![StreamCommand::GetStream]
        );
        assert_eq!(
            parse_commands(r#"{"get": "ping"}"#).unwrap(),
            vec![StreamCommand::Ping]
        );
        let answer = json!({ "type": "answer", "sdp": "v=0" });
        let line = json!({ "set": "answer", "answer": answer }).to_string();
        assert_eq!(
            parse_commands(&line).unwrap(),
            vec![StreamCommand::SetAnswer(answer)]
        );
    }

    #[test]
    fn combined_message_keeps_order() {
        let commands = parse_commands(r#"{"get": "stream", "stream": true}"#).unwrap();
        assert_eq!(
            commands,
            vec![StreamCommand::SetStreaming(true), StreamCommand::GetStream]
        );
    }

    #[test]
    fn set_answer_without_payload_is_a_no_op() {
        assert!(parse_commands(r#"{"set": "answer"}"#).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(parse_commands("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(parse_commands("[1, 2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(
            parse_commands(r#"{"stream": "yes"}"#),
            Err(ProtocolError::InvalidField { key: "stream", .. })
        ));
        assert!(matches!(
            parse_commands(r#"{"get": "weather"}"#),
            Err(ProtocolError::UnknownTarget { key: "get", .. })
        ));
        assert!(matches!(
            parse_commands(r#"{"get": 3}"#),
            Err(ProtocolError::InvalidField { key: "get", .. })
        ));
        assert!(matches!(parse_commands(r#"{"hello": 1}"#), Err(ProtocolError::NoCommand)));
    }

    #[test]
    fn reply_shapes() {
        assert_eq!(Reply::success().to_json(), r#"{"success":true}"#);
        assert_eq!(Reply::pong().to_json(), r#"{"pong":true}"#);
        assert_eq!(Reply::not_streaming().to_json(), r#"{"isStreaming":false}"#);

        let status = Reply::Status {
            is_streaming: true,
            offer: Some(json!({ "type": "offer", "sdp": "v=0" })),
        };
        let value: Value = serde_json::from_str(&status.to_json()).unwrap();
        assert_eq!(value["isStreaming"], json!(true));
        assert_eq!(value["offer"]["type"], json!("offer"));

        let error: Value = serde_json::from_str(&Reply::error("boom").to_json()).unwrap();
        assert_eq!(error, json!({ "error": true, "message": "boom" }));
    }
}
