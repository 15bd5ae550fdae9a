//! Decoding of the streaming query endpoint's wire records.
//!
//! The backend emits newline-delimited records of the form
//! `data: {"event": ..., "data": ...}`. Records are self-delimited but may
//! arrive split across reads; `client::ApiClient::post_stream` reassembles
//! complete lines before handing them to [`parse_record`].

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One retrieval source cited by the assistant.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SourceRef {
    pub display_name: String,
}

/// One discrete, typed record delivered over the streaming response.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// A chunk of assistant text. `new_message` asks for a fresh bubble.
    Token { chunk: String, new_message: bool },
    /// Citation list for the current assistant turn.
    Sources(Vec<SourceRef>),
    /// The agent started a tool invocation.
    ToolStart { name: String },
    /// The tool invocation finished.
    ToolEnd { name: String },
    /// Normal termination.
    End,
    /// Server-side failure; the stream stops after this.
    Error(String),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct TokenData {
    #[serde(default)]
    chunk: String,
    #[serde(default)]
    new_message: bool,
}

#[derive(Deserialize)]
struct ToolData {
    name: String,
}

/// Parse one complete line into a stream event.
///
/// Returns `None` for blank lines, lines without the `data: ` prefix, and
/// malformed records — a bad record is logged and skipped, never fatal.
pub fn parse_record(line: &str) -> Option<StreamEvent> {
    let payload = line.strip_prefix("data: ")?.trim();
    if payload.is_empty() {
        return None;
    }

    let envelope: Envelope = match serde_json::from_str(payload) {
        Ok(env) => env,
        Err(err) => {
            warn!(line = payload, error = %err, "Skipping malformed stream record");
            return None;
        }
    };

    let event = match envelope.event.as_str() {
        "token" => {
            let data: TokenData = decode_data(envelope.data)?;
            StreamEvent::Token {
                chunk: data.chunk,
                new_message: data.new_message,
            }
        }
        "sources" => {
            let sources: Vec<SourceRef> = decode_data(envelope.data)?;
            StreamEvent::Sources(sources)
        }
        "tool_start" => {
            let data: ToolData = decode_data(envelope.data)?;
            StreamEvent::ToolStart { name: data.name }
        }
        "tool_end" => {
            let data: ToolData = decode_data(envelope.data)?;
            StreamEvent::ToolEnd { name: data.name }
        }
        "end" => StreamEvent::End,
        "error" => {
            let message = envelope
                .data
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| envelope.data.to_string());
            StreamEvent::Error(message)
        }
        other => {
            warn!(event = other, "Skipping unknown stream event type");
            return None;
        }
    };

    Some(event)
}

fn decode_data<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(data) => Some(data),
        Err(err) => {
            warn!(error = %err, "Skipping stream record with malformed payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_record() {
        let event = parse_record(
            r#"data: {"event": "token", "data": {"chunk": "PTO", "new_message": false}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::Token {
                chunk: "PTO".to_string(),
                new_message: false
            }
        );
    }

    #[test]
    fn test_parse_sources_record() {
        let event = parse_record(
            r#"data: {"event": "sources", "data": [{"display_name": "hr.pdf"}]}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::Sources(vec![SourceRef {
                display_name: "hr.pdf".to_string()
            }])
        );
    }

    #[test]
    fn test_parse_tool_records() {
        assert_eq!(
            parse_record(r#"data: {"event": "tool_start", "data": {"name": "rag"}}"#),
            Some(StreamEvent::ToolStart {
                name: "rag".to_string()
            })
        );
        assert_eq!(
            parse_record(r#"data: {"event": "tool_end", "data": {"name": "rag"}}"#),
            Some(StreamEvent::ToolEnd {
                name: "rag".to_string()
            })
        );
    }

    #[test]
    fn test_parse_end_and_error() {
        assert_eq!(
            parse_record(r#"data: {"event": "end", "data": null}"#),
            Some(StreamEvent::End)
        );
        assert_eq!(
            parse_record(r#"data: {"event": "error", "data": "model unavailable"}"#),
            Some(StreamEvent::Error("model unavailable".to_string()))
        );
    }

    #[test]
    fn test_blank_and_unprefixed_lines_are_skipped() {
        assert_eq!(parse_record(""), None);
        assert_eq!(parse_record("data: "), None);
        assert_eq!(parse_record(": keep-alive"), None);
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        assert_eq!(parse_record("data: {not json}"), None);
        assert_eq!(
            parse_record(r#"data: {"event": "token", "data": "wrong shape"}"#),
            None
        );
        assert_eq!(parse_record(r#"data: {"event": "mystery"}"#), None);
    }
}
