//! Inbound payload decoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::{DecodeFailure, Event, ParseVariantError, Severity, Suggestion};

/// Which backend vocabulary to accept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Accept every known tag from both backend generations.
    #[default]
    Superset,
    /// `token` / `complete` / `error` / `connected`
    Token,
    /// `stream_start` / `stream_token` / `stream_end` / `agent_response` /
    /// `suggestion` / `connected` / `error`
    Streaming,
}

impl Dialect {
    /// Whether `tag` is part of this dialect's vocabulary.
    pub fn accepts(self, tag: &str) -> bool {
        match self {
            Dialect::Superset => true,
            Dialect::Token => matches!(tag, "token" | "complete" | "error" | "connected"),
            Dialect::Streaming => matches!(
                tag,
                "stream_start"
                    | "stream_token"
                    | "stream_end"
                    | "agent_response"
                    | "suggestion"
                    | "connected"
                    | "error"
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Superset => "superset",
            Dialect::Token => "token",
            Dialect::Streaming => "streaming",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "superset" => Ok(Dialect::Superset),
            "token" => Ok(Dialect::Token),
            "streaming" => Ok(Dialect::Streaming),
            _ => Err(ParseVariantError {
                kind: "dialect",
                value: s.to_string(),
                expected: "superset, token, streaming",
            }),
        }
    }
}

/// A decoded event plus the envelope metadata used for log correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: Event,
    pub correlation_id: Option<String>,
}

/// Read-only view over one inbound object. Each tag pulls only the fields it
/// uses, and a field of an unexpected shape reads as absent.
struct Fields<'a>(&'a Map<String, Value>);

impl Fields<'_> {
    fn text(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(scalar_text)
    }

    /// Plain string, or a list of content parts (`"text"` strings or
    /// `{"type":"text","text":...}` objects) joined in order.
    fn content(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::Array(parts) => Some(parts.iter().filter_map(part_text).collect()),
            other => scalar_text(other),
        }
    }

    fn count(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn part_text(part: &Value) -> Option<&str> {
    match part {
        Value::String(s) => Some(s),
        Value::Object(obj) => obj.get("text").and_then(Value::as_str),
        _ => None,
    }
}

/// Decode one wire payload into an [`Event`]. Never fails.
pub fn decode(payload: &str, dialect: Dialect) -> Event {
    decode_frame(payload, dialect).event
}

/// Decode one wire payload, keeping the correlation id when present.
pub fn decode_frame(payload: &str, dialect: Dialect) -> Frame {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => return unframed(malformed(&e.to_string())),
    };
    let Value::Object(obj) = &value else {
        return unframed(malformed("expected a JSON object"));
    };
    let fields = Fields(obj);
    let Some(kind) = fields.get("type").and_then(Value::as_str) else {
        return unframed(malformed("missing string field `type`"));
    };

    let event = if dialect.accepts(kind) {
        map_frame(kind, &fields)
    } else {
        Event::DecodeFailure(DecodeFailure::Unsupported(kind.to_string()))
    };

    Frame {
        event,
        correlation_id: fields.text("correlation_id"),
    }
}

fn unframed(event: Event) -> Frame {
    Frame {
        event,
        correlation_id: None,
    }
}

fn map_frame(kind: &str, f: &Fields<'_>) -> Event {
    match kind {
        "token" | "stream_token" => Event::Token {
            content: f.content("content").unwrap_or_default(),
            sender: f.text("sender").or_else(|| f.text("agent")),
        },
        "stream_start" => Event::StreamStart {
            sender: f.text("agent").or_else(|| f.text("sender")),
            label: f.text("label"),
        },
        "stream_end" => Event::StreamEnd,
        "complete" => Event::Complete {
            message: f.text("message"),
            events: f.count("events"),
        },
        "agent_response" => Event::AgentResponse {
            content: f.content("content").unwrap_or_default(),
            agent: f.text("agent").or_else(|| f.text("sender")),
        },
        "suggestion" => match f.text("message") {
            Some(message) => Event::Suggestion(Suggestion {
                line: f.get("line").and_then(line_number),
                message,
                severity: f
                    .text("severity")
                    .as_deref()
                    .map(Severity::parse)
                    .unwrap_or(Severity::Info),
                agent: f.text("agent").or_else(|| f.text("sender")),
            }),
            None => malformed("suggestion without message"),
        },
        "connected" => match f.text("session_id") {
            Some(session_id) => Event::SessionAssigned { session_id },
            None => malformed("connected without session_id"),
        },
        "error" => Event::Error {
            message: error_text(f.text("error"), f.text("details")),
            code: f.text("code"),
        },
        other => Event::DecodeFailure(DecodeFailure::Unsupported(other.to_string())),
    }
}

fn malformed(reason: &str) -> Event {
    Event::DecodeFailure(DecodeFailure::Malformed(reason.to_string()))
}

fn error_text(error: Option<String>, details: Option<String>) -> String {
    match (error, details) {
        (Some(error), Some(details)) if !details.is_empty() => format!("{error}: {details}"),
        (Some(error), _) => error,
        (None, Some(details)) => details,
        (None, None) => "unknown error".to_string(),
    }
}

fn line_number(line: &Value) -> Option<u32> {
    match line {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
