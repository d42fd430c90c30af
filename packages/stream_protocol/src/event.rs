use serde::{Deserialize, Serialize};

/// One decoded inbound payload.
///
/// Events carry no ordering information; the transport delivers them in
/// order per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Incremental text for the current streaming message.
    Token {
        content: String,
        sender: Option<String>,
    },

    /// A new assistant turn begins.
    StreamStart {
        sender: Option<String>,
        /// Human-readable agent label, when the backend sends one
        label: Option<String>,
    },

    /// The streaming message is done.
    StreamEnd,

    /// The whole request is done (token dialect terminator).
    Complete {
        message: Option<String>,
        /// Number of graph events the backend processed
        events: Option<u64>,
    },

    /// One complete, already-finalized agent message.
    AgentResponse {
        content: String,
        agent: Option<String>,
    },

    /// Inline review suggestion, kept out of the message stream.
    Suggestion(Suggestion),

    /// The backend reported an application failure.
    Error {
        message: String,
        code: Option<String>,
    },

    /// The backend assigned an id to this session.
    SessionAssigned { session_id: String },

    /// The payload could not be turned into any of the above.
    DecodeFailure(DecodeFailure),
}

impl Event {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Token { .. } => "token",
            Event::StreamStart { .. } => "stream_start",
            Event::StreamEnd => "stream_end",
            Event::Complete { .. } => "complete",
            Event::AgentResponse { .. } => "agent_response",
            Event::Suggestion(_) => "suggestion",
            Event::Error { .. } => "error",
            Event::SessionAssigned { .. } => "session_assigned",
            Event::DecodeFailure(_) => "decode_failure",
        }
    }

    /// Returns true for events that close the current streaming message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::StreamEnd | Event::Complete { .. })
    }
}

/// Why a payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeFailure {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unsupported event type: {0}")]
    Unsupported(String),
}

/// Severity attached to a review suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
    Hint,
}

impl Severity {
    /// Lenient parse used by the decoder. Unrecognised values become `Info`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" | "critical" | "high" => Severity::Error,
            "warning" | "warn" | "medium" => Severity::Warning,
            "hint" | "low" => Severity::Hint,
            _ => Severity::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Hint => "hint",
        }
    }
}

/// A suggestion anchored to a line of the file under review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// Returned by the `FromStr` impls of the configuration enums.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}' (expected one of: {expected})")]
pub struct ParseVariantError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parse_is_lenient() {
        assert_eq!(Severity::parse("ERROR"), Severity::Error);
        assert_eq!(Severity::parse(" warn "), Severity::Warning);
        assert_eq!(Severity::parse("medium"), Severity::Warning);
        assert_eq!(Severity::parse("low"), Severity::Hint);
        assert_eq!(Severity::parse("whatever"), Severity::Info);
        assert_eq!(Severity::parse(""), Severity::Info);
    }

    #[test]
    fn terminal_events() {
        assert!(Event::StreamEnd.is_terminal());
        assert!(
            Event::Complete {
                message: None,
                events: None
            }
            .is_terminal()
        );
        assert!(
            !Event::Token {
                content: "x".into(),
                sender: None
            }
            .is_terminal()
        );
    }

    #[test]
    fn decode_failure_display() {
        let err = DecodeFailure::Unsupported("ping".into());
        assert_eq!(err.to_string(), "unsupported event type: ping");
    }

    #[test]
    fn suggestion_serializes_without_empty_fields() {
        let suggestion = Suggestion {
            line: None,
            message: "rename".into(),
            severity: Severity::Hint,
            agent: None,
        };
        let json = serde_json::to_string(&suggestion).unwrap();
        assert_eq!(json, r#"{"message":"rename","severity":"hint"}"#);
    }
}
