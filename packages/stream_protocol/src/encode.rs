//! Outbound payload encoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::event::ParseVariantError;

/// How user messages are put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundFormat {
    /// The message text, verbatim.
    #[default]
    PlainText,
    /// `{"type":"review","message":...,"code":...}`
    ReviewEnvelope,
}

impl OutboundFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundFormat::PlainText => "plain_text",
            OutboundFormat::ReviewEnvelope => "review_envelope",
        }
    }
}

impl fmt::Display for OutboundFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboundFormat {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "plain_text" | "plain" | "text" => Ok(OutboundFormat::PlainText),
            "review_envelope" | "envelope" | "review" => Ok(OutboundFormat::ReviewEnvelope),
            _ => Err(ParseVariantError {
                kind: "outbound format",
                value: s.to_string(),
                expected: "plain_text, review_envelope",
            }),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope<'a> {
    Review {
        message: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<&'a str>,
    },
}

/// Encode a user message for the wire.
///
/// `code` is the content of the file under review. It is dropped for
/// [`OutboundFormat::PlainText`] and omitted from the envelope when empty.
pub fn encode_outbound(
    format: OutboundFormat,
    message: &str,
    code: Option<&str>,
) -> Result<String, serde_json::Error> {
    match format {
        OutboundFormat::PlainText => Ok(message.to_string()),
        OutboundFormat::ReviewEnvelope => serde_json::to_string(&Envelope::Review {
            message,
            code: code.filter(|c| !c.is_empty()),
        }),
    }
}
