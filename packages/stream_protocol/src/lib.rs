//! # Stream Protocol
//!
//! Wire vocabulary spoken between the review client and the agent backend.
//!
//! ## Overview
//!
//! The backend pushes one JSON object per WebSocket text frame. Every object
//! carries a `type` tag; the remaining fields depend on the tag:
//!
//! ```text
//! {"type": "stream_start", "agent": "coder"}
//! {"type": "token", "content": "def f", "sender": "coder"}
//! {"type": "stream_end"}
//! {"type": "connected", "session_id": "abc"}
//! {"type": "error", "error": "Processing failed", "details": "..."}
//! ```
//!
//! Two backend generations exist with overlapping vocabularies. A [`Dialect`]
//! selects which tags are recognised; [`Dialect::Superset`] accepts both.
//!
//! Decoding is total: [`decode`] never fails. Malformed payloads and tags
//! outside the dialect come back as [`Event::DecodeFailure`] so callers can
//! log and drop them without tearing down the connection.
//!
//! ## Quick Start
//!
//! ```rust
//! use stream_protocol::{Dialect, Event, decode};
//!
//! let event = decode(r#"{"type":"token","content":"hi","sender":"coder"}"#, Dialect::Superset);
//! assert_eq!(
//!     event,
//!     Event::Token { content: "hi".into(), sender: Some("coder".into()) }
//! );
//! ```
//!
//! Outbound messages are either sent verbatim or wrapped in a review
//! envelope, depending on the deployment:
//!
//! ```rust
//! use stream_protocol::{OutboundFormat, encode_outbound};
//!
//! let payload = encode_outbound(OutboundFormat::ReviewEnvelope, "check this", Some("x = 1")).unwrap();
//! assert_eq!(payload, r#"{"type":"review","message":"check this","code":"x = 1"}"#);
//! ```

pub mod decode;
pub mod encode;
pub mod event;

pub use decode::{Dialect, Frame, decode, decode_frame};
pub use encode::{OutboundFormat, encode_outbound};
pub use event::{DecodeFailure, Event, ParseVariantError, Severity, Suggestion};
