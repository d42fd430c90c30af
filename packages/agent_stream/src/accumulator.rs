//! Message Accumulator
//!
//! Folds decoded events into the session's message list.
//!
//! ## Merge rules
//!
//! - `stream_start`: close any streaming message, open a new empty one for
//!   the sender.
//! - `token`: append to the streaming message when the sender matches (or
//!   the token names no sender). A different sender is an implicit handover:
//!   the current message is closed and a new one starts with this token.
//!   With nothing streaming, a new message starts.
//! - `stream_end` / `complete`: close the streaming message and clear the
//!   turn.
//! - `error`: close the streaming message (its content stays) and append a
//!   separate error message.
//! - `agent_response`: close the streaming message and append a finished
//!   assistant message.
//! - `suggestion`: goes to the suggestions list.
//! - decode failures: ignored here; the caller logs them.
//!
//! At most one message is streaming after any event.

use std::time::Duration;

use stream_protocol::Event;
use tokio::time::Instant;

use crate::store::{MessageId, Role, SessionState, StoreChange};

/// Summary of what one event did to the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A new streaming message was opened
    Started { id: MessageId },
    /// Text was appended to the streaming message
    Appended { id: MessageId },
    /// The streaming message changed hands to another agent
    HandedOver {
        finished: MessageId,
        started: MessageId,
    },
    /// The turn ended; `id` is the message that was closed, if one was open
    Finished { id: Option<MessageId> },
    /// A complete message was inserted (agent response or error)
    Inserted { id: MessageId },
    Suggested,
    SessionAssigned,
    /// Nothing changed
    Ignored,
}

impl Applied {
    /// The store notification matching this outcome.
    pub fn change(&self) -> Option<StoreChange> {
        match self {
            Applied::Started { .. }
            | Applied::Appended { .. }
            | Applied::HandedOver { .. }
            | Applied::Finished { .. }
            | Applied::Inserted { .. } => Some(StoreChange::Messages),
            Applied::Suggested => Some(StoreChange::Suggestions),
            Applied::SessionAssigned => Some(StoreChange::Session),
            Applied::Ignored => None,
        }
    }
}

/// Stateful reducer from events to message-list mutations.
///
/// Holds only the time of the last activity in the open turn, for the idle
/// watchdog.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    last_activity: Option<Instant>,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Must be called strictly in delivery order.
    pub fn apply(&mut self, state: &mut SessionState, event: &Event) -> Applied {
        match event {
            Event::StreamStart { sender, .. } => {
                state.finalize_streaming();
                let id = self.start(state, sender.clone(), String::new());
                Applied::Started { id }
            }

            Event::Token { content, sender } => self.token(state, content, sender.as_ref()),

            Event::StreamEnd | Event::Complete { .. } => {
                let id = state.finalize_streaming();
                state.is_streaming = false;
                state.active_agent = None;
                self.last_activity = None;
                Applied::Finished { id }
            }

            Event::Error { message, .. } => {
                state.finalize_streaming();
                let id = state.push_message(Role::Error, message.clone(), None, false);
                state.is_streaming = false;
                state.active_agent = None;
                self.last_activity = None;
                Applied::Inserted { id }
            }

            Event::AgentResponse { content, agent } => {
                state.finalize_streaming();
                let id = state.push_message(Role::Assistant, content.clone(), agent.clone(), false);
                state.active_agent = agent.clone();
                self.last_activity = Some(Instant::now());
                Applied::Inserted { id }
            }

            Event::Suggestion(suggestion) => {
                state.suggestions.push(suggestion.clone());
                Applied::Suggested
            }

            Event::SessionAssigned { session_id } => {
                state.session_id = Some(session_id.clone());
                Applied::SessionAssigned
            }

            Event::DecodeFailure(_) => Applied::Ignored,
        }
    }

    fn token(&mut self, state: &mut SessionState, content: &str, sender: Option<&String>) -> Applied {
        let current = state
            .streaming_message()
            .map(|m| (m.id, m.sender.clone()));

        match current {
            Some((id, current_sender)) if sender.is_none() || sender == current_sender.as_ref() => {
                if let Some(message) = state.streaming_message_mut() {
                    message.content.push_str(content);
                }
                self.last_activity = Some(Instant::now());
                Applied::Appended { id }
            }
            Some((finished, _)) => {
                state.finalize_streaming();
                let started = self.start(state, sender.cloned(), content.to_string());
                Applied::HandedOver { finished, started }
            }
            None => {
                let id = self.start(state, sender.cloned(), content.to_string());
                Applied::Started { id }
            }
        }
    }

    fn start(
        &mut self,
        state: &mut SessionState,
        sender: Option<String>,
        content: String,
    ) -> MessageId {
        let id = state.push_message(Role::Assistant, content, sender.clone(), true);
        state.is_streaming = true;
        state.active_agent = sender;
        self.last_activity = Some(Instant::now());
        id
    }

    /// Start the idle clock for a turn the user just opened.
    pub fn begin_turn(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    /// End a turn with no activity for `timeout`: close the streaming message,
    /// if there is one, and clear the turn. `None` while the turn is live or
    /// when no turn is open.
    pub fn finalize_stale(
        &mut self,
        state: &mut SessionState,
        now: Instant,
        timeout: Duration,
    ) -> Option<Applied> {
        let last = self.last_activity?;
        if now.saturating_duration_since(last) < timeout {
            return None;
        }
        self.last_activity = None;
        if !state.is_streaming && state.streaming_message().is_none() {
            return None;
        }
        let id = state.finalize_streaming();
        state.is_streaming = false;
        state.active_agent = None;
        Some(Applied::Finished { id })
    }
}
