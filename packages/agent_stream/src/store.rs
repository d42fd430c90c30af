//! Session Store
//!
//! The single observable state container for one chat session. Readers take
//! snapshots; writes come only from the session actor, one event at a time,
//! under a single write lock, so a reader never sees half of an event applied.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stream_protocol::Suggestion;
use tokio::sync::{RwLock, broadcast};

use crate::connection::ConnectionStatus;

/// Per-session message identifier. Strictly increasing in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Error,
}

/// One entry in the conversation.
///
/// Once `is_streaming` is false the message is a historical record and is
/// never appended to again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub is_streaming: bool,
}

/// Why the last connection went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectInfo {
    pub code: Option<u16>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Everything the UI can observe about a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub status: ConnectionStatus,
    /// Assigned by the backend after connect
    pub session_id: Option<String>,
    /// A response is in flight (input should be disabled)
    pub is_streaming: bool,
    /// Agent currently producing output
    pub active_agent: Option<String>,
    pub messages: Vec<Message>,
    /// Review suggestions, kept apart from the conversation
    pub suggestions: Vec<Suggestion>,
    /// Content of the file open in the editor, attached to review requests
    pub active_file_content: String,
    /// Consecutive reconnect attempts since the last successful open
    pub reconnect_attempt: u32,
    pub last_disconnect: Option<DisconnectInfo>,
    next_message_id: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The message currently receiving tokens, if any.
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.is_streaming)
    }

    pub(crate) fn streaming_message_mut(&mut self) -> Option<&mut Message> {
        self.messages.iter_mut().rev().find(|m| m.is_streaming)
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Append a message and return its id.
    pub(crate) fn push_message(
        &mut self,
        role: Role,
        content: String,
        sender: Option<String>,
        is_streaming: bool,
    ) -> MessageId {
        self.next_message_id += 1;
        let id = MessageId(self.next_message_id);
        self.messages.push(Message {
            id,
            role,
            content,
            timestamp: Utc::now(),
            sender,
            is_streaming,
        });
        id
    }

    /// Close the in-flight streaming message, returning its id.
    pub(crate) fn finalize_streaming(&mut self) -> Option<MessageId> {
        let message = self.streaming_message_mut()?;
        message.is_streaming = false;
        Some(message.id)
    }

    /// Echo of a user message that has already been written to
    /// the wire. Starts a new turn: any response still streaming is closed.
    pub(crate) fn push_user_message(&mut self, text: &str) -> MessageId {
        self.finalize_streaming();
        let id = self.push_message(Role::User, text.to_string(), None, false);
        self.is_streaming = true;
        id
    }
}

/// What changed in the last store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Status(ConnectionStatus),
    Messages,
    Suggestions,
    Session,
}

/// Shared handle to a session's state. Cheap to clone.
#[derive(Clone)]
pub struct SessionStore {
    state: Arc<RwLock<SessionState>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(SessionState::new())),
            changes,
        }
    }

    /// A consistent copy of the current state.
    pub async fn snapshot(&self) -> SessionState {
        self.state.read().await.clone()
    }

    /// Read part of the state without cloning all of it.
    pub async fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&*self.state.read().await)
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status
    }

    /// Subscribe to change notifications. Lagging receivers should re-read a
    /// snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Apply one mutation atomically. `f` reports what it changed; `None`
    /// means nothing observable happened and no notification is sent.
    pub(crate) async fn update<R>(
        &self,
        f: impl FnOnce(&mut SessionState) -> (R, Option<StoreChange>),
    ) -> R {
        let (result, change) = {
            let mut state = self.state.write().await;
            f(&mut state)
        };
        if let Some(change) = change {
            // No receivers is fine: nobody is rendering yet
            let _ = self.changes.send(change);
        }
        result
    }

    pub(crate) async fn set_status(&self, status: ConnectionStatus) {
        self.update(|state| {
            if state.status == status {
                ((), None)
            } else {
                state.status = status;
                ((), Some(StoreChange::Status(status)))
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_increase() {
        let mut state = SessionState::new();
        let a = state.push_message(Role::User, "a".into(), None, false);
        let b = state.push_message(Role::Assistant, "b".into(), Some("coder".into()), true);
        assert!(b > a);
        assert_eq!(state.message(b).unwrap().content, "b");
    }

    #[test]
    fn finalize_without_streaming_is_noop() {
        let mut state = SessionState::new();
        state.push_message(Role::User, "a".into(), None, false);
        assert_eq!(state.finalize_streaming(), None);
    }

    #[test]
    fn user_message_closes_streaming_response() {
        let mut state = SessionState::new();
        let streaming = state.push_message(Role::Assistant, "part".into(), None, true);
        let user = state.push_user_message("next question");

        assert!(!state.message(streaming).unwrap().is_streaming);
        let user_msg = state.message(user).unwrap();
        assert_eq!(user_msg.role, Role::User);
        assert!(!user_msg.is_streaming);
        assert!(state.is_streaming);
        assert!(state.streaming_message().is_none());
    }

    #[tokio::test]
    async fn update_notifies_subscribers() {
        let store = SessionStore::new();
        let mut changes = store.subscribe();

        store.set_status(ConnectionStatus::Connecting).await;
        assert_eq!(
            changes.recv().await.unwrap(),
            StoreChange::Status(ConnectionStatus::Connecting)
        );
        assert_eq!(store.status().await, ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn unchanged_status_is_silent() {
        let store = SessionStore::new();
        let mut changes = store.subscribe();

        store.set_status(ConnectionStatus::Disconnected).await;
        assert!(matches!(
            changes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
