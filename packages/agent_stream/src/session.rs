//! Session actor: the single place where session state changes.
//!
//! Commands from the UI (`SessionHandle`) and signals from link and timer
//! tasks (`LinkSignal`) are handled one at a time by one task, so an event is
//! always fully applied before the next one is looked at.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use stream_protocol::{Dialect, Event, OutboundFormat, decode_frame, encode_outbound};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::accumulator::{Applied, MessageAccumulator};
use crate::config::SessionConfig;
use crate::connection::{
    CloseOutcome, ConnectionManager, ConnectionStatus, Connector, LinkSignal, ReconnectScheduler,
};
use crate::error::SendError;
use crate::store::{DisconnectInfo, MessageId, SessionStore, StoreChange};

/// Commands that can be sent to a session actor
#[derive(Debug)]
pub enum SessionCommand {
    Connect {
        respond_to: oneshot::Sender<bool>,
    },
    SendUserMessage {
        text: String,
        respond_to: oneshot::Sender<Result<MessageId, SendError>>,
    },
    SetActiveFile {
        content: String,
        respond_to: oneshot::Sender<()>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to communicate with a session actor
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    store: SessionStore,
}

impl SessionHandle {
    /// Spawn a session actor on the current runtime. Nothing connects until
    /// [`SessionHandle::connect`] is called.
    pub fn spawn(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let store = SessionStore::new();
        let (sender, receiver) = mpsc::channel(32);
        let actor = SessionActor::new(config, connector, store.clone(), receiver);
        tokio::spawn(actor.run());
        Self { sender, store }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Open the connection. Returns false when one is already open or opening.
    pub async fn connect(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Connect { respond_to: tx })
            .await
            .map_err(|_| anyhow::anyhow!("Session actor is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Session actor didn't respond"))
    }

    /// Send a user message. On success the message has been queued on the
    /// live connection and echoed into the store.
    pub async fn send_user_message(&self, text: &str) -> Result<MessageId, SendError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::SendUserMessage {
                text: text.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| SendError::SessionGone)?;
        rx.await.map_err(|_| SendError::SessionGone)?
    }

    /// Record the editor's current file, attached to review envelopes.
    pub async fn set_active_file(&self, content: impl Into<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::SetActiveFile {
                content: content.into(),
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Session actor is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Session actor didn't respond"))
    }

    /// Deliberately close. No reconnection follows until the next `connect`.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Close { respond_to: tx })
            .await
            .map_err(|_| anyhow::anyhow!("Session actor is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Session actor didn't respond"))
    }

    /// Close and stop the actor. The store stays readable.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Shutdown { respond_to: tx })
            .await
            .map_err(|_| anyhow::anyhow!("Session actor is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Session actor didn't respond"))
    }
}

struct SessionActor {
    store: SessionStore,
    accumulator: MessageAccumulator,
    connection: ConnectionManager,
    reconnect: ReconnectScheduler,
    dialect: Dialect,
    outbound: OutboundFormat,
    stream_idle_timeout: Option<Duration>,
    commands: mpsc::Receiver<SessionCommand>,
    signals: mpsc::UnboundedReceiver<LinkSignal>,
}

impl SessionActor {
    fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        store: SessionStore,
        commands: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        let (signal_tx, signals) = mpsc::unbounded_channel();
        Self {
            store,
            accumulator: MessageAccumulator::new(),
            connection: ConnectionManager::new(connector, config.url, signal_tx.clone()),
            reconnect: ReconnectScheduler::new(config.reconnect, signal_tx),
            dialect: config.dialect,
            outbound: config.outbound,
            stream_idle_timeout: config.stream_idle_timeout,
            commands,
            signals,
        }
    }

    async fn run(mut self) {
        debug!(dialect = %self.dialect, outbound = %self.outbound, "session actor started");

        let mut watchdog = self.stream_idle_timeout.map(|timeout| {
            let period = (timeout / 2).max(Duration::from_millis(10));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(SessionCommand::Shutdown { respond_to }) => {
                            self.close().await;
                            let _ = respond_to.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        // Every handle dropped
                        None => {
                            self.close().await;
                            break;
                        }
                    }
                }
                Some(signal) = self.signals.recv() => {
                    self.handle_signal(signal).await;
                }
                _ = tick(&mut watchdog) => {
                    self.check_stale_stream().await;
                }
            }
        }

        debug!("session actor stopped");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Connect { respond_to } => {
                let started = self.connect().await;
                let _ = respond_to.send(started);
            }

            SessionCommand::SendUserMessage { text, respond_to } => {
                let result = self.send_user_message(&text).await;
                if let Err(e) = &result {
                    debug!(error = %e, "user message rejected");
                }
                let _ = respond_to.send(result);
            }

            SessionCommand::SetActiveFile {
                content,
                respond_to,
            } => {
                self.store
                    .update(|state| {
                        state.active_file_content = content;
                        ((), Some(StoreChange::Session))
                    })
                    .await;
                let _ = respond_to.send(());
            }

            SessionCommand::Close { respond_to } => {
                self.close().await;
                let _ = respond_to.send(());
            }

            // Handled in run() so the loop can exit
            SessionCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    async fn connect(&mut self) -> bool {
        // An explicit connect supersedes any pending retry
        self.reconnect.cancel();
        let started = self.connection.connect();
        self.store.set_status(self.connection.status()).await;
        started
    }

    async fn close(&mut self) {
        self.reconnect.cancel();
        self.connection.close();
        self.store.set_status(ConnectionStatus::Disconnected).await;
    }

    async fn send_user_message(&mut self, text: &str) -> Result<MessageId, SendError> {
        if text.trim().is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if self.connection.status() != ConnectionStatus::Connected {
            return Err(SendError::NotConnected);
        }

        let code = self
            .store
            .read(|state| state.active_file_content.clone())
            .await;
        let payload = encode_outbound(self.outbound, text, Some(&code))
            .map_err(|e| SendError::Encode(e.to_string()))?;
        self.connection.send(payload)?;

        let id = self
            .store
            .update(|state| (state.push_user_message(text), Some(StoreChange::Messages)))
            .await;
        self.accumulator.begin_turn();
        debug!(id = %id, bytes = text.len(), "user message sent");
        Ok(id)
    }

    async fn handle_signal(&mut self, signal: LinkSignal) {
        match signal {
            LinkSignal::Opened {
                generation,
                outbound,
            } => {
                if !self.connection.on_open(generation, outbound) {
                    return;
                }
                self.reconnect.reset_backoff();
                self.store
                    .update(|state| {
                        state.status = ConnectionStatus::Connected;
                        state.reconnect_attempt = 0;
                        ((), Some(StoreChange::Status(ConnectionStatus::Connected)))
                    })
                    .await;
            }

            LinkSignal::Payload {
                generation,
                payload,
            } => {
                if !self.connection.is_current(generation) {
                    debug!(generation, "dropping payload from stale connection");
                    return;
                }
                self.apply_payload(&payload).await;
            }

            LinkSignal::Failed { generation, error } => {
                if self.connection.on_error(generation, &error) {
                    self.store.set_status(ConnectionStatus::Disconnected).await;
                }
            }

            LinkSignal::Closed {
                generation,
                code,
                reason,
            } => match self.connection.on_close(generation) {
                CloseOutcome::Unexpected => {
                    warn!(generation, ?code, reason = %reason, "connection closed unexpectedly");
                    self.reconnect.arm(generation);
                    let attempt = self.reconnect.attempt();
                    self.store
                        .update(|state| {
                            state.status = ConnectionStatus::Disconnected;
                            state.reconnect_attempt = attempt;
                            state.last_disconnect = Some(DisconnectInfo {
                                code,
                                reason,
                                at: Utc::now(),
                            });
                            ((), Some(StoreChange::Status(ConnectionStatus::Disconnected)))
                        })
                        .await;
                }
                CloseOutcome::Deliberate => {
                    debug!(generation, "deliberate close confirmed");
                }
                CloseOutcome::Stale => {
                    debug!(generation, "ignoring close of stale connection");
                }
            },

            LinkSignal::ReconnectDue { generation } => {
                if !self.reconnect.fire(generation) || generation != self.connection.generation() {
                    debug!(generation, "ignoring stale reconnect timer");
                    return;
                }
                info!(
                    attempt = self.reconnect.attempt(),
                    "reconnecting to agent backend"
                );
                if self.connection.connect() {
                    self.store.set_status(self.connection.status()).await;
                }
            }
        }
    }

    async fn apply_payload(&mut self, payload: &str) {
        let frame = decode_frame(payload, self.dialect);
        if let Event::DecodeFailure(failure) = &frame.event {
            warn!(
                error = %failure,
                correlation_id = frame.correlation_id.as_deref(),
                "dropping undecodable frame"
            );
            return;
        }

        let accumulator = &mut self.accumulator;
        let applied = self
            .store
            .update(|state| {
                let applied = accumulator.apply(state, &frame.event);
                let change = applied.change();
                (applied, change)
            })
            .await;
        if frame.event.is_terminal() {
            info!(
                correlation_id = frame.correlation_id.as_deref(),
                "response complete"
            );
        }
        debug!(
            kind = frame.event.kind(),
            correlation_id = frame.correlation_id.as_deref(),
            ?applied,
            "event applied"
        );
    }

    async fn check_stale_stream(&mut self) {
        let Some(timeout) = self.stream_idle_timeout else {
            return;
        };
        let accumulator = &mut self.accumulator;
        let finished = self
            .store
            .update(|state| {
                let applied = accumulator.finalize_stale(state, Instant::now(), timeout);
                let change = applied.as_ref().and_then(Applied::change);
                (applied, change)
            })
            .await;
        match finished {
            Some(Applied::Finished { id: Some(id) }) => {
                warn!(id = %id, timeout_secs = timeout.as_secs(), "closed stalled streaming message");
            }
            Some(_) => {
                warn!(timeout_secs = timeout.as_secs(), "no response before timeout, turn cleared");
            }
            None => {}
        }
    }
}

async fn tick(watchdog: &mut Option<Interval>) {
    match watchdog {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectPolicy;
    use crate::store::Role;
    use crate::test_helpers::{MemoryConnector, RemoteEnd, wait_until};

    fn config() -> SessionConfig {
        SessionConfig {
            reconnect: ReconnectPolicy::Fixed {
                delay: Duration::from_millis(20),
            },
            ..Default::default()
        }
    }

    async fn connected(
        config: SessionConfig,
    ) -> (
        SessionHandle,
        Arc<MemoryConnector>,
        mpsc::UnboundedReceiver<RemoteEnd>,
        RemoteEnd,
    ) {
        let (connector, mut remotes) = MemoryConnector::new();
        let session = SessionHandle::spawn(config, connector.clone());
        assert!(session.connect().await.unwrap());
        let remote = remotes.recv().await.unwrap();
        wait_until(session.store(), |s| s.status == ConnectionStatus::Connected).await;
        (session, connector, remotes, remote)
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected_without_side_effects() {
        let (connector, _remotes) = MemoryConnector::new();
        let session = SessionHandle::spawn(config(), connector);
        let before = session.store().snapshot().await;

        assert_eq!(
            session.send_user_message("hello").await,
            Err(SendError::NotConnected)
        );
        assert_eq!(session.store().snapshot().await, before);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (session, _connector, _remotes, _remote) = connected(config()).await;
        assert_eq!(
            session.send_user_message("   ").await,
            Err(SendError::EmptyMessage)
        );
        assert!(session.store().snapshot().await.messages.is_empty());
    }

    #[tokio::test]
    async fn connect_twice_opens_one_connection() {
        let (session, _connector, mut remotes, _remote) = connected(config()).await;
        assert!(!session.connect().await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(remotes.try_recv().is_err());
    }

    #[tokio::test]
    async fn streamed_response_builds_one_message() {
        let (session, _connector, _remotes, remote) = connected(config()).await;

        remote
            .push(r#"{"type":"connected","session_id":"s-1"}"#)
            .await;
        remote
            .push(r#"{"type":"stream_start","agent":"coder"}"#)
            .await;
        remote
            .push(r#"{"type":"stream_token","content":"def f","agent":"coder"}"#)
            .await;
        remote
            .push(r#"{"type":"stream_token","content":"oo():","agent":"coder"}"#)
            .await;
        remote.push(r#"{"type":"stream_end"}"#).await;

        wait_until(session.store(), |s| {
            s.messages.len() == 1 && !s.messages[0].is_streaming
        })
        .await;
        let state = session.store().snapshot().await;
        assert_eq!(state.session_id.as_deref(), Some("s-1"));
        assert_eq!(state.messages[0].content, "def foo():");
        assert_eq!(state.messages[0].sender.as_deref(), Some("coder"));
        assert!(!state.is_streaming);
    }

    #[tokio::test]
    async fn user_message_is_written_then_echoed() {
        let (session, _connector, _remotes, mut remote) = connected(config()).await;

        let id = session.send_user_message("review this").await.unwrap();
        assert_eq!(remote.outbound.recv().await.unwrap(), "review this");

        let state = session.store().snapshot().await;
        let message = state.message(id).unwrap();
        assert_eq!(message.role, Role::User);
        assert_eq!(message.content, "review this");
        assert!(state.is_streaming);
    }

    #[tokio::test]
    async fn review_envelope_attaches_active_file() {
        let config = SessionConfig {
            outbound: OutboundFormat::ReviewEnvelope,
            ..config()
        };
        let (session, _connector, _remotes, mut remote) = connected(config).await;

        session.set_active_file("x = 1").await.unwrap();
        session.send_user_message("any bugs?").await.unwrap();

        let payload: serde_json::Value =
            serde_json::from_str(&remote.outbound.recv().await.unwrap()).unwrap();
        assert_eq!(payload["type"], "review");
        assert_eq!(payload["message"], "any bugs?");
        assert_eq!(payload["code"], "x = 1");
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_connection_survives() {
        let (session, _connector, _remotes, remote) = connected(config()).await;

        remote.push("not json").await;
        remote.push(r#"{"type":"heartbeat"}"#).await;
        remote
            .push(r#"{"type":"token","content":"ok","sender":"coder"}"#)
            .await;

        wait_until(session.store(), |s| s.messages.len() == 1).await;
        let state = session.store().snapshot().await;
        assert_eq!(state.messages[0].content, "ok");
        assert_eq!(state.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn unexpected_close_reconnects_after_delay() {
        let (session, _connector, mut remotes, remote) = connected(config()).await;

        remote.close(1011, "server restart").await;
        wait_until(session.store(), |s| s.last_disconnect.is_some()).await;
        let state = session.store().snapshot().await;
        let disconnect = state.last_disconnect.unwrap();
        assert_eq!(disconnect.code, Some(1011));
        assert_eq!(disconnect.reason, "server restart");

        let _second = tokio::time::timeout(Duration::from_secs(5), remotes.recv())
            .await
            .expect("no reconnect")
            .unwrap();
        wait_until(session.store(), |s| {
            s.status == ConnectionStatus::Connected && s.reconnect_attempt == 0
        })
        .await;
    }

    #[tokio::test]
    async fn failed_open_retries_until_backend_returns() {
        let (connector, mut remotes) = MemoryConnector::new();
        connector.set_failing(true);
        let session = SessionHandle::spawn(config(), connector.clone());

        assert!(session.connect().await.unwrap());
        wait_until(session.store(), |s| s.reconnect_attempt >= 2).await;
        assert_ne!(session.store().status().await, ConnectionStatus::Connected);

        connector.set_failing(false);
        let _remote = tokio::time::timeout(Duration::from_secs(5), remotes.recv())
            .await
            .expect("no reconnect")
            .unwrap();
        wait_until(session.store(), |s| s.status == ConnectionStatus::Connected).await;
    }

    #[tokio::test]
    async fn deliberate_close_never_reconnects() {
        let (session, _connector, mut remotes, remote) = connected(config()).await;

        session.close().await.unwrap();
        assert_eq!(session.store().status().await, ConnectionStatus::Disconnected);

        // Late traffic from the closed link must not land
        let _ = remote
            .inbound
            .send(crate::connection::TransportEvent::Text(
                r#"{"type":"token","content":"late"}"#.into(),
            ))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(remotes.try_recv().is_err());
        let state = session.store().snapshot().await;
        assert!(state.messages.is_empty());
        assert_eq!(state.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn close_cancels_pending_reconnect() {
        let (connector, mut remotes) = MemoryConnector::new();
        connector.set_failing(true);
        let session = SessionHandle::spawn(
            SessionConfig {
                reconnect: ReconnectPolicy::Fixed {
                    delay: Duration::from_millis(200),
                },
                ..Default::default()
            },
            connector.clone(),
        );

        session.connect().await.unwrap();
        wait_until(session.store(), |s| s.reconnect_attempt == 1).await;
        connector.set_failing(false);
        session.close().await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(remotes.try_recv().is_err());
        assert_eq!(session.store().status().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_after_close_starts_fresh_connection() {
        let (session, _connector, mut remotes, _first) = connected(config()).await;

        session.close().await.unwrap();
        assert!(session.connect().await.unwrap());
        let second = remotes.recv().await.unwrap();
        wait_until(session.store(), |s| s.status == ConnectionStatus::Connected).await;

        second
            .push(r#"{"type":"token","content":"fresh","sender":"coder"}"#)
            .await;
        wait_until(session.store(), |s| s.messages.len() == 1).await;
    }

    #[tokio::test]
    async fn stalled_stream_is_closed_by_watchdog() {
        let config = SessionConfig {
            stream_idle_timeout: Some(Duration::from_millis(50)),
            ..config()
        };
        let (session, _connector, _remotes, remote) = connected(config).await;

        remote
            .push(r#"{"type":"token","content":"half","sender":"coder"}"#)
            .await;
        wait_until(session.store(), |s| s.messages.len() == 1).await;
        wait_until(session.store(), |s| !s.is_streaming && !s.messages[0].is_streaming).await;
        assert_eq!(session.store().snapshot().await.messages[0].content, "half");
    }

    #[tokio::test]
    async fn unanswered_message_is_cleared_by_watchdog() {
        let config = SessionConfig {
            stream_idle_timeout: Some(Duration::from_millis(50)),
            ..config()
        };
        let (session, _connector, _remotes, _remote) = connected(config).await;

        session.send_user_message("hello").await.unwrap();
        assert!(session.store().snapshot().await.is_streaming);

        wait_until(session.store(), |s| !s.is_streaming).await;
        let state = session.store().snapshot().await;
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].role, Role::User);
        assert_eq!(state.active_agent, None);
    }

    #[tokio::test]
    async fn payload_queued_before_close_is_dropped() {
        let (connector, mut remotes) = MemoryConnector::new();
        let (_commands_tx, commands) = mpsc::channel(1);
        let store = SessionStore::new();
        let mut actor = SessionActor::new(config(), connector, store.clone(), commands);

        assert!(actor.connect().await);
        let remote = remotes.recv().await.unwrap();
        let opened = actor.signals.recv().await.unwrap();
        let generation = opened.generation();
        actor.handle_signal(opened).await;
        assert_eq!(store.status().await, ConnectionStatus::Connected);

        // Forwarded by the link but not yet handled when the owner closes
        remote
            .push(r#"{"type":"token","content":"late","sender":"coder"}"#)
            .await;
        let late = actor.signals.recv().await.unwrap();
        assert!(matches!(late, LinkSignal::Payload { .. }));
        actor.close().await;
        let before = store.snapshot().await;

        actor.handle_signal(late).await;
        actor
            .handle_signal(LinkSignal::Closed {
                generation,
                code: None,
                reason: "late".into(),
            })
            .await;

        assert_eq!(store.snapshot().await, before);
        assert!(before.messages.is_empty());
        assert!(!actor.reconnect.is_armed());
    }

    #[tokio::test]
    async fn shutdown_stops_the_actor() {
        let (session, _connector, _remotes, remote) = connected(config()).await;

        session.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), remote.shutdown.cancelled())
            .await
            .expect("link left open");
        assert_eq!(
            session.send_user_message("hi").await,
            Err(SendError::SessionGone)
        );
        assert_eq!(session.store().status().await, ConnectionStatus::Disconnected);
    }
}
