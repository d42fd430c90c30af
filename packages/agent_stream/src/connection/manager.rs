//! ConnectionManager: owns the one logical connection of a session.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LinkSignal;
use super::transport::{Connector, TransportEvent};
use crate::error::SendError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        })
    }
}

/// How a `Closed` signal should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Network-caused: the caller should arm reconnection.
    Unexpected,
    /// The owner asked for this close.
    Deliberate,
    /// Belongs to a superseded connection.
    Stale,
}

/// One connection attempt and, once open, its write queue.
struct Attempt {
    cancel: CancellationToken,
    outbound: Option<mpsc::Sender<String>>,
}

/// State machine for a single logical connection.
///
/// Every `connect()` starts a new generation. Signals from older generations,
/// and any signal arriving after a deliberate `close()`, are rejected by
/// [`ConnectionManager::is_current`].
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    url: String,
    status: ConnectionStatus,
    generation: u64,
    deliberate_close: bool,
    attempt: Option<Attempt>,
    signals: mpsc::UnboundedSender<LinkSignal>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        url: String,
        signals: mpsc::UnboundedSender<LinkSignal>,
    ) -> Self {
        Self {
            connector,
            url,
            status: ConnectionStatus::Disconnected,
            generation: 0,
            deliberate_close: false,
            attempt: None,
            signals,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a signal tagged `generation` may still affect session state.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && !self.deliberate_close
    }

    /// Open a new connection unless one is already open or opening.
    /// Returns true if an attempt was started.
    pub fn connect(&mut self) -> bool {
        if self.status != ConnectionStatus::Disconnected {
            debug!(status = %self.status, "connect ignored, connection already active");
            return false;
        }

        // A previous link may still be winding down after an error
        if let Some(previous) = self.attempt.take() {
            previous.cancel.cancel();
        }

        self.generation += 1;
        self.deliberate_close = false;
        self.status = ConnectionStatus::Connecting;

        let cancel = CancellationToken::new();
        self.attempt = Some(Attempt {
            cancel: cancel.clone(),
            outbound: None,
        });

        info!(generation = self.generation, "connecting to agent backend");
        tokio::spawn(run_link(
            self.connector.clone(),
            self.url.clone(),
            self.generation,
            cancel,
            self.signals.clone(),
        ));
        true
    }

    /// Handshake finished. Returns false for stale opens, whose link is
    /// dropped (and thereby closed).
    pub fn on_open(&mut self, generation: u64, outbound: mpsc::Sender<String>) -> bool {
        if !self.is_current(generation) {
            debug!(generation, "dropping stale open");
            return false;
        }
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.outbound = Some(outbound);
        }
        self.status = ConnectionStatus::Connected;
        info!(generation, "connected");
        true
    }

    /// Transport failure. Reconnection is left to the `Closed` that follows.
    pub fn on_error(&mut self, generation: u64, error: &str) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        warn!(generation, error, "connection error");
        self.status = ConnectionStatus::Disconnected;
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.outbound = None;
        }
        true
    }

    pub fn on_close(&mut self, generation: u64) -> CloseOutcome {
        if generation != self.generation {
            return CloseOutcome::Stale;
        }
        if self.deliberate_close {
            return CloseOutcome::Deliberate;
        }
        self.status = ConnectionStatus::Disconnected;
        if let Some(attempt) = self.attempt.take() {
            attempt.cancel.cancel();
        }
        CloseOutcome::Unexpected
    }

    /// Write a payload verbatim. Fails without side effects unless connected.
    pub fn send(&self, payload: String) -> Result<(), SendError> {
        if self.status != ConnectionStatus::Connected {
            return Err(SendError::NotConnected);
        }
        let outbound = self
            .attempt
            .as_ref()
            .and_then(|a| a.outbound.as_ref())
            .ok_or(SendError::NotConnected)?;
        outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SendError::NotConnected,
        })
    }

    /// Deterministic teardown. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.deliberate_close = true;
        if let Some(attempt) = self.attempt.take() {
            attempt.cancel.cancel();
        }
        if self.status != ConnectionStatus::Disconnected {
            info!(generation = self.generation, "connection closed by owner");
            self.status = ConnectionStatus::Disconnected;
        }
    }
}

/// Drive one connection attempt: open, then pump transport events into
/// generation-tagged signals until the link ends or the attempt is cancelled.
async fn run_link(
    connector: Arc<dyn Connector>,
    url: String,
    generation: u64,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<LinkSignal>,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connector.open(&url) => result,
    };

    let mut link = match opened {
        Ok(link) => link,
        Err(e) => {
            let reason = e.to_string();
            let _ = signals.send(LinkSignal::Failed {
                generation,
                error: reason.clone(),
            });
            let _ = signals.send(LinkSignal::Closed {
                generation,
                code: None,
                reason,
            });
            return;
        }
    };

    let _ = signals.send(LinkSignal::Opened {
        generation,
        outbound: link.outbound.clone(),
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                link.shutdown.cancel();
                break;
            }
            event = link.inbound.recv() => {
                let signal = match event {
                    Some(TransportEvent::Text(payload)) => LinkSignal::Payload { generation, payload },
                    Some(TransportEvent::Error(error)) => LinkSignal::Failed { generation, error },
                    Some(TransportEvent::Closed { code, reason }) => {
                        let _ = signals.send(LinkSignal::Closed { generation, code, reason });
                        break;
                    }
                    None => {
                        let _ = signals.send(LinkSignal::Closed {
                            generation,
                            code: None,
                            reason: "transport ended".into(),
                        });
                        break;
                    }
                };
                if signals.send(signal).is_err() {
                    link.shutdown.cancel();
                    break;
                }
            }
        }
    }
}
