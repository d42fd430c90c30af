//! Connection lifecycle: one logical connection to the agent backend.
//!
//! - `transport`: the `Connector` seam and the tokio-tungstenite connector
//! - `manager`: `ConnectionManager`, the disconnected/connecting/connected
//!   state machine and generation counter
//! - `reconnect`: `ReconnectScheduler`, the cancellable retry timer
//!
//! Spawned link and timer tasks never touch session state. They report back
//! through `LinkSignal`s tagged with the connection generation they belong
//! to, and the session actor drops any signal whose generation is stale.

mod manager;
mod reconnect;
mod transport;

use tokio::sync::mpsc;

pub use manager::{CloseOutcome, ConnectionManager, ConnectionStatus};
pub use reconnect::{ReconnectPolicy, ReconnectScheduler};
pub use transport::{Connector, TransportError, TransportEvent, TransportLink, WsConnector};

/// Reports from link and timer tasks back to the session actor.
#[derive(Debug)]
pub enum LinkSignal {
    /// The transport handshake finished.
    Opened {
        generation: u64,
        outbound: mpsc::Sender<String>,
    },
    /// One inbound text payload, unmodified.
    Payload { generation: u64, payload: String },
    /// A transport-level failure. A `Closed` for the same generation follows.
    Failed { generation: u64, error: String },
    /// The connection is gone (including failed opens).
    Closed {
        generation: u64,
        code: Option<u16>,
        reason: String,
    },
    /// The reconnect timer armed for `generation` expired.
    ReconnectDue { generation: u64 },
}

impl LinkSignal {
    pub fn generation(&self) -> u64 {
        match self {
            LinkSignal::Opened { generation, .. }
            | LinkSignal::Payload { generation, .. }
            | LinkSignal::Failed { generation, .. }
            | LinkSignal::Closed { generation, .. }
            | LinkSignal::ReconnectDue { generation } => *generation,
        }
    }
}
