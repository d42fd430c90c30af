//! # Agent Stream
//!
//! Client-side session manager for a realtime multi-agent review backend.
//!
//! One [`SessionHandle`] owns one logical connection. The backend streams
//! JSON events (see [`stream_protocol`]); the session decodes them, folds
//! partial tokens into whole chat messages, and publishes the result in a
//! [`SessionStore`] that any number of readers can snapshot or subscribe to.
//! Unexpected disconnects are retried on a timer; a deliberate
//! [`SessionHandle::close`] is final until the next connect.
//!
//! ```no_run
//! use std::sync::Arc;
//! use agent_stream::{SessionConfig, SessionHandle, WsConnector};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let session = SessionHandle::spawn(SessionConfig::default(), Arc::new(WsConnector::default()));
//! session.connect().await?;
//! let mut changes = session.store().subscribe();
//! while changes.recv().await.is_ok() {
//!     let state = session.store().snapshot().await;
//!     println!("{} messages", state.messages.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod config;
pub mod connection;
pub mod error;
pub mod execution;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_helpers;

pub use accumulator::{Applied, MessageAccumulator};
pub use config::{ConfigError, ExecutionConfig, FileConfig, SessionConfig};
pub use connection::{ConnectionStatus, Connector, ReconnectPolicy, WsConnector};
pub use error::SendError;
pub use execution::{CodeExecutor, ExecutionResult, PistonExecutor};
pub use session::SessionHandle;
pub use store::{Message, MessageId, Role, SessionState, SessionStore, StoreChange};
