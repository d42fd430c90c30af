//! In-memory transport and polling helpers for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connector, TransportError, TransportEvent, TransportLink};
use crate::store::{SessionState, SessionStore};

/// The backend's side of one in-memory connection.
pub struct RemoteEnd {
    pub inbound: mpsc::Sender<TransportEvent>,
    pub outbound: mpsc::Receiver<String>,
    pub shutdown: CancellationToken,
}

impl RemoteEnd {
    pub async fn push(&self, payload: &str) {
        self.inbound
            .send(TransportEvent::Text(payload.to_string()))
            .await
            .unwrap();
    }

    pub async fn fail(&self, error: &str) {
        self.inbound
            .send(TransportEvent::Error(error.to_string()))
            .await
            .unwrap();
        self.inbound
            .send(TransportEvent::Closed {
                code: None,
                reason: error.to_string(),
            })
            .await
            .unwrap();
    }

    pub async fn close(&self, code: u16, reason: &str) {
        self.inbound
            .send(TransportEvent::Closed {
                code: Some(code),
                reason: reason.to_string(),
            })
            .await
            .unwrap();
    }
}

/// Connector that hands each opened link's remote end to the test.
pub struct MemoryConnector {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    failing: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                remotes: tx,
                failing: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// While set, every open fails as if the backend were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Connector for MemoryConnector {
    fn open(&self, _url: &str) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        if self.failing.load(Ordering::SeqCst) {
            return async { Err(TransportError::Unavailable) }.boxed();
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let _ = self.remotes.send(RemoteEnd {
            inbound: inbound_tx,
            outbound: outbound_rx,
            shutdown: shutdown.clone(),
        });

        async move {
            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
                shutdown,
            })
        }
        .boxed()
    }
}

/// Poll the store until `pred` holds, panicking after five seconds.
pub async fn wait_until(store: &SessionStore, pred: impl Fn(&SessionState) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if store.read(|s| pred(s)).await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached: {:#?}", store.snapshot().await);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
