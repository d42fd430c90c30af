use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What a transport reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// An open bidirectional text connection.
///
/// Dropping `outbound` or cancelling `shutdown` tears the connection down.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<TransportEvent>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("backend is unavailable")]
    Unavailable,

    #[error("handshake rejected with HTTP {0}")]
    Rejected(u16),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransportError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Io(io_err)
                if matches!(
                    io_err.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                ) =>
            {
                Self::Unavailable
            }
            tungstenite::Error::Http(response) => Self::Rejected(response.status().as_u16()),
            _ => Self::Other(err.into()),
        }
    }
}

/// Opens connections. The seam between the session and the network.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<TransportLink, TransportError>>;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    queue_capacity: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(100)
    }
}

impl WsConnector {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
        }
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        let url = url.to_string();
        let capacity = self.queue_capacity;
        async move {
            let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(TransportError::from_tungstenite)?;
            debug!(status = %response.status(), "websocket handshake complete");
            Ok(spawn_link(stream, capacity))
        }
        .boxed()
    }
}

/// Split the socket into a writer task draining `outbound` and a reader task
/// forwarding frames to `inbound`. Both stop when `shutdown` is cancelled.
fn spawn_link<S>(stream: WebSocketStream<S>, capacity: usize) -> TransportLink
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_write, mut ws_read) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(capacity);
    let shutdown = CancellationToken::new();

    // Writer: drain queue → socket
    let writer_shutdown = shutdown.clone();
    let writer_events = inbound_tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_shutdown.cancelled() => {
                    let _ = ws_write.send(Message::Close(None)).await;
                    break;
                }
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(text) => {
                            if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                                warn!(error = %e, "websocket write failed");
                                let _ = writer_events.send(TransportEvent::Error(e.to_string())).await;
                                // Take the reader down so the link reports closed
                                writer_shutdown.cancel();
                                break;
                            }
                        }
                        None => {
                            let _ = ws_write.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }
    });

    // Reader: socket → inbound events
    let reader_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reader_shutdown.cancelled() => break,
                frame = ws_read.next() => {
                    let event = match frame {
                        Some(Ok(Message::Text(text))) => TransportEvent::Text(text.as_str().to_owned()),
                        Some(Ok(Message::Binary(data))) => {
                            TransportEvent::Text(String::from_utf8_lossy(&data).into_owned())
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = match frame {
                                Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                                None => (None, String::new()),
                            };
                            let _ = inbound_tx.send(TransportEvent::Closed { code, reason }).await;
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            let _ = inbound_tx.send(TransportEvent::Error(e.to_string())).await;
                            let _ = inbound_tx
                                .send(TransportEvent::Closed { code: None, reason: e.to_string() })
                                .await;
                            break;
                        }
                        None => {
                            let _ = inbound_tx
                                .send(TransportEvent::Closed { code: None, reason: "stream ended".into() })
                                .await;
                            break;
                        }
                    };
                    if inbound_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Either side ending takes the writer down too
        reader_shutdown.cancel();
    });

    TransportLink {
        outbound: outbound_tx,
        inbound: inbound_rx,
        shutdown,
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::ReadBuf;
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;

    /// Socket whose peer never speaks and whose writes always fail.
    struct WriteFails;

    impl AsyncRead for WriteFails {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for WriteFails {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn unavailable_display() {
        assert_eq!(
            TransportError::Unavailable.to_string(),
            "backend is unavailable"
        );
    }

    #[test]
    fn rejected_display() {
        assert_eq!(
            TransportError::Rejected(403).to_string(),
            "handshake rejected with HTTP 403"
        );
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        // Nothing listens on port 1
        let err = WsConnector::default()
            .open("ws://127.0.0.1:1/ws")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unavailable), "got: {err}");
    }

    #[tokio::test]
    async fn invalid_url_is_other() {
        let err = WsConnector::default().open("not a url").await.unwrap_err();
        assert!(matches!(err, TransportError::Other(_)), "got: {err}");
    }

    #[tokio::test]
    async fn write_failure_ends_the_link() {
        let stream = WebSocketStream::from_raw_socket(WriteFails, Role::Client, None).await;
        let mut link = spawn_link(stream, 4);

        link.outbound.send("hello".into()).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .expect("no error reported");
        assert!(matches!(first, Some(TransportEvent::Error(_))), "got: {first:?}");

        // Both tasks gone: the inbound side ends instead of hanging
        let next = tokio::time::timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .expect("reader left running after write failure");
        assert_eq!(next, None);
        assert!(link.shutdown.is_cancelled());
    }
}
