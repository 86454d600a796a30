//! WebSocket implementation of the duel [`Channel`].
//!
//! The stream is split: a spawned read task forwards frames into an
//! unbounded queue, and the write half sits behind a mutex so `send` can be
//! called through a shared reference.

use async_trait::async_trait;
use duel_core::protocol::MAX_MESSAGE_SIZE;
use duel_core::transport::{Channel, Result, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

/// One open WebSocket to the other peer.
pub struct WsChannel<S> {
    remote: String,
    write: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    incoming: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    read_task: JoinHandle<()>,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an upgraded stream and start reading from it.
    pub fn new(remote: impl Into<String>, ws_stream: WebSocketStream<S>) -> Self {
        let remote = remote.into();
        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let read_remote = remote.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_remote, read, tx).await;
        });

        Self {
            remote,
            write: Mutex::new(write),
            incoming: Mutex::new(rx),
            read_task,
        }
    }

    /// Forward data frames until the stream ends. Dropping `tx` on exit is
    /// what makes `recv` report `Closed`.
    async fn read_loop(
        remote: String,
        mut read: SplitStream<WebSocketStream<S>>,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.as_bytes().to_vec(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", remote);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from {} exceeds max size ({} > {}), dropping",
                            remote,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    debug!("Frame from {}: {} bytes", remote, data.len());
                    if tx.send(data).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection to {} closed", remote);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", remote, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection to {} stream ended", remote);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl<S> Channel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn remote(&self) -> &str {
        &self.remote
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(data.to_vec().into()))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
                other => TransportError::SendFailed(other.to_string()),
            })
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) -> Result<()> {
        let result = {
            let mut write = self.write.lock().await;
            write.send(Message::Close(None)).await
        };
        self.read_task.abort();
        match result {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }
}

impl<S> Drop for WsChannel<S> {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}
