//! Channel trait for the peer-to-peer message link.
//!
//! Implementations:
//! - WebSocket (duel-peer `connection` module)
//!
//! A channel delivers opaque frames in order while open and may close at any
//! time. Nothing is redelivered across a close.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// An open link to the other peer.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Remote address, for logging
    fn remote(&self) -> &str;

    /// Send one frame
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Receive the next frame. `Err(Closed)` once the peer hangs up.
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}
