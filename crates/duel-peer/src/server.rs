//! Host side of the link: listen for the guest and upgrade its connection.
//!
//! Only one guest is served at a time. Connections that arrive while a
//! guest is attached are refused by dropping the TCP stream.

use crate::connection::WsChannel;
use anyhow::Result;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info};

pub type HostChannel = WsChannel<TcpStream>;

pub struct HostListener {
    listener: TcpListener,
}

impl HostListener {
    /// Bind to an address.
    pub async fn bind(listen_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Listening for a guest on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait until a guest completes the WebSocket upgrade.
    pub async fn accept(&self) -> Result<HostChannel> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            if let Some(channel) = upgrade(stream, addr).await {
                return Ok(channel);
            }
        }
    }

    /// Accept and immediately drop one connection. Used while a guest is
    /// already attached.
    pub async fn refuse_next(&self) -> Result<()> {
        let (stream, addr) = self.listener.accept().await?;
        info!("Refusing {}: a guest is already connected", addr);
        drop(stream);
        Ok(())
    }
}

/// Upgrade a TCP connection to a WebSocket channel.
pub async fn upgrade(stream: TcpStream, addr: SocketAddr) -> Option<HostChannel> {
    match accept_async(stream).await {
        Ok(ws) => {
            info!("Guest connected from {}", addr);
            Some(WsChannel::new(addr.to_string(), ws))
        }
        Err(e) => {
            // Health checks (like `nc -z`) connect and immediately close without
            // completing the WebSocket handshake. Log these as debug, not error.
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                debug!("Connection closed before handshake from {}", addr);
            } else {
                error!("WebSocket upgrade failed for {}: {}", addr, e);
            }
            None
        }
    }
}
