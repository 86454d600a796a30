//! Guest side of the link: dial the host, and back off between attempts.

use crate::connection::WsChannel;
use anyhow::Result;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, connect_async};
use tracing::info;

pub type GuestChannel = WsChannel<MaybeTlsStream<TcpStream>>;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: None, // Unlimited
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Reconnection bookkeeping for the guest.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Failed attempts since the last successful connection
    pub attempts: u32,
    /// Delay chosen for the most recent failure
    pub current_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn schedule_reconnect(&mut self, config: &ReconnectConfig) -> Duration {
        self.attempts += 1;
        self.current_delay = calculate_backoff(self.attempts, config);
        self.current_delay
    }

    /// Reset state after successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = Duration::ZERO;
    }

    /// Check if max attempts exceeded.
    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}

/// Dial the host at `url` (e.g. `ws://127.0.0.1:7878`).
pub async fn connect(url: &str) -> Result<GuestChannel> {
    let (ws_stream, _) = connect_async(url).await?;
    info!("Connected to host at {}", url);
    Ok(WsChannel::new(url, ws_stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_exponential() {
        let config = ReconnectConfig::default();

        // 5s, 10s, 20s, 40s, 60s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(5));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(10));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(20));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(40));
        assert_eq!(calculate_backoff(5, &config), Duration::from_secs(60));
        assert_eq!(calculate_backoff(10, &config), Duration::from_secs(60));
    }

    #[test]
    fn test_calculate_backoff_custom_config() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 3.0,
            max_attempts: None,
        };

        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(300));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(1));
    }

    #[test]
    fn test_schedule_and_reset() {
        let mut state = ReconnectState::new();
        let config = ReconnectConfig::default();

        assert_eq!(state.schedule_reconnect(&config), Duration::from_secs(5));
        assert_eq!(state.schedule_reconnect(&config), Duration::from_secs(10));
        assert_eq!(state.attempts, 2);

        state.reset();
        assert_eq!(state.attempts, 0);
        assert_eq!(state.schedule_reconnect(&config), Duration::from_secs(5));
    }

    #[test]
    fn test_exceeded_max_attempts() {
        let state = ReconnectState {
            attempts: 5,
            current_delay: Duration::from_secs(60),
        };

        assert!(!state.exceeded_max_attempts(&ReconnectConfig::default()));

        let limited = ReconnectConfig {
            max_attempts: Some(5),
            ..Default::default()
        };
        assert!(state.exceeded_max_attempts(&limited));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(connect(&format!("ws://127.0.0.1:{port}")).await.is_err());
    }
}
