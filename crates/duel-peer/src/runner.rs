//! Event loop that drives a [`Peer`] from the network, stdin, and a ticker.
//!
//! Inputs never interleave: frames, command lines, and ticks are awaited in
//! one `select!` and each is dispatched to completion before the next. After
//! every dispatch the outbox is written to the channel.

use crate::command::{Command, Request};
use crate::outgoing::{self, ReconnectConfig, ReconnectState};
use crate::report;
use crate::server::HostListener;
use anyhow::{Result, bail};
use duel_core::clock::now_ms;
use duel_core::transport::{Channel, TransportError};
use duel_core::{Input, KeyValueStore, Orientation, Peer};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Why [`Runner::drive`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The channel closed; the caller may wait for another one
    Closed,
    /// The user quit
    Quit,
}

pub struct Runner<S: KeyValueStore> {
    peer: Peer<S>,
    commands: mpsc::UnboundedReceiver<String>,
    ticker: Interval,
}

impl<S: KeyValueStore> Runner<S> {
    pub fn new(peer: Peer<S>, commands: mpsc::UnboundedReceiver<String>, tick: Duration) -> Self {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            peer,
            commands,
            ticker,
        }
    }

    pub fn peer(&self) -> &Peer<S> {
        &self.peer
    }

    pub fn into_peer(self) -> Peer<S> {
        self.peer
    }

    /// Serve guests one at a time until the user quits.
    pub async fn run_host(&mut self, listener: &HostListener) -> Result<()> {
        loop {
            let Some(accepted) = self.idle(listener.accept()).await else {
                return Ok(());
            };
            let channel = accepted?;

            let exit = self
                .drive(&channel, Orientation::Initiator, Some(listener))
                .await;
            if exit == Exit::Quit {
                return Ok(());
            }
            info!("Guest {} left, waiting for the next one", channel.remote());
        }
    }

    /// Keep a connection to the host at `url`, reconnecting with backoff.
    pub async fn run_guest(&mut self, url: &str, config: &ReconnectConfig) -> Result<()> {
        let mut reconnect = ReconnectState::new();
        loop {
            let Some(connected) = self.idle(outgoing::connect(url)).await else {
                return Ok(());
            };

            match connected {
                Ok(channel) => {
                    reconnect.reset();
                    if self.drive(&channel, Orientation::Answerer, None).await == Exit::Quit {
                        return Ok(());
                    }
                    info!("Host at {} went away", url);
                }
                Err(e) => warn!("Failed to connect to {}: {}", url, e),
            }

            if reconnect.exceeded_max_attempts(config) {
                bail!(
                    "Giving up on {} after {} attempts",
                    url,
                    reconnect.attempts
                );
            }
            let delay = reconnect.schedule_reconnect(config);
            info!(
                "Reconnecting to {} in {:?} (attempt {})",
                url, delay, reconnect.attempts
            );
            if self.idle(tokio::time::sleep(delay)).await.is_none() {
                return Ok(());
            }
        }
    }

    /// Run one connection until it closes or the user quits.
    ///
    /// `host` is the listener to keep refusing extra guests on, if any.
    pub async fn drive<C: Channel>(
        &mut self,
        channel: &C,
        orientation: Orientation,
        host: Option<&HostListener>,
    ) -> Exit {
        self.dispatch(Input::ChannelOpened(orientation));
        self.flush(channel).await;

        let exit = loop {
            tokio::select! {
                frame = channel.recv() => match frame {
                    Ok(data) => self.dispatch(Input::Received(data)),
                    Err(TransportError::Closed) => break Exit::Closed,
                    Err(e) => {
                        warn!("Receive from {} failed: {}", channel.remote(), e);
                        break Exit::Closed;
                    }
                },
                line = self.commands.recv() => {
                    if self.handle_line(line) == Some(Exit::Quit) {
                        if let Err(e) = channel.close().await {
                            debug!("Close of {} failed: {}", channel.remote(), e);
                        }
                        break Exit::Quit;
                    }
                }
                _ = self.ticker.tick() => self.dispatch(Input::Tick),
                refused = refuse_extra(host) => {
                    if let Err(e) = refused {
                        warn!("Accept failed while busy: {}", e);
                    }
                }
            }
            self.flush(channel).await;
        };

        self.dispatch(Input::ChannelClosed);
        exit
    }

    /// Keep serving commands and ticks while waiting on `until`.
    ///
    /// Returns `None` if the user quit first.
    async fn idle<T>(&mut self, until: impl Future<Output = T>) -> Option<T> {
        tokio::pin!(until);
        loop {
            tokio::select! {
                value = &mut until => return Some(value),
                line = self.commands.recv() => {
                    if self.handle_line(line) == Some(Exit::Quit) {
                        return None;
                    }
                }
                _ = self.ticker.tick() => self.dispatch(Input::Tick),
            }
            // Offline: anything queued was already reported as a send failure
            let dropped = self.peer.drain_outbox();
            if !dropped.is_empty() {
                debug!("Dropped {} queued message(s) while offline", dropped.len());
            }
        }
    }

    fn dispatch(&mut self, input: Input) {
        // Action errors are already posted as notices
        let _ = self.peer.dispatch(input, now_ms());
    }

    /// Handle one stdin line. `None` from the reader means EOF, which quits.
    fn handle_line(&mut self, line: Option<String>) -> Option<Exit> {
        let Some(line) = line else {
            info!("Input closed");
            return Some(Exit::Quit);
        };
        if line.trim().is_empty() {
            return None;
        }

        let now = now_ms();
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            // Usage errors and `help` both render through clap
            Err(e) => {
                print!("{e}");
                return None;
            }
        };
        match command.resolve(&self.peer, now) {
            Ok(Request::Act(action)) => self.dispatch(Input::Action(action)),
            Ok(Request::Status) => println!("{}", report::status(&self.peer, now)),
            Ok(Request::History) => println!("{}", report::history(self.peer.history())),
            Ok(Request::Quit) => return Some(Exit::Quit),
            Err(e) => println!("error: {e}"),
        }
        None
    }

    async fn flush<C: Channel>(&mut self, channel: &C) {
        for message in self.peer.drain_outbox() {
            let data = message.to_json();
            if let Err(e) = channel.send(&data).await {
                // The read side notices the close and ends the connection
                warn!(
                    "Failed to send {} to {}: {}",
                    message.message_type(),
                    channel.remote(),
                    e
                );
                break;
            }
        }
    }
}

async fn refuse_extra(host: Option<&HostListener>) -> Result<()> {
    match host {
        Some(listener) => listener.refuse_next().await,
        None => std::future::pending().await,
    }
}
