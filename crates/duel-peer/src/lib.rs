//! duel-peer library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the `duel` binary's components,
//! allowing integration tests to run real peers over localhost.

pub mod command;
pub mod connection;
pub mod file_store;
pub mod outgoing;
pub mod report;
pub mod runner;
pub mod server;

// Re-export key types for convenience
pub use command::{Command, Request, ResolveError};
pub use connection::WsChannel;
pub use file_store::FileStore;
pub use outgoing::{ReconnectConfig, connect};
pub use runner::{Exit, Runner};
pub use server::HostListener;
