//! Protocol definitions for peer communication.
//!
//! A single JSON message family (see [`message`]) covers role assignment,
//! the round lifecycle, negotiation, and snapshot push.

pub mod message;

pub use message::{MAX_MESSAGE_SIZE, Message, MessageError};
