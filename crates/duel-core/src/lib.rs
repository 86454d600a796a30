//! duel-core: two-peer synchronization protocol for timed scoring rounds.
//!
//! This crate provides the core functionality for:
//! - Role negotiation between a host and a guest (`session`)
//! - The round lifecycle and vote admission (`round`)
//! - End-time renegotiation (`negotiation`)
//! - Versioned snapshots, recovery, and round history (`snapshot`, `history`)
//! - The `Peer` reducer that ties them together over one message channel
//! - KeyValueStore and Channel trait abstractions
//!
//! Nothing here performs IO or reads the clock on its own: handlers take
//! `now_ms` and queue outbound messages for the driver.

pub mod clock;
pub mod events;
pub mod history;
pub mod ids;
pub mod negotiation;
pub mod notice;
pub mod peer;
pub mod protocol;
pub mod role;
pub mod round;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod transport;

pub use events::{EventBus, PeerEvent, Subscription};
pub use history::{HistoryEntry, HistoryIndex};
pub use ids::{IdError, RoundId, SessionId};
pub use notice::{Notice, NoticeLevel};
pub use peer::{Action, ActionError, Input, Peer, PeerConfig};
pub use protocol::{Message, MessageError};
pub use role::{Orientation, Role, RolePair};
pub use round::{Round, RoundState, ScoreBoard, Vote};
pub use snapshot::{Snapshot, SnapshotError, SnapshotStore};
pub use store::{InMemoryStore, KeyValueStore, StoreError};
pub use transport::{Channel, TransportError};
