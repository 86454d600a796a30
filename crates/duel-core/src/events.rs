//! Event infrastructure for duel-core.
//!
//! `PeerEvent` describes every observable change of a peer's state;
//! `EventBus` fans them out to read-only subscribers (UI, logging, tests).
//! Wrap the bus in `Arc` to subscribe.

use crate::ids::{RoundId, SessionId};
use crate::notice::Notice;
use crate::role::Role;
use crate::round::{ScoreBoard, Vote};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PeerEvent {
    RoleLocked {
        role: Role,
    },
    /// The peer's pairing replaced a role we had chosen ourselves.
    RoleOverridden {
        previous: Role,
        role: Role,
    },
    SessionConfirmed {
        session_id: SessionId,
    },
    /// `assignRoles` went unacknowledged after every attempt.
    SessionUnconfirmed {
        session_id: SessionId,
    },
    RoundStarted {
        round_id: RoundId,
        start_time: u64,
        end_time: u64,
    },
    Tick {
        round_id: RoundId,
        remaining_ms: u64,
    },
    VoteRecorded {
        round_id: RoundId,
        vote: Vote,
        score_by_role: ScoreBoard,
    },
    RoundEnded {
        round_id: RoundId,
        end_time: u64,
        score_by_role: ScoreBoard,
    },
    EndTimeChanged {
        round_id: RoundId,
        end_time: u64,
    },
    EndChangeProposed {
        round_id: RoundId,
        proposed_end_time: u64,
    },
    EndNowProposed {
        round_id: RoundId,
    },
    /// The peer rejected one of our proposals.
    ProposalDeclined {
        round_id: RoundId,
    },
    SnapshotApplied {
        round_id: RoundId,
        version: u64,
    },
    /// A pushed snapshot was dropped because we run a different round.
    SnapshotRejected {
        round_id: RoundId,
        current: RoundId,
    },
    Notice(Notice),
    NoticeCleared,
    MessageSent {
        message_type: &'static str,
        size: usize,
    },
    MessageReceived {
        message_type: &'static str,
        size: usize,
    },
    SendFailed {
        message_type: &'static str,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// Event bus for publishing peer events to subscribers.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(PeerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds the read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: PeerEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
