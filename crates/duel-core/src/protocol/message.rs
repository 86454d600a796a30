//! Wire protocol messages exchanged between the two peers.
//!
//! Every message is a JSON object tagged by `type`, with camelCase fields:
//! `{"type":"vote","roundId":"…","target":"B","elapsedSeconds":12}`.
//!
//! Stateful messages carry the `roundId` they refer to so a receiver can
//! drop anything addressed to a round it is not running.

use crate::ids::{RoundId, SessionId};
use crate::role::{Role, RolePair};
use crate::snapshot::{Snapshot, SnapshotError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frames larger than this are dropped before parsing.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Message too large ({size} > {MAX_MESSAGE_SIZE} bytes)")]
    TooLarge { size: usize },

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Snapshot envelope for {envelope} carries payload for {payload}")]
    SnapshotMismatch { envelope: RoundId, payload: RoundId },

    #[error("Invalid snapshot for {round_id}: {source}")]
    InvalidSnapshot {
        round_id: RoundId,
        source: SnapshotError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    /// A new round began on the sender
    Start {
        round_id: RoundId,
        end_time: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        roles: Option<RolePair>,
    },

    /// The sender voted; `target` is the receiver's role
    Vote {
        round_id: RoundId,
        target: Role,
        elapsed_seconds: u64,
    },

    ProposeEndChange {
        round_id: RoundId,
        proposed_end_time: u64,
    },

    AcceptEndChange {
        round_id: RoundId,
        proposed_end_time: u64,
    },

    RejectEndChange {
        round_id: RoundId,
        proposed_end_time: u64,
    },

    ProposeEndNow {
        round_id: RoundId,
    },

    AcceptEndNow {
        round_id: RoundId,
    },

    RejectEndNow {
        round_id: RoundId,
    },

    /// Host → guest: authoritative role pairing for this connection
    AssignRoles {
        session_id: SessionId,
        host_role: Role,
        guest_role: Role,
    },

    /// Guest → host: confirms an `assignRoles`
    AssignRolesAck {
        session_id: SessionId,
        my_role: Role,
    },

    /// Host → guest: full state for resynchronization
    StateSnapshot {
        round_id: RoundId,
        payload: Snapshot,
    },
}

impl Message {
    /// The `type` tag, for logging.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Vote { .. } => "vote",
            Self::ProposeEndChange { .. } => "proposeEndChange",
            Self::AcceptEndChange { .. } => "acceptEndChange",
            Self::RejectEndChange { .. } => "rejectEndChange",
            Self::ProposeEndNow { .. } => "proposeEndNow",
            Self::AcceptEndNow { .. } => "acceptEndNow",
            Self::RejectEndNow { .. } => "rejectEndNow",
            Self::AssignRoles { .. } => "assignRoles",
            Self::AssignRolesAck { .. } => "assignRolesAck",
            Self::StateSnapshot { .. } => "stateSnapshot",
        }
    }

    /// The round a message refers to, if any.
    pub fn round_id(&self) -> Option<&RoundId> {
        match self {
            Self::Start { round_id, .. }
            | Self::Vote { round_id, .. }
            | Self::ProposeEndChange { round_id, .. }
            | Self::AcceptEndChange { round_id, .. }
            | Self::RejectEndChange { round_id, .. }
            | Self::ProposeEndNow { round_id }
            | Self::AcceptEndNow { round_id }
            | Self::RejectEndNow { round_id }
            | Self::StateSnapshot { round_id, .. } => Some(round_id),
            Self::AssignRoles { .. } | Self::AssignRolesAck { .. } => None,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Message serialization should not fail")
    }

    /// Parse from JSON bytes.
    ///
    /// Rejects oversized frames, unknown `type` tags, missing fields, and
    /// snapshot envelopes whose payload names a different round.
    pub fn from_json(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge { size: data.len() });
        }

        let msg: Self = serde_json::from_slice(data)?;
        if let Self::StateSnapshot { round_id, payload } = &msg {
            if round_id != &payload.round_id {
                return Err(MessageError::SnapshotMismatch {
                    envelope: round_id.clone(),
                    payload: payload.round_id.clone(),
                });
            }
            payload
                .validate()
                .map_err(|source| MessageError::InvalidSnapshot {
                    round_id: round_id.clone(),
                    source,
                })?;
        }
        Ok(msg)
    }
}
