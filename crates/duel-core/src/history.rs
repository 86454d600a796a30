//! Index of completed rounds.
//!
//! One entry per `roundId`, kept sorted newest-ended first (`endTime` desc,
//! then `lastUpdatedAt` desc). Stored as a single JSON list under
//! [`HISTORY_KEY`].

use crate::ids::RoundId;
use crate::round::{RoundState, ScoreBoard};
use crate::snapshot::Snapshot;
use crate::store::{KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

pub const HISTORY_KEY: &str = "duel:history";

/// Summary of a finished round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub round_id: RoundId,
    pub start_time: u64,
    pub end_time: u64,
    pub score_by_role: ScoreBoard,
    pub last_updated_at: u64,
}

impl From<&Snapshot> for HistoryEntry {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            round_id: snapshot.round_id.clone(),
            start_time: snapshot.start_time,
            end_time: snapshot.end_time,
            score_by_role: snapshot.score_by_role,
            last_updated_at: snapshot.last_updated_at,
        }
    }
}

fn newest_first(a: &HistoryEntry, b: &HistoryEntry) -> Ordering {
    b.end_time
        .cmp(&a.end_time)
        .then(b.last_updated_at.cmp(&a.last_updated_at))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryIndex {
    entries: Vec<HistoryEntry>,
}

impl HistoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index. A missing key is an empty index.
    ///
    /// Duplicate ids in stored data keep their newest entry.
    pub fn load<S: KeyValueStore + ?Sized>(store: &S) -> Result<Self, StoreError> {
        let Some(raw) = store.get(HISTORY_KEY)? else {
            return Ok(Self::new());
        };
        let mut entries: Vec<HistoryEntry> =
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                key: HISTORY_KEY.to_string(),
                reason: e.to_string(),
            })?;

        entries.sort_by(newest_first);
        let mut seen = HashSet::new();
        entries.retain(|e| seen.insert(e.round_id.clone()));
        Ok(Self { entries })
    }

    pub fn save<S: KeyValueStore + ?Sized>(&self, store: &mut S) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&self.entries).map_err(|e| StoreError::Io(e.to_string()))?;
        store.set(HISTORY_KEY, &raw)
    }

    /// Insert or replace the entry for an ended round.
    ///
    /// Returns false (and changes nothing) for a snapshot that has not ended.
    pub fn upsert(&mut self, snapshot: &Snapshot) -> bool {
        if snapshot.state != RoundState::Ended {
            return false;
        }
        self.entries.retain(|e| e.round_id != snapshot.round_id);
        self.entries.push(HistoryEntry::from(snapshot));
        self.entries.sort_by(newest_first);
        true
    }

    /// Remove the entry for a round. Returns true if one existed.
    pub fn remove(&mut self, round_id: &RoundId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.round_id != round_id);
        self.entries.len() != before
    }

    pub fn get(&self, round_id: &RoundId) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| &e.round_id == round_id)
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
