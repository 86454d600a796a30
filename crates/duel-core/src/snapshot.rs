//! Versioned snapshots of round and session state.
//!
//! Every local mutation persists a fresh snapshot under `duel:round:<id>`.
//! Versions are per round and only ever go up. Storage is best-effort:
//! failures are logged and swallowed so an unhealthy store never takes the
//! live session down with it.
//!
//! ## Keys
//!
//! | key | value |
//! |---|---|
//! | `duel:last-round` | id of the last round touched |
//! | `duel:round:<roundId>` | [`Snapshot`] JSON |
//! | `duel:history` | [`HistoryIndex`] JSON |
//! | `duel:open-round` | id of the running round, removed once it ends |

use crate::history::HistoryIndex;
use crate::ids::{RoundId, SessionId};
use crate::role::Role;
use crate::round::{Round, RoundState, ScoreBoard, Vote};
use crate::store::{KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

pub const LAST_ROUND_KEY: &str = "duel:last-round";
pub const OPEN_ROUND_KEY: &str = "duel:open-round";
const ROUND_KEY_PREFIX: &str = "duel:round:";

/// Storage key for a round's snapshot.
pub fn round_key(round_id: &RoundId) -> String {
    format!("{ROUND_KEY_PREFIX}{round_id}")
}

/// A snapshot that cannot describe a real round.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("End time {end_time} is not after start time {start_time}")]
    EndNotAfterStart { start_time: u64, end_time: u64 },

    #[error("Score {score} for {role} does not match {votes} recorded vote(s)")]
    ScoreMismatch { role: Role, score: u32, votes: usize },
}

/// Point-in-time copy of one peer's view of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u64,
    pub last_updated_at: u64,
    pub round_id: RoundId,
    pub session_id: Option<SessionId>,
    pub is_host: bool,
    pub locked_role: Option<Role>,
    pub start_time: u64,
    pub end_time: u64,
    pub state: RoundState,
    pub score_by_role: ScoreBoard,
    pub votes: Vec<Vote>,
}

impl Snapshot {
    /// Capture the current state. `version` and `last_updated_at` are filled
    /// in by [`SnapshotStore::persist`].
    pub fn capture(
        round: &Round,
        session_id: Option<&SessionId>,
        is_host: bool,
        locked_role: Option<Role>,
    ) -> Self {
        Self {
            version: 0,
            last_updated_at: 0,
            round_id: round.round_id.clone(),
            session_id: session_id.cloned(),
            is_host,
            locked_role,
            start_time: round.start_time,
            end_time: round.end_time,
            state: round.state,
            score_by_role: round.score_by_role,
            votes: round.votes.clone(),
        }
    }

    pub fn round(&self) -> Round {
        Round {
            round_id: self.round_id.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            state: self.state,
            score_by_role: self.score_by_role,
            votes: self.votes.clone(),
        }
    }

    /// Check the round invariants: it ends after it starts, and each score
    /// is the number of votes for that role.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.end_time <= self.start_time {
            return Err(SnapshotError::EndNotAfterStart {
                start_time: self.start_time,
                end_time: self.end_time,
            });
        }
        for role in [Role::A, Role::B] {
            let votes = self.votes.iter().filter(|v| v.role == role).count();
            let score = self.score_by_role.get(role);
            if u64::from(score) != votes as u64 {
                return Err(SnapshotError::ScoreMismatch { role, score, votes });
            }
        }
        Ok(())
    }

    /// The host's role as recorded by whoever wrote this snapshot.
    pub fn host_role(&self) -> Option<Role> {
        if self.is_host {
            self.locked_role
        } else {
            self.locked_role.map(Role::complement)
        }
    }

    /// False for a round that has ended and whose end time has passed.
    pub fn is_resumable(&self, now_ms: u64) -> bool {
        !(self.state == RoundState::Ended && self.end_time <= now_ms)
    }
}

/// Writes snapshots and the history index to a [`KeyValueStore`].
pub struct SnapshotStore<S: KeyValueStore> {
    store: S,
    /// Last version written per round in this process
    versions: HashMap<RoundId, u64>,
    history: HistoryIndex,
}

impl<S: KeyValueStore> SnapshotStore<S> {
    /// Wrap a store, loading the history index from it.
    ///
    /// An unreadable index starts out empty.
    pub fn new(store: S) -> Self {
        let history = HistoryIndex::load(&store).unwrap_or_else(|e| {
            warn!("Failed to load history, starting empty: {}", e);
            HistoryIndex::new()
        });
        Self {
            store,
            versions: HashMap::new(),
            history,
        }
    }

    pub fn history(&self) -> &HistoryIndex {
        &self.history
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    /// Stamp `draft` with the next version and `now_ms`, then write it.
    ///
    /// Returns the stamped snapshot even when the write failed.
    pub fn persist(&mut self, draft: Snapshot, now_ms: u64) -> Snapshot {
        let version = self.last_version(&draft.round_id) + 1;
        let snapshot = Snapshot {
            version,
            last_updated_at: now_ms,
            ..draft
        };
        self.versions.insert(snapshot.round_id.clone(), version);
        self.write(&snapshot);
        debug!(
            "Persisted round {} v{} ({:?})",
            snapshot.round_id, snapshot.version, snapshot.state
        );
        snapshot
    }

    /// Write a snapshot under its own key as-is, keeping its version.
    pub fn hydrate(&mut self, snapshot: &Snapshot) {
        let known = self.last_version(&snapshot.round_id);
        self.versions
            .insert(snapshot.round_id.clone(), known.max(snapshot.version));
        self.write(snapshot);
        debug!(
            "Hydrated round {} at v{}",
            snapshot.round_id, snapshot.version
        );
    }

    /// Read a round's snapshot. Missing or unreadable snapshots are `None`.
    pub fn load(&self, round_id: &RoundId) -> Option<Snapshot> {
        let key = round_key(round_id);
        let raw = match self.store.get(&key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str::<Snapshot>(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Ignoring corrupt snapshot under {}: {}", key, e);
                None
            }
        }
    }

    pub fn last_round_id(&self) -> Option<RoundId> {
        self.read_pointer(LAST_ROUND_KEY)
    }

    pub fn open_round_id(&self) -> Option<RoundId> {
        self.read_pointer(OPEN_ROUND_KEY)
    }

    /// Pick the snapshot to resume on startup.
    ///
    /// Uses `selector` when given, otherwise the last-touched round. A round
    /// that ended in the past is not resumed.
    pub fn resume_candidate(&self, selector: Option<&RoundId>, now_ms: u64) -> Option<Snapshot> {
        let round_id = match selector {
            Some(id) => id.clone(),
            None => self.last_round_id()?,
        };
        let snapshot = self.load(&round_id)?;
        if !snapshot.is_resumable(now_ms) {
            debug!("Round {} already ended, not resuming", round_id);
            return None;
        }
        Some(snapshot)
    }

    /// Forget a round: its history entry, its snapshot, and any pointer to it.
    pub fn remove_round(&mut self, round_id: &RoundId) -> bool {
        let had_entry = self.history.remove(round_id);
        if had_entry {
            log_failure("save history", self.history.save(&mut self.store));
        }

        let key = round_key(round_id);
        let existed = matches!(self.store.get(&key), Ok(Some(_)));
        log_failure("remove snapshot", self.store.remove(&key));

        for pointer in [LAST_ROUND_KEY, OPEN_ROUND_KEY] {
            if self.read_pointer(pointer).as_ref() == Some(round_id) {
                log_failure("clear pointer", self.store.remove(pointer));
            }
        }
        self.versions.remove(round_id);
        had_entry || existed
    }

    fn last_version(&self, round_id: &RoundId) -> u64 {
        if let Some(&version) = self.versions.get(round_id) {
            return version;
        }
        self.load(round_id).map_or(0, |s| s.version)
    }

    fn write(&mut self, snapshot: &Snapshot) {
        let round_id = snapshot.round_id.as_str();
        let result = serde_json::to_string(snapshot)
            .map_err(|e| StoreError::Io(e.to_string()))
            .and_then(|json| self.store.set(&round_key(&snapshot.round_id), &json));
        log_failure("write snapshot", result);
        log_failure("update last-round", self.store.set(LAST_ROUND_KEY, round_id));

        match snapshot.state {
            RoundState::Running => {
                log_failure("update open-round", self.store.set(OPEN_ROUND_KEY, round_id));
            }
            RoundState::Ended => {
                if self.open_round_id().as_ref() == Some(&snapshot.round_id) {
                    log_failure("clear open-round", self.store.remove(OPEN_ROUND_KEY));
                }
                if self.history.upsert(snapshot) {
                    log_failure("save history", self.history.save(&mut self.store));
                }
            }
            RoundState::Idle => {}
        }
    }

    fn read_pointer(&self, key: &str) -> Option<RoundId> {
        match self.store.get(key) {
            Ok(raw) => raw?.parse().ok(),
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                None
            }
        }
    }
}

fn log_failure(op: &str, result: Result<(), StoreError>) {
    if let Err(e) = result {
        warn!("Persistence failed ({}): {}", op, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    const NOW: u64 = 1_700_000_000_000;

    fn running_round(id: &str) -> Round {
        Round {
            round_id: id.parse().unwrap(),
            start_time: NOW,
            end_time: NOW + 60_000,
            state: RoundState::Running,
            score_by_role: ScoreBoard::new(1, 2),
            votes: vec![
                Vote { role: Role::A, elapsed_seconds: 3 },
                Vote { role: Role::B, elapsed_seconds: 5 },
                Vote { role: Role::B, elapsed_seconds: 9 },
            ],
        }
    }

    fn draft(round: &Round) -> Snapshot {
        Snapshot::capture(round, Some(&"s1".parse().unwrap()), true, Some(Role::A))
    }

    fn store() -> SnapshotStore<InMemoryStore> {
        SnapshotStore::new(InMemoryStore::new())
    }

    // ==================== Versions ====================

    #[test]
    fn test_versions_count_up_from_one() {
        let mut s = store();
        let round = running_round("r1");
        let versions: Vec<u64> = (0..5)
            .map(|i| s.persist(draft(&round), NOW + i).version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_versions_are_per_round() {
        let mut s = store();
        s.persist(draft(&running_round("r1")), NOW);
        s.persist(draft(&running_round("r1")), NOW);
        assert_eq!(s.persist(draft(&running_round("r2")), NOW).version, 1);
    }

    #[test]
    fn test_versions_continue_after_restart() {
        let mut s = store();
        s.persist(draft(&running_round("r1")), NOW);
        s.persist(draft(&running_round("r1")), NOW);

        let mut reopened = SnapshotStore::new(std::mem::take(s.store_mut()));
        assert_eq!(reopened.persist(draft(&running_round("r1")), NOW).version, 3);
    }

    #[test]
    fn test_hydrate_never_lowers_version() {
        let mut s = store();
        for _ in 0..4 {
            s.persist(draft(&running_round("r1")), NOW);
        }
        let mut old = draft(&running_round("r1"));
        old.version = 2;
        s.hydrate(&old);
        assert_eq!(s.persist(draft(&running_round("r1")), NOW).version, 5);
    }

    // ==================== Round trip ====================

    #[test]
    fn test_persisted_snapshot_reproduces_round() {
        let mut s = store();
        let round = running_round("r1");
        let written = s.persist(draft(&round), NOW + 10);

        let loaded = s.load(&round.round_id).unwrap();
        assert_eq!(loaded, written);
        assert_eq!(loaded.round(), round);
        assert_eq!(loaded.session_id, Some("s1".parse().unwrap()));
        assert_eq!(loaded.locked_role, Some(Role::A));
        assert!(loaded.is_host);
        assert_eq!(loaded.last_updated_at, NOW + 10);
    }

    #[test]
    fn test_snapshot_wire_format() {
        let snapshot = draft(&running_round("r1"));
        let json = serde_json::to_string(&snapshot).unwrap();
        for field in [
            "\"version\"",
            "\"lastUpdatedAt\"",
            "\"roundId\"",
            "\"sessionId\"",
            "\"isHost\"",
            "\"lockedRole\"",
            "\"startTime\"",
            "\"endTime\"",
            "\"state\":\"running\"",
            "\"scoreByRole\":{\"A\":1,\"B\":2}",
            "\"elapsedSeconds\"",
        ] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }

    #[test]
    fn test_host_role_from_either_side() {
        let mut snapshot = draft(&running_round("r1"));
        assert_eq!(snapshot.host_role(), Some(Role::A));
        snapshot.is_host = false;
        assert_eq!(snapshot.host_role(), Some(Role::B));
        snapshot.locked_role = None;
        assert_eq!(snapshot.host_role(), None);
    }

    // ==================== Pointers and history ====================

    #[test]
    fn test_pointers_follow_round_state() {
        let mut s = store();
        let mut round = running_round("r1");
        s.persist(draft(&round), NOW);
        assert_eq!(s.last_round_id(), Some(round.round_id.clone()));
        assert_eq!(s.open_round_id(), Some(round.round_id.clone()));
        assert!(s.history().is_empty());

        round.state = RoundState::Ended;
        s.persist(draft(&round), NOW + 1);
        assert_eq!(s.last_round_id(), Some(round.round_id.clone()));
        assert_eq!(s.open_round_id(), None);
        assert_eq!(s.history().len(), 1);
    }

    #[test]
    fn test_ending_old_round_keeps_newer_open_pointer() {
        let mut s = store();
        let mut old = running_round("r1");
        s.persist(draft(&old), NOW);
        s.persist(draft(&running_round("r2")), NOW);

        old.state = RoundState::Ended;
        s.hydrate(&draft(&old));
        assert_eq!(s.open_round_id(), Some("r2".parse().unwrap()));
    }

    #[test]
    fn test_history_survives_reopen() {
        let mut s = store();
        let mut round = running_round("r1");
        round.state = RoundState::Ended;
        s.persist(draft(&round), NOW);

        let reopened = SnapshotStore::new(std::mem::take(s.store_mut()));
        assert_eq!(reopened.history().len(), 1);
    }

    #[test]
    fn test_remove_round() {
        let mut s = store();
        let mut round = running_round("r1");
        round.state = RoundState::Ended;
        s.persist(draft(&round), NOW);

        assert!(s.remove_round(&round.round_id));
        assert!(s.history().is_empty());
        assert!(s.load(&round.round_id).is_none());
        assert_eq!(s.last_round_id(), None);
        assert!(!s.remove_round(&round.round_id));
    }

    // ==================== Resume ====================

    #[test]
    fn test_resume_last_running_round() {
        let mut s = store();
        s.persist(draft(&running_round("r1")), NOW);
        s.persist(draft(&running_round("r2")), NOW);

        let snapshot = s.resume_candidate(None, NOW + 1000).unwrap();
        assert_eq!(snapshot.round_id.as_str(), "r2");
    }

    #[test]
    fn test_resume_by_selector() {
        let mut s = store();
        s.persist(draft(&running_round("r1")), NOW);
        s.persist(draft(&running_round("r2")), NOW);

        let snapshot = s
            .resume_candidate(Some(&"r1".parse().unwrap()), NOW)
            .unwrap();
        assert_eq!(snapshot.round_id.as_str(), "r1");
        assert!(s.resume_candidate(Some(&"nope".parse().unwrap()), NOW).is_none());
    }

    #[test]
    fn test_ended_round_not_resumed() {
        let mut s = store();
        let mut round = running_round("r1");
        round.state = RoundState::Ended;
        round.end_time = NOW + 5;
        s.persist(draft(&round), NOW + 5);
        assert!(s.resume_candidate(None, NOW + 10).is_none());
    }

    // ==================== Failures ====================

    #[test]
    fn test_quota_failure_is_swallowed() {
        let mut s = SnapshotStore::new(InMemoryStore::with_quota(16));
        let snapshot = s.persist(draft(&running_round("r1")), NOW);
        // Version still advances in memory
        assert_eq!(snapshot.version, 1);
        assert!(s.load(&snapshot.round_id).is_none());
        assert_eq!(s.persist(draft(&running_round("r1")), NOW).version, 2);
    }

    #[test]
    fn test_corrupt_snapshot_ignored() {
        let mut s = store();
        s.store_mut().set("duel:round:r1", "{oops").unwrap();
        s.store_mut().set(LAST_ROUND_KEY, "r1").unwrap();
        assert!(s.load(&"r1".parse().unwrap()).is_none());
        assert!(s.resume_candidate(None, NOW).is_none());
        assert_eq!(s.persist(draft(&running_round("r1")), NOW).version, 1);
    }

    // ==================== Validation ====================

    #[test]
    fn test_validate() {
        let round = running_round("r1");
        assert_eq!(draft(&round).validate(), Ok(()));

        let mut snapshot = draft(&round);
        snapshot.end_time = snapshot.start_time;
        assert_eq!(
            snapshot.validate(),
            Err(SnapshotError::EndNotAfterStart {
                start_time: NOW,
                end_time: NOW
            })
        );

        let mut snapshot = draft(&round);
        snapshot.votes.pop();
        assert_eq!(
            snapshot.validate(),
            Err(SnapshotError::ScoreMismatch {
                role: Role::B,
                score: 2,
                votes: 1
            })
        );
    }
}
