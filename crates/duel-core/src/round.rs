//! Round state machine.
//!
//! A round moves `idle → running → ended` and never backwards. Starting a
//! new round replaces the previous one outright.
//!
//! The machine owns its tick timer as a deadline. The caller is responsible
//! for calling [`RoundMachine::poll`] at least once per tick interval and
//! acting on the returned [`TickOutcome`].

use crate::clock::{ceil_secs, millis};
use crate::ids::RoundId;
use crate::role::Role;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoundError {
    #[error("End time {end_time} is not in the future (now {now})")]
    EndTimeNotInFuture { end_time: u64, now: u64 },

    #[error("No round has been started")]
    NoRound,

    #[error("Round is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, RoundError>;

/// Lifecycle state of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundState {
    Idle,
    Running,
    Ended,
}

/// Points per role. Serialized as `{"A":n,"B":n}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBoard {
    #[serde(rename = "A")]
    a: u32,
    #[serde(rename = "B")]
    b: u32,
}

impl ScoreBoard {
    pub fn new(a: u32, b: u32) -> Self {
        Self { a, b }
    }

    pub fn get(&self, role: Role) -> u32 {
        match role {
            Role::A => self.a,
            Role::B => self.b,
        }
    }

    fn increment(&mut self, role: Role) {
        match role {
            Role::A => self.a = self.a.saturating_add(1),
            Role::B => self.b = self.b.saturating_add(1),
        }
    }
}

/// One vote: the role that scored and when, relative to round start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub role: Role,
    pub elapsed_seconds: u64,
}

/// A single timed round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    pub round_id: RoundId,
    /// ms since epoch, local clock of whoever started (or adopted) it
    pub start_time: u64,
    /// ms since epoch
    pub end_time: u64,
    pub state: RoundState,
    pub score_by_role: ScoreBoard,
    pub votes: Vec<Vote>,
}

impl Round {
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.end_time.saturating_sub(now_ms)
    }

    pub fn is_running(&self) -> bool {
        self.state == RoundState::Running
    }

    fn record(&mut self, vote: Vote) {
        self.score_by_role.increment(vote.role);
        self.votes.push(vote);
    }
}

/// What a poll of the round timer produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Scheduled tick fired; milliseconds left in the round
    Remaining(u64),
    /// The round just reached its end time and is now `ended`
    Ended,
}

/// Result of admitting a vote that arrived from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteAdmission {
    Applied(Vote),
    /// Vote references a round we are not running
    StaleRound,
    /// Vote targets a role other than ours (`expected` is our locked role)
    WrongTarget { expected: Option<Role>, got: Role },
}

/// Owns the current round and its tick timer.
#[derive(Debug)]
pub struct RoundMachine {
    tick_interval: Duration,
    round: Option<Round>,
    /// Next scheduled tick, `None` when the timer is cancelled
    next_tick_at: Option<u64>,
}

impl RoundMachine {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            tick_interval,
            round: None,
            next_tick_at: None,
        }
    }

    pub fn round(&self) -> Option<&Round> {
        self.round.as_ref()
    }

    pub fn round_id(&self) -> Option<&RoundId> {
        self.round.as_ref().map(|r| &r.round_id)
    }

    /// The state of the current round, `Idle` when none was ever started.
    pub fn state(&self) -> RoundState {
        self.round.as_ref().map_or(RoundState::Idle, |r| r.state)
    }

    pub fn is_timer_armed(&self) -> bool {
        self.next_tick_at.is_some()
    }

    /// Start a fresh round with a newly generated id.
    pub fn start(&mut self, end_time: u64, now_ms: u64) -> Result<&Round> {
        self.begin(RoundId::generate(), end_time, now_ms)
    }

    /// Start a fresh round announced by the peer, keeping its id.
    pub fn adopt_start(&mut self, round_id: RoundId, end_time: u64, now_ms: u64) -> Result<&Round> {
        self.begin(round_id, end_time, now_ms)
    }

    fn begin(&mut self, round_id: RoundId, end_time: u64, now_ms: u64) -> Result<&Round> {
        if end_time <= now_ms {
            return Err(RoundError::EndTimeNotInFuture {
                end_time,
                now: now_ms,
            });
        }

        self.next_tick_at = Some(now_ms + millis(self.tick_interval));
        Ok(&*self.round.insert(Round {
            round_id,
            start_time: now_ms,
            end_time,
            state: RoundState::Running,
            score_by_role: ScoreBoard::default(),
            votes: Vec::new(),
        }))
    }

    /// Replace the current round wholesale (snapshot adoption).
    ///
    /// The timer is re-armed from the local clock if the round is still running.
    pub fn restore(&mut self, round: Round, now_ms: u64) {
        self.next_tick_at = round
            .is_running()
            .then(|| now_ms + millis(self.tick_interval));
        self.round = Some(round);
    }

    /// Service the tick timer.
    ///
    /// Ends the round as soon as `now >= end_time`, whether or not a tick is
    /// due. Returns `None` when nothing happened.
    pub fn poll(&mut self, now_ms: u64) -> Option<TickOutcome> {
        let Some(round) = self.round.as_mut().filter(|r| r.is_running()) else {
            self.next_tick_at = None;
            return None;
        };

        if round.remaining_ms(now_ms) == 0 {
            round.state = RoundState::Ended;
            self.next_tick_at = None;
            return Some(TickOutcome::Ended);
        }

        match self.next_tick_at {
            Some(due) if now_ms >= due => {
                self.next_tick_at = Some(now_ms + millis(self.tick_interval));
                Some(TickOutcome::Remaining(round.remaining_ms(now_ms)))
            }
            Some(_) => None,
            None => {
                self.next_tick_at = Some(now_ms + millis(self.tick_interval));
                None
            }
        }
    }

    /// Record a vote cast by the local user for the opponent of `voter`.
    pub fn record_local_vote(&mut self, voter: Role, elapsed_seconds: u64) -> Result<Vote> {
        let round = self.round.as_mut().ok_or(RoundError::NoRound)?;
        if !round.is_running() {
            return Err(RoundError::NotRunning);
        }

        let vote = Vote {
            role: voter.complement(),
            elapsed_seconds,
        };
        round.record(vote);
        Ok(vote)
    }

    /// Admit a vote from the peer. The sender can only vote for its opponent,
    /// so a valid vote always targets our own role.
    pub fn apply_remote_vote(
        &mut self,
        round_id: &RoundId,
        target: Role,
        elapsed_seconds: u64,
        local_role: Option<Role>,
    ) -> VoteAdmission {
        let Some(round) = self.round.as_mut().filter(|r| &r.round_id == round_id) else {
            return VoteAdmission::StaleRound;
        };

        if local_role != Some(target) {
            return VoteAdmission::WrongTarget {
                expected: local_role,
                got: target,
            };
        }

        let vote = Vote {
            role: target,
            elapsed_seconds,
        };
        round.record(vote);
        VoteAdmission::Applied(vote)
    }

    /// Move the end time of the running round.
    ///
    /// An end time that has already passed ends the round on the next poll.
    pub fn set_end_time(&mut self, end_time: u64) -> Result<()> {
        let round = self.round.as_mut().ok_or(RoundError::NoRound)?;
        if !round.is_running() {
            return Err(RoundError::NotRunning);
        }
        round.end_time = end_time.max(round.start_time.saturating_add(1));
        Ok(())
    }

    /// End the running round immediately. Returns false if it was not running.
    pub fn end_now(&mut self, now_ms: u64) -> bool {
        let Some(round) = self.round.as_mut().filter(|r| r.is_running()) else {
            return false;
        };
        round.state = RoundState::Ended;
        round.end_time = now_ms.max(round.start_time.saturating_add(1));
        self.next_tick_at = None;
        true
    }

    /// Whole seconds since the current round started.
    pub fn elapsed_seconds(&self, now_ms: u64) -> u64 {
        self.round
            .as_ref()
            .map_or(0, |r| now_ms.saturating_sub(r.start_time) / 1000)
    }

    /// Whole seconds left, rounded up.
    pub fn remaining_seconds(&self, now_ms: u64) -> u64 {
        self.round
            .as_ref()
            .filter(|r| r.is_running())
            .map_or(0, |r| ceil_secs(now_ms, r.end_time))
    }
}
