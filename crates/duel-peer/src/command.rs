//! Line commands typed on stdin.
//!
//! Each line is parsed by clap as if it were its own command line, with the
//! first word naming the subcommand.

use clap::{CommandFactory, Parser, Subcommand};
use duel_core::{Action, ActionError, KeyValueStore, Peer, Role, RoundId};
use std::str::FromStr;
use thiserror::Error;

/// One stdin line.
#[derive(Parser, Debug)]
#[command(multicall = true)]
pub struct Line {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Lock your role
    Role {
        /// a or b
        role: Role,
    },
    /// Start a round lasting <SECS>
    Start {
        #[arg(value_parser = clap::value_parser!(u64).range(1..))]
        secs: u64,
    },
    /// Score a point for the other role
    Vote,
    /// Propose moving the end time by <SECS> (may be negative)
    Extend {
        #[arg(allow_negative_numbers = true)]
        secs: i64,
    },
    /// Accept the peer's end-time proposal
    Accept,
    /// Reject the peer's end-time proposal
    Reject,
    /// Propose ending the round now
    End,
    /// Accept the peer's proposal to end now
    AcceptEnd,
    /// Reject the peer's proposal to end now
    RejectEnd,
    /// Show the current round
    Status,
    /// List finished rounds
    History,
    /// Drop a finished round
    Forget { round_id: RoundId },
    /// Leave
    #[command(alias = "exit")]
    Quit,
}

/// What the runner should do with a parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Act(Action),
    Status,
    History,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{0} seconds is out of range")]
    SecondsOutOfRange(i128),

    #[error(transparent)]
    Action(#[from] ActionError),
}

/// The command list, as printed by `help`.
pub fn help() -> String {
    Line::command().render_help().to_string()
}

impl FromStr for Command {
    type Err = clap::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        Line::try_parse_from(line.split_whitespace()).map(|line| line.command)
    }
}

impl Command {
    /// Turn the command into a request against the peer's current state.
    ///
    /// `start` and `extend` are relative to the clock and the running
    /// round; `vote` stamps the elapsed seconds of the running round.
    pub fn resolve<S: KeyValueStore>(
        self,
        peer: &Peer<S>,
        now_ms: u64,
    ) -> Result<Request, ResolveError> {
        let action = match self {
            Self::Role { role } => Action::LockRole(role),
            Self::Start { secs } => {
                let end_time = secs
                    .checked_mul(1000)
                    .and_then(|ms| now_ms.checked_add(ms))
                    .ok_or(ResolveError::SecondsOutOfRange(secs.into()))?;
                Action::StartRound { end_time }
            }
            Self::Vote => Action::Vote {
                elapsed_seconds: peer.elapsed_seconds(now_ms),
            },
            Self::Extend { secs } => {
                let round = peer
                    .round()
                    .filter(|r| r.is_running())
                    .ok_or(ActionError::NoActiveRound)?;
                let end_time = secs
                    .checked_mul(1000)
                    .and_then(|ms| round.end_time.checked_add_signed(ms))
                    .ok_or(ResolveError::SecondsOutOfRange(secs.into()))?;
                Action::ProposeEndChange { end_time }
            }
            Self::Accept => Action::AcceptEndChange,
            Self::Reject => Action::RejectEndChange,
            Self::End => Action::ProposeEndNow,
            Self::AcceptEnd => Action::AcceptEndNow,
            Self::RejectEnd => Action::RejectEndNow,
            Self::Forget { round_id } => Action::RemoveHistory(round_id),
            Self::Status => return Ok(Request::Status),
            Self::History => return Ok(Request::History),
            Self::Quit => return Ok(Request::Quit),
        };
        Ok(Request::Act(action))
    }
}
