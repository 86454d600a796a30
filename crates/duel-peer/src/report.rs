//! Plain-text rendering of peer state for the terminal.

use duel_core::clock::ceil_secs;
use duel_core::{HistoryEntry, KeyValueStore, Peer, PeerEvent, RoundState, ScoreBoard};
use std::fmt::Write;

pub fn score(board: &ScoreBoard) -> String {
    format!(
        "A {} : B {}",
        board.get(duel_core::Role::A),
        board.get(duel_core::Role::B)
    )
}

/// `m:ss`
pub fn clock(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// One line for an event worth showing the user, `None` for chatter.
///
/// Ticks are shown every ten seconds and for the last five.
pub fn describe(event: &PeerEvent) -> Option<String> {
    let line = match event {
        PeerEvent::RoleLocked { role } => format!("you are {role}"),
        PeerEvent::RoleOverridden { previous, role } => {
            format!("role changed from {previous} to {role} by peer")
        }
        PeerEvent::SessionConfirmed { .. } => "roles confirmed with peer".to_string(),
        PeerEvent::SessionUnconfirmed { .. } => {
            "peer never confirmed roles; they will be re-sent on reconnect".to_string()
        }
        PeerEvent::RoundStarted {
            round_id,
            start_time,
            end_time,
        } => format!(
            "round {round_id} started ({})",
            clock(ceil_secs(*start_time, *end_time))
        ),
        PeerEvent::Tick { remaining_ms, .. } => {
            let secs = remaining_ms.div_ceil(1000);
            if secs == 0 || (secs > 5 && secs % 10 != 0) {
                return None;
            }
            format!("{} left", clock(secs))
        }
        PeerEvent::VoteRecorded {
            vote,
            score_by_role,
            ..
        } => format!(
            "point for {} at {}  [{}]",
            vote.role,
            clock(vote.elapsed_seconds),
            score(score_by_role)
        ),
        PeerEvent::RoundEnded { score_by_role, .. } => {
            format!("round over  [{}]", score(score_by_role))
        }
        PeerEvent::EndTimeChanged { .. } => "end time changed".to_string(),
        PeerEvent::EndChangeProposed { .. } => {
            "peer proposes a new end time (accept / reject)".to_string()
        }
        PeerEvent::EndNowProposed { .. } => {
            "peer proposes ending now (accept-end / reject-end)".to_string()
        }
        PeerEvent::ProposalDeclined { .. } => "peer declined your proposal".to_string(),
        PeerEvent::SnapshotApplied { round_id, version } => {
            format!("synced round {round_id} (v{version})")
        }
        PeerEvent::SnapshotRejected { round_id, current } => {
            format!("ignored peer state for {round_id}, still on {current}")
        }
        PeerEvent::Notice(notice) => notice.to_string(),
        PeerEvent::NoticeCleared
        | PeerEvent::MessageSent { .. }
        | PeerEvent::MessageReceived { .. }
        | PeerEvent::SendFailed { .. } => return None,
    };
    Some(line)
}

/// Multi-line summary for the `status` command.
pub fn status<S: KeyValueStore>(peer: &Peer<S>, now_ms: u64) -> String {
    let mut out = String::new();
    let side = if peer.orientation().is_host() {
        "host"
    } else {
        "guest"
    };
    let link = if peer.is_channel_open() {
        "connected"
    } else {
        "offline"
    };
    let _ = writeln!(out, "{side}, {link}");

    match peer.locked_role() {
        Some(role) => {
            let confirmed = peer.session().is_some_and(|s| s.confirmed);
            let _ = writeln!(
                out,
                "role {role}{}",
                if confirmed { "" } else { " (unconfirmed)" }
            );
        }
        None => {
            let _ = writeln!(out, "no role yet");
        }
    }

    match peer.round() {
        Some(round) => {
            let state = match round.state {
                RoundState::Running => {
                    format!("{} left", clock(peer.remaining_seconds(now_ms)))
                }
                RoundState::Ended => "ended".to_string(),
                RoundState::Idle => "idle".to_string(),
            };
            let _ = writeln!(
                out,
                "round {}: {state}  [{}]  {} votes",
                round.round_id,
                score(&round.score_by_role),
                round.votes.len()
            );
        }
        None => {
            let _ = writeln!(out, "no round");
        }
    }

    let negotiation = peer.negotiation();
    if let Some(change) = negotiation.incoming_end_change() {
        let _ = writeln!(
            out,
            "peer proposes ending in {}",
            clock(ceil_secs(now_ms, change.proposed_end_time))
        );
    }
    if negotiation.has_incoming_end_now() {
        let _ = writeln!(out, "peer proposes ending now");
    }
    if let Some(notice) = peer.notice() {
        let _ = writeln!(out, "{notice}");
    }
    out.trim_end().to_string()
}

/// One line per finished round, newest first.
pub fn history(entries: &[HistoryEntry]) -> String {
    if entries.is_empty() {
        return "no finished rounds".to_string();
    }
    entries
        .iter()
        .map(|e| {
            format!(
                "{}  {}  [{}]",
                e.round_id,
                clock(e.end_time.saturating_sub(e.start_time) / 1000),
                score(&e.score_by_role)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
