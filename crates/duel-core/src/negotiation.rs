//! Bilateral propose/accept/reject exchanges that alter round timing.
//!
//! Two independent negotiations: changing the end time, and ending now.
//! Each keeps at most one outgoing and one incoming proposal; a fresh
//! proposal of the same kind replaces an unresolved one. Everything is
//! keyed by `roundId` and ignored when it names a different round.

use crate::ids::RoundId;
use crate::protocol::Message;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("No active round to negotiate about")]
    NoActiveRound,

    #[error("Proposed end time {proposed} is not in the future (now {now})")]
    EndTimeNotInFuture { proposed: u64, now: u64 },

    #[error("No pending proposal to answer")]
    NothingPending,
}

pub type Result<T> = std::result::Result<T, NegotiationError>;

/// A proposed new end time for a specific round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndChange {
    pub round_id: RoundId,
    pub proposed_end_time: u64,
}

/// What an inbound negotiation message asks the round to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Message was for another round or otherwise dropped
    Ignored,
    /// Proposal stored for a human decision
    Pending,
    /// Apply this end time to the round
    ApplyEndTime(u64),
    /// End the round immediately
    EndNow,
    /// Peer declined our proposal; nothing changes
    Declined,
}

#[derive(Debug, Default)]
pub struct NegotiationManager {
    outgoing_end_change: Option<EndChange>,
    incoming_end_change: Option<EndChange>,
    outgoing_end_now: Option<RoundId>,
    incoming_end_now: Option<RoundId>,
}

impl NegotiationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incoming_end_change(&self) -> Option<&EndChange> {
        self.incoming_end_change.as_ref()
    }

    pub fn outgoing_end_change(&self) -> Option<&EndChange> {
        self.outgoing_end_change.as_ref()
    }

    pub fn has_incoming_end_now(&self) -> bool {
        self.incoming_end_now.is_some()
    }

    pub fn has_outgoing_end_now(&self) -> bool {
        self.outgoing_end_now.is_some()
    }

    /// Forget everything (new round, adopted snapshot).
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    // ==================== End-time change ====================

    /// Propose a new end time. Validated locally; nothing is sent on error.
    pub fn propose_end_change(
        &mut self,
        current: Option<&RoundId>,
        proposed_end_time: u64,
        now_ms: u64,
    ) -> Result<Message> {
        let round_id = current.ok_or(NegotiationError::NoActiveRound)?;
        if proposed_end_time <= now_ms {
            return Err(NegotiationError::EndTimeNotInFuture {
                proposed: proposed_end_time,
                now: now_ms,
            });
        }

        self.outgoing_end_change = Some(EndChange {
            round_id: round_id.clone(),
            proposed_end_time,
        });
        Ok(Message::ProposeEndChange {
            round_id: round_id.clone(),
            proposed_end_time,
        })
    }

    /// Peer proposed an end time. Replaces any earlier incoming proposal.
    pub fn on_propose_end_change(
        &mut self,
        current: Option<&RoundId>,
        round_id: RoundId,
        proposed_end_time: u64,
    ) -> Resolution {
        if current != Some(&round_id) {
            debug!("Ignoring proposeEndChange for round {}", round_id);
            return Resolution::Ignored;
        }
        self.incoming_end_change = Some(EndChange {
            round_id,
            proposed_end_time,
        });
        Resolution::Pending
    }

    /// Accept the pending incoming proposal.
    ///
    /// Returns the reply and the end time to apply locally. Accepting also
    /// drops any proposal of our own that crossed with it.
    pub fn accept_end_change(&mut self, current: Option<&RoundId>) -> Result<(Message, u64)> {
        let proposal = self.take_incoming_end_change(current)?;
        self.outgoing_end_change = None;
        Ok((
            Message::AcceptEndChange {
                round_id: proposal.round_id,
                proposed_end_time: proposal.proposed_end_time,
            },
            proposal.proposed_end_time,
        ))
    }

    /// Reject the pending incoming proposal.
    pub fn reject_end_change(&mut self, current: Option<&RoundId>) -> Result<Message> {
        let proposal = self.take_incoming_end_change(current)?;
        Ok(Message::RejectEndChange {
            round_id: proposal.round_id,
            proposed_end_time: proposal.proposed_end_time,
        })
    }

    fn take_incoming_end_change(&mut self, current: Option<&RoundId>) -> Result<EndChange> {
        match self.incoming_end_change.take() {
            Some(p) if current == Some(&p.round_id) => Ok(p),
            _ => Err(NegotiationError::NothingPending),
        }
    }

    /// Peer accepted our end-time proposal: apply it.
    ///
    /// Only an answer to the proposal we still have outstanding counts; the
    /// end time applied is ours, and must match the one echoed back.
    pub fn on_accept_end_change(
        &mut self,
        current: Option<&RoundId>,
        round_id: RoundId,
        proposed_end_time: u64,
    ) -> Resolution {
        match self.take_outgoing_end_change(current, &round_id, proposed_end_time) {
            Some(ours) => Resolution::ApplyEndTime(ours.proposed_end_time),
            None => {
                debug!("Ignoring acceptEndChange for round {}", round_id);
                Resolution::Ignored
            }
        }
    }

    pub fn on_reject_end_change(
        &mut self,
        current: Option<&RoundId>,
        round_id: RoundId,
        proposed_end_time: u64,
    ) -> Resolution {
        match self.take_outgoing_end_change(current, &round_id, proposed_end_time) {
            Some(_) => Resolution::Declined,
            None => {
                debug!("Ignoring rejectEndChange for round {}", round_id);
                Resolution::Ignored
            }
        }
    }

    fn take_outgoing_end_change(
        &mut self,
        current: Option<&RoundId>,
        round_id: &RoundId,
        proposed_end_time: u64,
    ) -> Option<EndChange> {
        if current != Some(round_id) {
            return None;
        }
        let matches = self.outgoing_end_change.as_ref().is_some_and(|ours| {
            &ours.round_id == round_id && ours.proposed_end_time == proposed_end_time
        });
        if matches {
            self.outgoing_end_change.take()
        } else {
            None
        }
    }

    // ==================== Immediate end ====================

    pub fn propose_end_now(&mut self, current: Option<&RoundId>) -> Result<Message> {
        let round_id = current.ok_or(NegotiationError::NoActiveRound)?;
        self.outgoing_end_now = Some(round_id.clone());
        Ok(Message::ProposeEndNow {
            round_id: round_id.clone(),
        })
    }

    pub fn on_propose_end_now(&mut self, current: Option<&RoundId>, round_id: RoundId) -> Resolution {
        if current != Some(&round_id) {
            debug!("Ignoring proposeEndNow for round {}", round_id);
            return Resolution::Ignored;
        }
        self.incoming_end_now = Some(round_id);
        Resolution::Pending
    }

    /// Accept the peer's end-now proposal. The caller ends the round locally.
    pub fn accept_end_now(&mut self, current: Option<&RoundId>) -> Result<Message> {
        let round_id = self.take_incoming_end_now(current)?;
        self.outgoing_end_now = None;
        Ok(Message::AcceptEndNow { round_id })
    }

    pub fn reject_end_now(&mut self, current: Option<&RoundId>) -> Result<Message> {
        let round_id = self.take_incoming_end_now(current)?;
        Ok(Message::RejectEndNow { round_id })
    }

    fn take_incoming_end_now(&mut self, current: Option<&RoundId>) -> Result<RoundId> {
        match self.incoming_end_now.take() {
            Some(id) if current == Some(&id) => Ok(id),
            _ => Err(NegotiationError::NothingPending),
        }
    }

    /// Peer accepted our end-now proposal. Ignored unless we made one.
    pub fn on_accept_end_now(&mut self, current: Option<&RoundId>, round_id: RoundId) -> Resolution {
        if !self.take_outgoing_end_now(current, &round_id) {
            debug!("Ignoring acceptEndNow for round {}", round_id);
            return Resolution::Ignored;
        }
        Resolution::EndNow
    }

    pub fn on_reject_end_now(&mut self, current: Option<&RoundId>, round_id: RoundId) -> Resolution {
        if !self.take_outgoing_end_now(current, &round_id) {
            debug!("Ignoring rejectEndNow for round {}", round_id);
            return Resolution::Ignored;
        }
        Resolution::Declined
    }

    fn take_outgoing_end_now(&mut self, current: Option<&RoundId>, round_id: &RoundId) -> bool {
        if current != Some(round_id) || self.outgoing_end_now.as_ref() != Some(round_id) {
            return false;
        }
        self.outgoing_end_now = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn rid(s: &str) -> RoundId {
        s.parse().unwrap()
    }

    // ==================== End-time change ====================

    #[test]
    fn test_propose_requires_future_end_time() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        assert_eq!(
            n.propose_end_change(Some(&r1), NOW, NOW),
            Err(NegotiationError::EndTimeNotInFuture { proposed: NOW, now: NOW })
        );
        assert!(n.outgoing_end_change().is_none());
        assert_eq!(
            n.propose_end_change(None, NOW + 1, NOW),
            Err(NegotiationError::NoActiveRound)
        );
    }

    #[test]
    fn test_propose_end_change_message() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        let msg = n.propose_end_change(Some(&r1), NOW + 5000, NOW).unwrap();
        assert_eq!(
            msg,
            Message::ProposeEndChange { round_id: r1.clone(), proposed_end_time: NOW + 5000 }
        );
        assert_eq!(n.outgoing_end_change().unwrap().proposed_end_time, NOW + 5000);
    }

    #[test]
    fn test_incoming_proposal_for_other_round_ignored() {
        let mut n = NegotiationManager::new();
        let r2 = rid("r2");
        assert_eq!(
            n.on_propose_end_change(Some(&r2), rid("r1"), NOW + 1),
            Resolution::Ignored
        );
        assert!(n.incoming_end_change().is_none());
    }

    #[test]
    fn test_newer_incoming_proposal_supersedes() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        n.on_propose_end_change(Some(&r1), r1.clone(), NOW + 1000);
        n.on_propose_end_change(Some(&r1), r1.clone(), NOW + 2000);
        assert_eq!(n.incoming_end_change().unwrap().proposed_end_time, NOW + 2000);
    }

    #[test]
    fn test_accept_end_change() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        n.propose_end_change(Some(&r1), NOW + 9000, NOW).unwrap();
        n.on_propose_end_change(Some(&r1), r1.clone(), NOW + 2000);

        let (reply, end) = n.accept_end_change(Some(&r1)).unwrap();
        assert_eq!(end, NOW + 2000);
        assert_eq!(
            reply,
            Message::AcceptEndChange { round_id: r1.clone(), proposed_end_time: NOW + 2000 }
        );
        assert!(n.incoming_end_change().is_none());
        // Our crossing proposal was dropped
        assert!(n.outgoing_end_change().is_none());
        // Nothing left to accept
        assert_eq!(n.accept_end_change(Some(&r1)), Err(NegotiationError::NothingPending));
    }

    #[test]
    fn test_accept_after_round_changed_fails() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        n.on_propose_end_change(Some(&r1), r1.clone(), NOW + 2000);
        assert_eq!(
            n.accept_end_change(Some(&rid("r2"))),
            Err(NegotiationError::NothingPending)
        );
    }

    #[test]
    fn test_proposer_applies_on_accept() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        n.propose_end_change(Some(&r1), NOW + 5000, NOW).unwrap();
        assert_eq!(
            n.on_accept_end_change(Some(&r1), r1.clone(), NOW + 5000),
            Resolution::ApplyEndTime(NOW + 5000)
        );
        assert!(n.outgoing_end_change().is_none());
    }

    #[test]
    fn test_reject_end_change_changes_nothing() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        n.propose_end_change(Some(&r1), NOW + 5000, NOW).unwrap();
        assert_eq!(
            n.on_reject_end_change(Some(&r1), r1.clone(), NOW + 5000),
            Resolution::Declined
        );
        assert!(n.outgoing_end_change().is_none());
    }

    #[test]
    fn test_stale_accept_ignored() {
        let mut n = NegotiationManager::new();
        let r2 = rid("r2");
        assert_eq!(
            n.on_accept_end_change(Some(&r2), rid("r1"), NOW),
            Resolution::Ignored
        );
        assert_eq!(n.on_accept_end_now(None, rid("r1")), Resolution::Ignored);
    }

    #[test]
    fn test_unsolicited_accept_end_change_ignored() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        assert_eq!(
            n.on_accept_end_change(Some(&r1), r1.clone(), NOW + 5000),
            Resolution::Ignored
        );
        assert_eq!(
            n.on_reject_end_change(Some(&r1), r1.clone(), NOW + 5000),
            Resolution::Ignored
        );
    }

    #[test]
    fn test_accept_must_echo_our_end_time() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        n.propose_end_change(Some(&r1), NOW + 5000, NOW).unwrap();

        assert_eq!(
            n.on_accept_end_change(Some(&r1), r1.clone(), NOW + 1),
            Resolution::Ignored
        );
        // Still waiting on the real answer
        assert_eq!(n.outgoing_end_change().unwrap().proposed_end_time, NOW + 5000);

        // A superseded proposal's answer does not count either
        n.propose_end_change(Some(&r1), NOW + 8000, NOW).unwrap();
        assert_eq!(
            n.on_reject_end_change(Some(&r1), r1.clone(), NOW + 5000),
            Resolution::Ignored
        );
        assert_eq!(
            n.on_accept_end_change(Some(&r1), r1.clone(), NOW + 8000),
            Resolution::ApplyEndTime(NOW + 8000)
        );
    }

    // ==================== End now ====================

    #[test]
    fn test_end_now_flow() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        let msg = n.propose_end_now(Some(&r1)).unwrap();
        assert_eq!(msg, Message::ProposeEndNow { round_id: r1.clone() });
        assert!(n.has_outgoing_end_now());
        assert_eq!(n.on_accept_end_now(Some(&r1), r1.clone()), Resolution::EndNow);
        assert!(!n.has_outgoing_end_now());
    }

    #[test]
    fn test_unsolicited_end_now_answers_ignored() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        assert_eq!(n.on_accept_end_now(Some(&r1), r1.clone()), Resolution::Ignored);
        assert_eq!(n.on_reject_end_now(Some(&r1), r1.clone()), Resolution::Ignored);

        // An incoming proposal is not ours to have accepted
        n.on_propose_end_now(Some(&r1), r1.clone());
        assert_eq!(n.on_accept_end_now(Some(&r1), r1.clone()), Resolution::Ignored);
        assert!(n.has_incoming_end_now());
    }

    #[test]
    fn test_incoming_end_now_accept_and_reject() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        assert_eq!(n.on_propose_end_now(Some(&r1), r1.clone()), Resolution::Pending);
        assert!(n.has_incoming_end_now());
        assert_eq!(
            n.reject_end_now(Some(&r1)).unwrap(),
            Message::RejectEndNow { round_id: r1.clone() }
        );
        assert!(!n.has_incoming_end_now());

        n.on_propose_end_now(Some(&r1), r1.clone());
        assert_eq!(
            n.accept_end_now(Some(&r1)).unwrap(),
            Message::AcceptEndNow { round_id: r1.clone() }
        );
        assert_eq!(n.accept_end_now(Some(&r1)), Err(NegotiationError::NothingPending));
    }

    #[test]
    fn test_clear() {
        let mut n = NegotiationManager::new();
        let r1 = rid("r1");
        n.propose_end_now(Some(&r1)).unwrap();
        n.on_propose_end_change(Some(&r1), r1.clone(), NOW);
        n.clear();
        assert!(!n.has_outgoing_end_now());
        assert!(n.incoming_end_change().is_none());
    }
}
