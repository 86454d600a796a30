//! Peer: the single authoritative state container for one side of a duel.
//!
//! Everything goes through [`Peer::dispatch`]: channel transitions, inbound
//! frames, timer ticks, and user actions. Each input runs to completion and
//! leaves behind:
//! - messages for the driver to send (`drain_outbox()`)
//! - events on the [`EventBus`]
//! - a freshly persisted snapshot if anything changed
//!
//! The driver is responsible for:
//! - Feeding `Input::Tick` at least once per tick interval
//! - Writing every drained message to the channel
//! - Reporting `ChannelOpened` / `ChannelClosed`

use crate::events::{EventBus, PeerEvent};
use crate::history::HistoryEntry;
use crate::ids::RoundId;
use crate::negotiation::{NegotiationError, NegotiationManager, Resolution};
use crate::notice::{Notice, NoticeBoard, NoticeLevel, ROLE_RESYNC_NOTICE};
use crate::protocol::Message;
use crate::role::{Orientation, Role, RolePair};
use crate::round::{Round, RoundError, RoundMachine, RoundState, TickOutcome, VoteAdmission};
use crate::session::{Adoption, RetryConfig, RetryPoll, Session, SessionController, SessionError};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::store::KeyValueStore;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration for a peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Round countdown granularity (default: 1s)
    pub tick_interval: Duration,
    /// `assignRoles` re-send policy
    pub retry: RetryConfig,
    /// How long a notice stays up (default: 4s)
    pub notice_ttl: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            retry: RetryConfig::default(),
            notice_ttl: Duration::from_secs(4),
        }
    }
}

/// Validation failures of user actions. Each is also posted as a notice.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("Role already locked as {locked}, cannot switch to {requested}")]
    RoleAlreadyLocked { locked: Role, requested: Role },

    #[error("Pick a role first")]
    RoleNotLocked,

    #[error("End time {end_time} is not in the future (now {now})")]
    EndTimeNotInFuture { end_time: u64, now: u64 },

    #[error("No active round")]
    NoActiveRound,

    #[error("Round is not running")]
    RoundNotRunning,

    #[error("Nothing pending to answer")]
    NothingPending,
}

impl From<RoundError> for ActionError {
    fn from(e: RoundError) -> Self {
        match e {
            RoundError::EndTimeNotInFuture { end_time, now } => {
                Self::EndTimeNotInFuture { end_time, now }
            }
            RoundError::NoRound => Self::NoActiveRound,
            RoundError::NotRunning => Self::RoundNotRunning,
        }
    }
}

impl From<NegotiationError> for ActionError {
    fn from(e: NegotiationError) -> Self {
        match e {
            NegotiationError::NoActiveRound => Self::NoActiveRound,
            NegotiationError::EndTimeNotInFuture { proposed, now } => Self::EndTimeNotInFuture {
                end_time: proposed,
                now,
            },
            NegotiationError::NothingPending => Self::NothingPending,
        }
    }
}

/// Something the local user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    LockRole(Role),
    StartRound { end_time: u64 },
    Vote { elapsed_seconds: u64 },
    ProposeEndChange { end_time: u64 },
    AcceptEndChange,
    RejectEndChange,
    ProposeEndNow,
    AcceptEndNow,
    RejectEndNow,
    /// Drop a finished round from history and storage
    RemoveHistory(RoundId),
}

/// Everything that can happen to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    ChannelOpened(Orientation),
    ChannelClosed,
    /// One raw frame from the channel
    Received(Vec<u8>),
    Tick,
    Action(Action),
}

pub struct Peer<S: KeyValueStore> {
    orientation: Orientation,
    channel_open: bool,
    session: SessionController,
    round: RoundMachine,
    negotiation: NegotiationManager,
    snapshots: SnapshotStore<S>,
    notices: NoticeBoard,
    events: Arc<EventBus>,
    outbox: VecDeque<Message>,
    /// Local state changed since the last persist
    dirty: bool,
    /// Host already pushed its snapshot on this connection
    snapshot_pushed: bool,
    last_snapshot: Option<Snapshot>,
}

impl<S: KeyValueStore> Peer<S> {
    /// Create a peer on the given side of the channel, persisting into `store`.
    pub fn new(orientation: Orientation, store: S, config: PeerConfig) -> Self {
        Self {
            orientation,
            channel_open: false,
            session: SessionController::new(config.retry),
            round: RoundMachine::new(config.tick_interval),
            negotiation: NegotiationManager::new(),
            snapshots: SnapshotStore::new(store),
            notices: NoticeBoard::new(config.notice_ttl),
            events: Arc::new(EventBus::new()),
            outbox: VecDeque::new(),
            dirty: false,
            snapshot_pushed: false,
            last_snapshot: None,
        }
    }

    // ==================== Accessors ====================

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel_open
    }

    pub fn locked_role(&self) -> Option<Role> {
        self.session.locked_role()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.session()
    }

    pub fn round(&self) -> Option<&Round> {
        self.round.round()
    }

    pub fn round_state(&self) -> RoundState {
        self.round.state()
    }

    pub fn negotiation(&self) -> &NegotiationManager {
        &self.negotiation
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notices.current()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.snapshots.history().entries()
    }

    /// The snapshot most recently persisted or adopted.
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn store(&self) -> &S {
        self.snapshots.store()
    }

    /// Tear down the peer, handing back its store (e.g. to simulate a restart).
    pub fn into_store(self) -> S {
        self.snapshots.into_inner()
    }

    /// Whole seconds since the current round started.
    pub fn elapsed_seconds(&self, now_ms: u64) -> u64 {
        self.round.elapsed_seconds(now_ms)
    }

    pub fn remaining_seconds(&self, now_ms: u64) -> u64 {
        self.round.remaining_seconds(now_ms)
    }

    /// Take every message queued for the channel, oldest first.
    pub fn drain_outbox(&mut self) -> Vec<Message> {
        self.outbox.drain(..).collect()
    }

    // ==================== Recovery ====================

    /// Restore the round named by `selector` (or the last one touched) from
    /// the store, as after a restart.
    ///
    /// Returns the restored round id, `None` when nothing was resumable.
    pub fn resume(&mut self, selector: Option<&RoundId>, now_ms: u64) -> Option<RoundId> {
        let snapshot = self.snapshots.resume_candidate(selector, now_ms)?;
        let round_id = snapshot.round_id.clone();

        self.orientation = if snapshot.is_host {
            Orientation::Initiator
        } else {
            Orientation::Answerer
        };
        self.round.restore(snapshot.round(), now_ms);
        self.negotiation.clear();
        self.session.restore(
            snapshot.session_id.clone(),
            snapshot.host_role(),
            snapshot.locked_role,
            false,
        );
        self.snapshots.hydrate(&snapshot);

        info!(
            "Resumed round {} at v{} ({:?})",
            round_id, snapshot.version, snapshot.state
        );
        self.events.emit(PeerEvent::SnapshotApplied {
            round_id: round_id.clone(),
            version: snapshot.version,
        });
        self.last_snapshot = Some(snapshot);
        Some(round_id)
    }

    // ==================== Dispatch ====================

    /// Apply one input.
    ///
    /// Only user actions can fail; everything else is handled where it is
    /// detected and reported through events and notices.
    pub fn dispatch(&mut self, input: Input, now_ms: u64) -> Result<(), ActionError> {
        let result = match input {
            Input::ChannelOpened(orientation) => {
                self.on_channel_opened(orientation, now_ms);
                Ok(())
            }
            Input::ChannelClosed => {
                self.on_channel_closed();
                Ok(())
            }
            Input::Received(data) => {
                self.on_received(&data, now_ms);
                Ok(())
            }
            Input::Tick => {
                self.on_tick(now_ms);
                Ok(())
            }
            Input::Action(action) => self.perform(action, now_ms),
        };

        if let Err(e) = &result {
            debug!("Action rejected: {}", e);
            self.notify(NoticeLevel::Error, e.to_string(), now_ms);
        }

        self.persist_if_dirty(now_ms);
        self.push_snapshot_if_due(now_ms);
        result
    }

    fn on_channel_opened(&mut self, orientation: Orientation, now_ms: u64) {
        info!("Channel opened as {:?}", orientation);
        self.orientation = orientation;
        self.channel_open = true;
        self.snapshot_pushed = false;
        self.session.on_channel_opened(orientation);

        if orientation.is_host() && self.session.locked_role().is_some() {
            self.assign_roles(now_ms);
        }
    }

    fn on_channel_closed(&mut self) {
        info!("Channel closed");
        self.channel_open = false;
        self.session.on_channel_closed();
    }

    fn on_tick(&mut self, now_ms: u64) {
        match self.round.poll(now_ms) {
            Some(TickOutcome::Remaining(remaining_ms)) => {
                if let Some(round_id) = self.round.round_id().cloned() {
                    self.events.emit(PeerEvent::Tick {
                        round_id,
                        remaining_ms,
                    });
                }
            }
            Some(TickOutcome::Ended) => self.round_ended(),
            None => {}
        }

        match self.session.poll_retry(self.channel_open, now_ms) {
            RetryPoll::Idle => {}
            RetryPoll::Resend(msg) => self.send(msg, now_ms),
            RetryPoll::Exhausted(session_id) => {
                info!("Session {} unconfirmed after retries", session_id);
                self.events
                    .emit(PeerEvent::SessionUnconfirmed { session_id });
            }
        }

        if self.notices.poll(now_ms) {
            self.events.emit(PeerEvent::NoticeCleared);
        }
    }

    // ==================== User actions ====================

    fn perform(&mut self, action: Action, now_ms: u64) -> Result<(), ActionError> {
        match action {
            Action::LockRole(role) => {
                let newly = self.session.lock_role(role).map_err(|e| match e {
                    SessionError::RoleAlreadyLocked { locked, requested } => {
                        ActionError::RoleAlreadyLocked { locked, requested }
                    }
                    _ => ActionError::RoleNotLocked,
                })?;
                if newly {
                    info!("Locked role {}", role);
                    self.events.emit(PeerEvent::RoleLocked { role });
                    self.dirty = true;
                    if self.orientation.is_host() && self.channel_open {
                        self.assign_roles(now_ms);
                    }
                }
            }

            Action::StartRound { end_time } => {
                let round = self.round.start(end_time, now_ms)?;
                let round_id = round.round_id.clone();
                let start_time = round.start_time;
                info!("Started round {} ending at {}", round_id, end_time);

                self.negotiation.clear();
                self.dirty = true;
                self.events.emit(PeerEvent::RoundStarted {
                    round_id: round_id.clone(),
                    start_time,
                    end_time,
                });
                let roles = self.session.session().map(|s| s.roles);
                self.send(
                    Message::Start {
                        round_id,
                        end_time,
                        roles,
                    },
                    now_ms,
                );
            }

            Action::Vote { elapsed_seconds } => {
                let voter = self.session.locked_role().ok_or(ActionError::RoleNotLocked)?;
                let vote = self.round.record_local_vote(voter, elapsed_seconds)?;
                let Some(round) = self.round.round() else {
                    return Err(ActionError::NoActiveRound);
                };
                let round_id = round.round_id.clone();
                let score_by_role = round.score_by_role;

                self.dirty = true;
                self.events.emit(PeerEvent::VoteRecorded {
                    round_id: round_id.clone(),
                    vote,
                    score_by_role,
                });
                self.send(
                    Message::Vote {
                        round_id,
                        target: vote.role,
                        elapsed_seconds: vote.elapsed_seconds,
                    },
                    now_ms,
                );
            }

            Action::ProposeEndChange { end_time } => {
                let current = self.running_round_id();
                let msg = self
                    .negotiation
                    .propose_end_change(current.as_ref(), end_time, now_ms)?;
                self.send(msg, now_ms);
            }

            Action::AcceptEndChange => {
                let current = self.running_round_id();
                let (msg, end_time) = self.negotiation.accept_end_change(current.as_ref())?;
                self.apply_end_time(end_time);
                self.send(msg, now_ms);
            }

            Action::RejectEndChange => {
                let current = self.running_round_id();
                let msg = self.negotiation.reject_end_change(current.as_ref())?;
                self.send(msg, now_ms);
            }

            Action::ProposeEndNow => {
                let current = self.running_round_id();
                let msg = self.negotiation.propose_end_now(current.as_ref())?;
                self.send(msg, now_ms);
            }

            Action::AcceptEndNow => {
                let current = self.running_round_id();
                let msg = self.negotiation.accept_end_now(current.as_ref())?;
                self.end_round_now(now_ms);
                self.send(msg, now_ms);
            }

            Action::RejectEndNow => {
                let current = self.running_round_id();
                let msg = self.negotiation.reject_end_now(current.as_ref())?;
                self.send(msg, now_ms);
            }

            Action::RemoveHistory(round_id) => {
                if self.snapshots.remove_round(&round_id) {
                    info!("Removed round {} from history", round_id);
                } else {
                    debug!("Nothing stored for round {}", round_id);
                }
            }
        }
        Ok(())
    }

    // ==================== Inbound messages ====================

    fn on_received(&mut self, data: &[u8], now_ms: u64) {
        let msg = match Message::from_json(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                return;
            }
        };
        debug!("Received {}", msg.message_type());
        self.events.emit(PeerEvent::MessageReceived {
            message_type: msg.message_type(),
            size: data.len(),
        });

        match msg {
            Message::Start {
                round_id,
                end_time,
                roles,
            } => self.on_start(round_id, end_time, roles, now_ms),

            Message::Vote {
                round_id,
                target,
                elapsed_seconds,
            } => self.on_vote(round_id, target, elapsed_seconds, now_ms),

            Message::ProposeEndChange {
                round_id,
                proposed_end_time,
            } => {
                let current = self.running_round_id();
                let resolution =
                    self.negotiation
                        .on_propose_end_change(current.as_ref(), round_id.clone(), proposed_end_time);
                if resolution == Resolution::Pending {
                    self.events.emit(PeerEvent::EndChangeProposed {
                        round_id,
                        proposed_end_time,
                    });
                    self.notify(NoticeLevel::Info, "peer proposes a new end time", now_ms);
                }
            }

            Message::AcceptEndChange {
                round_id,
                proposed_end_time,
            } => {
                let current = self.running_round_id();
                let resolution =
                    self.negotiation
                        .on_accept_end_change(current.as_ref(), round_id, proposed_end_time);
                if let Resolution::ApplyEndTime(end_time) = resolution {
                    self.apply_end_time(end_time);
                }
            }

            Message::RejectEndChange {
                round_id,
                proposed_end_time,
            } => {
                let current = self.running_round_id();
                let resolution = self.negotiation.on_reject_end_change(
                    current.as_ref(),
                    round_id.clone(),
                    proposed_end_time,
                );
                self.on_declined(resolution, round_id, now_ms);
            }

            Message::ProposeEndNow { round_id } => {
                let current = self.running_round_id();
                let resolution = self
                    .negotiation
                    .on_propose_end_now(current.as_ref(), round_id.clone());
                if resolution == Resolution::Pending {
                    self.events.emit(PeerEvent::EndNowProposed { round_id });
                    self.notify(NoticeLevel::Info, "peer proposes ending now", now_ms);
                }
            }

            Message::AcceptEndNow { round_id } => {
                let current = self.running_round_id();
                if self.negotiation.on_accept_end_now(current.as_ref(), round_id) == Resolution::EndNow
                {
                    self.end_round_now(now_ms);
                }
            }

            Message::RejectEndNow { round_id } => {
                let current = self.running_round_id();
                let resolution = self
                    .negotiation
                    .on_reject_end_now(current.as_ref(), round_id.clone());
                self.on_declined(resolution, round_id, now_ms);
            }

            Message::AssignRoles {
                session_id,
                host_role,
                guest_role,
            } => {
                let roles = RolePair {
                    host_role,
                    guest_role,
                };
                if !roles.is_complementary() {
                    warn!("Dropping assignRoles with identical roles {}", host_role);
                    return;
                }
                let adoption =
                    self.session
                        .on_assign_roles(session_id.clone(), roles, self.orientation);
                info!("Adopted role {} for session {}", adoption.role, session_id);
                self.report_adoption(adoption, now_ms);
                if self.session.is_confirmed() {
                    self.events.emit(PeerEvent::SessionConfirmed { session_id });
                }
                self.dirty = true;
            }

            Message::AssignRolesAck { session_id, my_role } => {
                if self.session.on_ack(&session_id) {
                    let expected = self.session.session().map(|s| s.roles.guest_role);
                    if expected != Some(my_role) {
                        warn!(
                            "Guest acknowledged session {} as {}, expected {:?}",
                            session_id, my_role, expected
                        );
                    }
                    info!("Session {} confirmed", session_id);
                    self.events.emit(PeerEvent::SessionConfirmed { session_id });
                }
            }

            Message::StateSnapshot { payload, .. } => self.on_snapshot(payload, now_ms),
        }
    }

    /// Every valid `start` begins afresh, even one naming the current round.
    fn on_start(&mut self, round_id: RoundId, end_time: u64, roles: Option<RolePair>, now_ms: u64) {
        let start_time = match self.round.adopt_start(round_id.clone(), end_time, now_ms) {
            Ok(round) => round.start_time,
            Err(e) => {
                warn!("Rejecting start for round {}: {}", round_id, e);
                return;
            }
        };
        info!("Peer started round {} ending at {}", round_id, end_time);
        self.negotiation.clear();
        self.dirty = true;

        if let Some(roles) = roles.filter(RolePair::is_complementary) {
            let adoption = self.session.adopt_roles(roles, self.orientation);
            self.report_adoption(adoption, now_ms);
        }

        self.events.emit(PeerEvent::RoundStarted {
            round_id,
            start_time,
            end_time,
        });
    }

    fn on_vote(&mut self, round_id: RoundId, target: Role, elapsed_seconds: u64, now_ms: u64) {
        let local_role = self.session.locked_role();
        match self
            .round
            .apply_remote_vote(&round_id, target, elapsed_seconds, local_role)
        {
            VoteAdmission::Applied(vote) => {
                let score_by_role = self
                    .round
                    .round()
                    .map(|r| r.score_by_role)
                    .unwrap_or_default();
                self.dirty = true;
                self.events.emit(PeerEvent::VoteRecorded {
                    round_id,
                    vote,
                    score_by_role,
                });
            }
            VoteAdmission::StaleRound => {
                debug!("Ignoring vote for round {}", round_id);
            }
            VoteAdmission::WrongTarget { expected, got } => {
                warn!(
                    "Vote targets {} but our role is {:?}; resyncing roles",
                    got, expected
                );
                self.resync_roles(now_ms);
            }
        }
    }

    fn on_declined(&mut self, resolution: Resolution, round_id: RoundId, now_ms: u64) {
        if resolution == Resolution::Declined {
            self.events.emit(PeerEvent::ProposalDeclined { round_id });
            self.notify(NoticeLevel::Info, "peer declined the proposal", now_ms);
        }
    }

    /// Adopt or ignore a snapshot pushed by the host, wholesale.
    fn on_snapshot(&mut self, snapshot: Snapshot, now_ms: u64) {
        if self.orientation.is_host() {
            warn!("Host ignoring pushed snapshot for round {}", snapshot.round_id);
            return;
        }
        if let Some(current) = self.round.round() {
            if current.round_id != snapshot.round_id && current.is_running() {
                warn!(
                    "Dropping snapshot for round {} while running round {}",
                    snapshot.round_id, current.round_id
                );
                self.events.emit(PeerEvent::SnapshotRejected {
                    round_id: snapshot.round_id,
                    current: current.round_id.clone(),
                });
                return;
            }
        }

        self.round.restore(snapshot.round(), now_ms);
        self.negotiation.clear();

        if let Some(host_role) = snapshot.host_role() {
            let roles = RolePair::from_host(host_role);
            let confirmed = self.session.session().is_some_and(|s| {
                s.confirmed && Some(&s.session_id) == snapshot.session_id.as_ref()
            });
            let previous = self.session.locked_role();
            let role = roles.role_for(self.orientation);
            self.session
                .restore(snapshot.session_id.clone(), Some(host_role), Some(role), confirmed);
            self.report_adoption(
                Adoption {
                    role,
                    previous,
                    ack: None,
                },
                now_ms,
            );
        }

        let local = Snapshot {
            is_host: false,
            locked_role: self.session.locked_role(),
            ..snapshot
        };
        self.snapshots.hydrate(&local);
        info!(
            "Adopted snapshot for round {} at v{}",
            local.round_id, local.version
        );
        self.events.emit(PeerEvent::SnapshotApplied {
            round_id: local.round_id.clone(),
            version: local.version,
        });
        self.last_snapshot = Some(local);
    }

    // ==================== Helpers ====================

    fn running_round_id(&self) -> Option<RoundId> {
        self.round
            .round()
            .filter(|r| r.is_running())
            .map(|r| r.round_id.clone())
    }

    fn assign_roles(&mut self, now_ms: u64) {
        let channel = self.channel_open.then_some(self.orientation);
        match self.session.assign_roles(channel, now_ms) {
            Ok(msg) => self.send(msg, now_ms),
            Err(e) => debug!("Not assigning roles: {}", e),
        }
    }

    /// A vote named the wrong role: one side has a stale pairing.
    fn resync_roles(&mut self, now_ms: u64) {
        if self.orientation.is_host() {
            self.assign_roles(now_ms);
        } else if let Some(adoption) = self.session.resync(self.orientation) {
            self.report_adoption(adoption, now_ms);
            self.dirty = true;
        }
        self.notify(NoticeLevel::Error, ROLE_RESYNC_NOTICE, now_ms);
    }

    fn report_adoption(&mut self, adoption: Adoption, now_ms: u64) {
        if let Some(ack) = adoption.ack.clone() {
            self.send(ack, now_ms);
        }
        match adoption.previous {
            Some(previous) if previous != adoption.role => {
                info!("Role overridden by peer: {} -> {}", previous, adoption.role);
                self.events.emit(PeerEvent::RoleOverridden {
                    previous,
                    role: adoption.role,
                });
                self.notify(
                    NoticeLevel::Info,
                    format!("role changed to {} by peer", adoption.role),
                    now_ms,
                );
            }
            Some(_) => {}
            None => self.events.emit(PeerEvent::RoleLocked {
                role: adoption.role,
            }),
        }
    }

    fn apply_end_time(&mut self, end_time: u64) {
        match self.round.set_end_time(end_time) {
            Ok(()) => {
                if let Some(round) = self.round.round() {
                    info!("Round {} now ends at {}", round.round_id, round.end_time);
                    self.events.emit(PeerEvent::EndTimeChanged {
                        round_id: round.round_id.clone(),
                        end_time: round.end_time,
                    });
                }
                self.dirty = true;
            }
            Err(e) => warn!("Cannot change end time: {}", e),
        }
    }

    fn end_round_now(&mut self, now_ms: u64) {
        if self.round.end_now(now_ms) {
            self.round_ended();
        }
    }

    fn round_ended(&mut self) {
        self.negotiation.clear();
        self.dirty = true;
        if let Some(round) = self.round.round() {
            info!(
                "Round {} ended: A={} B={}",
                round.round_id,
                round.score_by_role.get(Role::A),
                round.score_by_role.get(Role::B)
            );
            self.events.emit(PeerEvent::RoundEnded {
                round_id: round.round_id.clone(),
                end_time: round.end_time,
                score_by_role: round.score_by_role,
            });
        }
    }

    fn notify(&mut self, level: NoticeLevel, text: impl Into<String>, now_ms: u64) {
        let notice = self.notices.post(level, text, now_ms);
        self.events.emit(PeerEvent::Notice(notice));
    }

    /// Queue a message. With no open channel the local effect stands and the
    /// user is told the peer did not get it.
    fn send(&mut self, msg: Message, now_ms: u64) {
        let message_type = msg.message_type();
        if !self.channel_open {
            warn!("Not connected, {} not sent", message_type);
            self.events.emit(PeerEvent::SendFailed { message_type });
            self.notify(
                NoticeLevel::Error,
                format!("not connected: {message_type} not sent"),
                now_ms,
            );
            return;
        }
        self.events.emit(PeerEvent::MessageSent {
            message_type,
            size: msg.to_json().len(),
        });
        self.outbox.push_back(msg);
    }

    fn persist_if_dirty(&mut self, now_ms: u64) {
        if !std::mem::take(&mut self.dirty) {
            return;
        }
        let Some(round) = self.round.round() else {
            return;
        };
        let draft = Snapshot::capture(
            round,
            self.session.session().map(|s| &s.session_id),
            self.orientation.is_host(),
            self.session.locked_role(),
        );
        self.last_snapshot = Some(self.snapshots.persist(draft, now_ms));
    }

    /// Host: push our state once per connection when there is a round to
    /// share. While an `assignRoles` is still awaiting its ack the push
    /// waits, so it carries the confirmed session; an unconfirmed or
    /// roleless session does not hold it back.
    fn push_snapshot_if_due(&mut self, now_ms: u64) {
        if self.snapshot_pushed
            || !self.orientation.is_host()
            || !self.channel_open
            || self.session.is_retrying()
        {
            return;
        }
        let Some(round_id) = self.round.round_id().cloned() else {
            return;
        };

        // Fresh persist so the payload carries the current session
        self.dirty = true;
        self.persist_if_dirty(now_ms);
        let Some(payload) = self.last_snapshot.clone() else {
            return;
        };

        debug!("Pushing snapshot for round {} v{}", round_id, payload.version);
        self.snapshot_pushed = true;
        self.send(Message::StateSnapshot { round_id, payload }, now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::sync::Mutex;

    const NOW: u64 = 1_700_000_000_000;

    fn peer(orientation: Orientation) -> Peer<InMemoryStore> {
        Peer::new(orientation, InMemoryStore::new(), PeerConfig::default())
    }

    fn record(peer: &Peer<InMemoryStore>) -> (Arc<Mutex<Vec<PeerEvent>>>, crate::events::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = peer.events().subscribe(move |e| sink.lock().unwrap().push(e));
        (seen, sub)
    }

    #[test]
    fn test_lock_role_twice_fails() {
        let mut p = peer(Orientation::Initiator);
        p.dispatch(Input::Action(Action::LockRole(Role::A)), NOW).unwrap();
        assert_eq!(
            p.dispatch(Input::Action(Action::LockRole(Role::B)), NOW),
            Err(ActionError::RoleAlreadyLocked {
                locked: Role::A,
                requested: Role::B
            })
        );
        assert_eq!(p.notice().unwrap().level, NoticeLevel::Error);
    }

    #[test]
    fn test_host_assigns_roles_when_channel_opens() {
        let mut p = peer(Orientation::Initiator);
        p.dispatch(Input::Action(Action::LockRole(Role::A)), NOW).unwrap();
        assert!(p.drain_outbox().is_empty());

        p.dispatch(Input::ChannelOpened(Orientation::Initiator), NOW).unwrap();
        let out = p.drain_outbox();
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out[0],
            Message::AssignRoles { host_role: Role::A, guest_role: Role::B, .. }
        ));
    }

    #[test]
    fn test_host_assigns_roles_when_role_locked_later() {
        let mut p = peer(Orientation::Initiator);
        p.dispatch(Input::ChannelOpened(Orientation::Initiator), NOW).unwrap();
        assert!(p.drain_outbox().is_empty());

        p.dispatch(Input::Action(Action::LockRole(Role::B)), NOW).unwrap();
        assert_eq!(p.drain_outbox()[0].message_type(), "assignRoles");
    }

    #[test]
    fn test_start_rejects_past_end_time() {
        let mut p = peer(Orientation::Initiator);
        assert_eq!(
            p.dispatch(Input::Action(Action::StartRound { end_time: NOW }), NOW),
            Err(ActionError::EndTimeNotInFuture { end_time: NOW, now: NOW })
        );
        assert!(p.round().is_none());
        assert!(p.store().is_empty());
    }

    #[test]
    fn test_offline_start_applies_locally_and_reports() {
        let mut p = peer(Orientation::Initiator);
        let (seen, _sub) = record(&p);

        p.dispatch(Input::Action(Action::StartRound { end_time: NOW + 60_000 }), NOW)
            .unwrap();

        assert_eq!(p.round_state(), RoundState::Running);
        assert!(p.drain_outbox().is_empty());
        assert_eq!(p.notice().unwrap().text, "not connected: start not sent");
        assert!(seen
            .lock()
            .unwrap()
            .contains(&PeerEvent::SendFailed { message_type: "start" }));
        assert_eq!(p.last_snapshot().unwrap().version, 1);
    }

    #[test]
    fn test_vote_requires_role() {
        let mut p = peer(Orientation::Initiator);
        p.dispatch(Input::Action(Action::StartRound { end_time: NOW + 60_000 }), NOW)
            .unwrap();
        assert_eq!(
            p.dispatch(Input::Action(Action::Vote { elapsed_seconds: 1 }), NOW),
            Err(ActionError::RoleNotLocked)
        );
    }

    #[test]
    fn test_tick_ends_round_and_persists() {
        let mut p = peer(Orientation::Initiator);
        p.dispatch(Input::Action(Action::StartRound { end_time: NOW + 2000 }), NOW)
            .unwrap();
        p.dispatch(Input::Tick, NOW + 1000).unwrap();
        assert_eq!(p.round_state(), RoundState::Running);
        p.dispatch(Input::Tick, NOW + 2000).unwrap();

        assert_eq!(p.round_state(), RoundState::Ended);
        assert_eq!(p.last_snapshot().unwrap().version, 2);
        assert_eq!(p.history().len(), 1);
    }

    #[test]
    fn test_notice_auto_clears() {
        let mut p = peer(Orientation::Initiator);
        let _ = p.dispatch(Input::Action(Action::AcceptEndNow), NOW);
        assert!(p.notice().is_some());
        p.dispatch(Input::Tick, NOW + 4000).unwrap();
        assert!(p.notice().is_none());
    }

    #[test]
    fn test_malformed_frame_dropped() {
        let mut p = peer(Orientation::Answerer);
        p.dispatch(Input::ChannelOpened(Orientation::Answerer), NOW).unwrap();
        p.dispatch(Input::Received(b"{\"type\":\"nope\"}".to_vec()), NOW)
            .unwrap();
        assert!(p.round().is_none());
        assert!(p.notice().is_none());
    }

    #[test]
    fn test_remove_history() {
        let mut p = peer(Orientation::Initiator);
        p.dispatch(Input::Action(Action::StartRound { end_time: NOW + 1000 }), NOW)
            .unwrap();
        p.dispatch(Input::Tick, NOW + 1000).unwrap();
        let round_id = p.round().unwrap().round_id.clone();
        assert_eq!(p.history().len(), 1);

        p.dispatch(Input::Action(Action::RemoveHistory(round_id)), NOW + 2000)
            .unwrap();
        assert!(p.history().is_empty());
    }
}
