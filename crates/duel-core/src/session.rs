//! Session controller: which peer owns which role for one connection.
//!
//! The host (channel initiator) picks the pairing and sends `assignRoles`,
//! re-sending on a fixed interval until the guest acknowledges or the
//! attempt budget runs out. The caller is responsible for:
//! - Calling `poll_retry()` periodically
//! - Sending any message it returns
//! - Reporting channel open/close transitions

use crate::clock::millis;
use crate::ids::SessionId;
use crate::protocol::Message;
use crate::role::{Orientation, Role, RolePair};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Role already locked as {locked}")]
    RoleAlreadyLocked { locked: Role, requested: Role },

    #[error("No role locked")]
    RoleNotLocked,

    #[error("Channel is not open")]
    ChannelNotOpen,

    #[error("Only the host assigns roles")]
    NotHost,
}

/// Configuration for `assignRoles` re-sends.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay between sends (default: 2s)
    pub interval: Duration,
    /// Total sends including the first (default: 3)
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

/// The host/guest pairing agreed for the current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: SessionId,
    pub roles: RolePair,
    /// Host: the guest acknowledged this session id. Guest: we acknowledged it.
    pub confirmed: bool,
}

impl Session {
    fn assign_message(&self) -> Message {
        Message::AssignRoles {
            session_id: self.session_id.clone(),
            host_role: self.roles.host_role,
            guest_role: self.roles.guest_role,
        }
    }
}

/// An unacknowledged `assignRoles` awaiting re-send.
#[derive(Debug, Clone)]
struct PendingAssign {
    /// Sends so far, including the first
    attempts: u32,
    next_at: u64,
}

/// What the retry timer wants done.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPoll {
    /// Nothing due
    Idle,
    /// Send this `assignRoles` again
    Resend(Message),
    /// Attempts used up without an ack; the session stays unconfirmed
    Exhausted(SessionId),
}

/// Result of adopting a role pairing from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Adoption {
    pub role: Role,
    /// Locally locked role before adoption
    pub previous: Option<Role>,
    /// Reply to send (guest acknowledging `assignRoles`)
    pub ack: Option<Message>,
}

impl Adoption {
    /// True if adoption replaced a different, locally chosen role.
    pub fn overridden(&self) -> bool {
        self.previous.is_some_and(|prev| prev != self.role)
    }
}

#[derive(Debug)]
pub struct SessionController {
    config: RetryConfig,
    locked_role: Option<Role>,
    session: Option<Session>,
    pending: Option<PendingAssign>,
}

impl SessionController {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            locked_role: None,
            session: None,
            pending: None,
        }
    }

    pub fn locked_role(&self) -> Option<Role> {
        self.locked_role
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_confirmed(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.confirmed)
    }

    pub fn is_retrying(&self) -> bool {
        self.pending.is_some()
    }

    /// Lock the local role.
    ///
    /// Returns `Ok(true)` when the role was newly locked and `Ok(false)` when
    /// the same role was already locked.
    pub fn lock_role(&mut self, role: Role) -> Result<bool, SessionError> {
        match self.locked_role {
            Some(locked) if locked == role => Ok(false),
            Some(locked) => Err(SessionError::RoleAlreadyLocked {
                locked,
                requested: role,
            }),
            None => {
                self.locked_role = Some(role);
                Ok(true)
            }
        }
    }

    /// Host only: create a fresh session from our locked role and return the
    /// first `assignRoles` to send. Arms the retry timer.
    pub fn assign_roles(
        &mut self,
        channel: Option<Orientation>,
        now_ms: u64,
    ) -> Result<Message, SessionError> {
        match channel {
            None => return Err(SessionError::ChannelNotOpen),
            Some(Orientation::Answerer) => return Err(SessionError::NotHost),
            Some(Orientation::Initiator) => {}
        }
        let host_role = self.locked_role.ok_or(SessionError::RoleNotLocked)?;

        let session = Session {
            session_id: SessionId::generate(),
            roles: RolePair::from_host(host_role),
            confirmed: false,
        };
        let msg = session.assign_message();
        debug!("Assigning roles for session {}", session.session_id);

        self.session = Some(session);
        self.pending = Some(PendingAssign {
            attempts: 1,
            next_at: now_ms + millis(self.config.interval),
        });
        Ok(msg)
    }

    /// Service the `assignRoles` retry timer.
    pub fn poll_retry(&mut self, channel_open: bool, now_ms: u64) -> RetryPoll {
        let Some(pending) = self.pending.as_mut() else {
            return RetryPoll::Idle;
        };
        if !channel_open {
            self.pending = None;
            return RetryPoll::Idle;
        }
        if now_ms < pending.next_at {
            return RetryPoll::Idle;
        }

        let Some(session) = self.session.as_ref().filter(|s| !s.confirmed) else {
            self.pending = None;
            return RetryPoll::Idle;
        };

        if pending.attempts >= self.config.max_attempts {
            let session_id = session.session_id.clone();
            self.pending = None;
            return RetryPoll::Exhausted(session_id);
        }

        pending.attempts += 1;
        pending.next_at = now_ms + millis(self.config.interval);
        debug!(
            "Re-sending assignRoles for session {} (attempt {}/{})",
            session.session_id, pending.attempts, self.config.max_attempts
        );
        RetryPoll::Resend(session.assign_message())
    }

    /// Adopt an `assignRoles` from the peer as truth.
    ///
    /// The answerer acknowledges; an initiator receiving one (both sides
    /// think they are host) drops its own pending assignment.
    pub fn on_assign_roles(
        &mut self,
        session_id: SessionId,
        roles: RolePair,
        orientation: Orientation,
    ) -> Adoption {
        let role = roles.role_for(orientation);
        let previous = self.locked_role.replace(role);
        let is_guest = orientation == Orientation::Answerer;

        self.pending = None;
        self.session = Some(Session {
            session_id: session_id.clone(),
            roles,
            confirmed: is_guest,
        });

        let ack = is_guest.then(|| Message::AssignRolesAck {
            session_id,
            my_role: role,
        });
        Adoption {
            role,
            previous,
            ack,
        }
    }

    /// Adopt a pairing that arrived without a session id (on `start`).
    pub fn adopt_roles(&mut self, roles: RolePair, orientation: Orientation) -> Adoption {
        let role = roles.role_for(orientation);
        let previous = self.locked_role.replace(role);
        if let Some(session) = self.session.as_mut() {
            session.roles = roles;
        }
        Adoption {
            role,
            previous,
            ack: None,
        }
    }

    /// Host: mark the session confirmed if the ack is for it.
    ///
    /// Returns true if this ack confirmed the current session.
    pub fn on_ack(&mut self, session_id: &SessionId) -> bool {
        match self.session.as_mut() {
            Some(session) if &session.session_id == session_id => {
                self.pending = None;
                let newly = !session.confirmed;
                session.confirmed = true;
                newly
            }
            _ => {
                debug!("Ignoring stale assignRolesAck for session {}", session_id);
                false
            }
        }
    }

    /// Re-derive our role from the current session after a role-target violation.
    ///
    /// Returns the adoption if a session exists to derive from.
    pub fn resync(&mut self, orientation: Orientation) -> Option<Adoption> {
        let roles = self.session.as_ref()?.roles;
        let role = roles.role_for(orientation);
        let previous = self.locked_role.replace(role);
        Some(Adoption {
            role,
            previous,
            ack: None,
        })
    }

    /// Replace session state from a snapshot.
    ///
    /// `host_role` is the host's locked role as recorded in the snapshot.
    pub fn restore(
        &mut self,
        session_id: Option<SessionId>,
        host_role: Option<Role>,
        locked_role: Option<Role>,
        confirmed: bool,
    ) {
        self.pending = None;
        self.locked_role = locked_role;
        self.session = match (session_id, host_role) {
            (Some(session_id), Some(host_role)) => Some(Session {
                session_id,
                roles: RolePair::from_host(host_role),
                confirmed,
            }),
            _ => None,
        };
    }

    /// A new connection began. Answerers forget their lock and session;
    /// initiators keep the lock and will assign a fresh session.
    pub fn on_channel_opened(&mut self, orientation: Orientation) {
        self.pending = None;
        self.session = None;
        if orientation == Orientation::Answerer {
            self.locked_role = None;
        }
    }

    /// The channel closed: stop re-sending.
    pub fn on_channel_closed(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn controller() -> SessionController {
        SessionController::new(RetryConfig::default())
    }

    fn host_with_role(role: Role) -> (SessionController, SessionId) {
        let mut c = controller();
        c.lock_role(role).unwrap();
        let msg = c.assign_roles(Some(Orientation::Initiator), NOW).unwrap();
        let Message::AssignRoles { session_id, .. } = msg else {
            panic!("expected assignRoles");
        };
        (c, session_id)
    }

    // ==================== lock_role ====================

    #[test]
    fn test_lock_role_once() {
        let mut c = controller();
        assert_eq!(c.lock_role(Role::A), Ok(true));
        assert_eq!(c.lock_role(Role::A), Ok(false));
        assert_eq!(
            c.lock_role(Role::B),
            Err(SessionError::RoleAlreadyLocked {
                locked: Role::A,
                requested: Role::B
            })
        );
        assert_eq!(c.locked_role(), Some(Role::A));
    }

    #[test]
    fn test_answering_connection_clears_lock() {
        let mut c = controller();
        c.lock_role(Role::A).unwrap();
        c.on_channel_opened(Orientation::Answerer);
        assert_eq!(c.locked_role(), None);
        assert_eq!(c.lock_role(Role::B), Ok(true));
    }

    #[test]
    fn test_initiating_connection_keeps_lock() {
        let mut c = controller();
        c.lock_role(Role::A).unwrap();
        c.on_channel_opened(Orientation::Initiator);
        assert_eq!(c.locked_role(), Some(Role::A));
    }

    // ==================== assign_roles ====================

    #[test]
    fn test_assign_roles_preconditions() {
        let mut c = controller();
        assert_eq!(
            c.assign_roles(Some(Orientation::Initiator), NOW),
            Err(SessionError::RoleNotLocked)
        );
        c.lock_role(Role::A).unwrap();
        assert_eq!(c.assign_roles(None, NOW), Err(SessionError::ChannelNotOpen));
        assert_eq!(
            c.assign_roles(Some(Orientation::Answerer), NOW),
            Err(SessionError::NotHost)
        );
    }

    #[test]
    fn test_assign_roles_builds_complement() {
        let (c, session_id) = host_with_role(Role::A);
        let session = c.session().unwrap();
        assert_eq!(session.session_id, session_id);
        assert_eq!(session.roles.host_role, Role::A);
        assert_eq!(session.roles.guest_role, Role::B);
        assert!(!session.confirmed);
        assert!(c.is_retrying());
    }

    #[test]
    fn test_retry_at_most_three_sends() {
        let (mut c, session_id) = host_with_role(Role::A);

        assert_eq!(c.poll_retry(true, NOW + 1000), RetryPoll::Idle);
        assert!(matches!(c.poll_retry(true, NOW + 2000), RetryPoll::Resend(_)));
        assert!(matches!(c.poll_retry(true, NOW + 4000), RetryPoll::Resend(_)));
        // Three sends done; the next due poll gives up
        assert_eq!(
            c.poll_retry(true, NOW + 6000),
            RetryPoll::Exhausted(session_id)
        );
        assert_eq!(c.poll_retry(true, NOW + 8000), RetryPoll::Idle);
        assert!(!c.is_confirmed());
    }

    #[test]
    fn test_ack_stops_retries() {
        let (mut c, session_id) = host_with_role(Role::A);
        assert!(c.on_ack(&session_id));
        assert!(c.is_confirmed());
        assert_eq!(c.poll_retry(true, NOW + 2000), RetryPoll::Idle);
        // Duplicate ack is harmless
        assert!(!c.on_ack(&session_id));
    }

    #[test]
    fn test_stale_ack_ignored() {
        let (mut c, _) = host_with_role(Role::A);
        assert!(!c.on_ack(&"other-session".parse().unwrap()));
        assert!(!c.is_confirmed());
        assert!(c.is_retrying());
    }

    #[test]
    fn test_closed_channel_cancels_retries() {
        let (mut c, _) = host_with_role(Role::A);
        assert_eq!(c.poll_retry(false, NOW + 2000), RetryPoll::Idle);
        assert!(!c.is_retrying());
        assert_eq!(c.poll_retry(true, NOW + 4000), RetryPoll::Idle);
    }

    // ==================== on_assign_roles ====================

    #[test]
    fn test_guest_adopts_and_acks() {
        let mut c = controller();
        let adoption = c.on_assign_roles(
            "s1".parse().unwrap(),
            RolePair::from_host(Role::A),
            Orientation::Answerer,
        );
        assert_eq!(adoption.role, Role::B);
        assert!(!adoption.overridden());
        assert_eq!(
            adoption.ack,
            Some(Message::AssignRolesAck {
                session_id: "s1".parse().unwrap(),
                my_role: Role::B,
            })
        );
        assert_eq!(c.locked_role(), Some(Role::B));
    }

    #[test]
    fn test_guest_override_reported() {
        let mut c = controller();
        c.lock_role(Role::A).unwrap();
        let adoption = c.on_assign_roles(
            "s1".parse().unwrap(),
            RolePair::from_host(Role::A),
            Orientation::Answerer,
        );
        assert!(adoption.overridden());
        assert_eq!(adoption.previous, Some(Role::A));
        assert_eq!(c.locked_role(), Some(Role::B));
    }

    #[test]
    fn test_initiator_adopting_does_not_ack() {
        let (mut c, _) = host_with_role(Role::A);
        let adoption = c.on_assign_roles(
            "s2".parse().unwrap(),
            RolePair::from_host(Role::B),
            Orientation::Initiator,
        );
        assert_eq!(adoption.role, Role::B);
        assert!(adoption.ack.is_none());
        assert!(!c.is_retrying());
    }

    #[test]
    fn test_resync_rederives_from_session() {
        let mut c = controller();
        c.on_assign_roles(
            "s1".parse().unwrap(),
            RolePair::from_host(Role::A),
            Orientation::Answerer,
        );
        c.restore(Some("s1".parse().unwrap()), Some(Role::A), Some(Role::A), true);

        let adoption = c.resync(Orientation::Answerer).unwrap();
        assert_eq!(adoption.role, Role::B);
        assert!(adoption.overridden());
    }

    #[test]
    fn test_resync_without_session() {
        let mut c = controller();
        assert!(c.resync(Orientation::Answerer).is_none());
    }
}
