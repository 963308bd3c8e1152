//! Typed error surface shared by every collaboration component.
//!
//! Validation errors are returned synchronously and are never partially
//! applied. `TransportUnavailable` is the only kind that originates from an
//! external collaborator (durable store or blob store).

use crate::permissions::Capability;
use crate::session::SessionStatus;
use crate::{ActionId, GroupId, SessionId, UserId};

/// Errors produced by the collaboration engine.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabError {
    /// No session with this id is loaded or persisted.
    SessionNotFound(SessionId),
    /// `current_participants == max_participants`.
    SessionFull { session_id: SessionId, max_participants: u32 },
    /// The caller lacks a capability or is not the owner of the target.
    PermissionDenied { user_id: UserId, reason: String },
    /// Malformed session configuration or settings.
    InvalidConfig(String),
    /// `approved_by` was already set on this action.
    AlreadyApproved { action_id: ActionId, approved_by: UserId },
    /// Auto-assignment asked for larger groups than there are online members.
    InsufficientMembers { requested: usize, available: usize },
    /// Durable store or object store unreachable.
    TransportUnavailable(String),
    /// Session has been completed and accepts no further mutation.
    SessionClosed(SessionId),
    /// Session is paused; durable actions are rejected until resumed.
    SessionPaused(SessionId),
    /// The user is not a member of the session.
    MemberNotFound { session_id: SessionId, user_id: UserId },
    /// No action with this id in the session log.
    ActionNotFound(ActionId),
    /// Action payload failed boundary validation.
    InvalidAction(String),
    /// `reverted_at` was already set on this action.
    AlreadyReverted(ActionId),
    /// Approval was requested on an action that does not require it.
    ApprovalNotRequired(ActionId),
    /// The session already has a leader.
    LeaderConflict { session_id: SessionId, leader: UserId },
    /// Turn-based session and the caller does not hold the turn.
    NotYourTurn { user_id: UserId, holder: Option<UserId> },
    /// No breakout group with this id.
    GroupNotFound(GroupId),
}

impl CollabError {
    /// Shorthand for a missing capability.
    pub fn missing_capability(user_id: UserId, capability: Capability) -> Self {
        CollabError::PermissionDenied {
            user_id,
            reason: format!("missing capability {}", capability.as_str()),
        }
    }

    pub fn session_inactive(session_id: SessionId, status: SessionStatus) -> Option<Self> {
        match status {
            SessionStatus::Completed => Some(CollabError::SessionClosed(session_id)),
            SessionStatus::Paused => Some(CollabError::SessionPaused(session_id)),
            SessionStatus::Pending | SessionStatus::Active => None,
        }
    }

    /// Stable snake_case tag used on the wire so clients can branch on it.
    pub fn kind(&self) -> &'static str {
        match self {
            CollabError::SessionNotFound(_) => "session_not_found",
            CollabError::SessionFull { .. } => "session_full",
            CollabError::PermissionDenied { .. } => "permission_denied",
            CollabError::InvalidConfig(_) => "invalid_config",
            CollabError::AlreadyApproved { .. } => "already_approved",
            CollabError::InsufficientMembers { .. } => "insufficient_members",
            CollabError::TransportUnavailable(_) => "transport_unavailable",
            CollabError::SessionClosed(_) => "session_closed",
            CollabError::SessionPaused(_) => "session_paused",
            CollabError::MemberNotFound { .. } => "member_not_found",
            CollabError::ActionNotFound(_) => "action_not_found",
            CollabError::InvalidAction(_) => "invalid_action",
            CollabError::AlreadyReverted(_) => "already_reverted",
            CollabError::ApprovalNotRequired(_) => "approval_not_required",
            CollabError::LeaderConflict { .. } => "leader_conflict",
            CollabError::NotYourTurn { .. } => "not_your_turn",
            CollabError::GroupNotFound(_) => "group_not_found",
        }
    }
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollabError::SessionNotFound(id) => write!(f, "Session not found: {id}"),
            CollabError::SessionFull { session_id, max_participants } => {
                write!(f, "Session {session_id} is full ({max_participants} participants)")
            }
            CollabError::PermissionDenied { user_id, reason } => {
                write!(f, "Permission denied for {user_id}: {reason}")
            }
            CollabError::InvalidConfig(e) => write!(f, "Invalid config: {e}"),
            CollabError::AlreadyApproved { action_id, approved_by } => {
                write!(f, "Action {action_id} already approved by {approved_by}")
            }
            CollabError::InsufficientMembers { requested, available } => write!(
                f,
                "Insufficient members: group size {requested} exceeds {available} online"
            ),
            CollabError::TransportUnavailable(e) => write!(f, "Transport unavailable: {e}"),
            CollabError::SessionClosed(id) => write!(f, "Session {id} is completed"),
            CollabError::SessionPaused(id) => write!(f, "Session {id} is paused"),
            CollabError::MemberNotFound { session_id, user_id } => {
                write!(f, "User {user_id} is not a member of session {session_id}")
            }
            CollabError::ActionNotFound(id) => write!(f, "Action not found: {id}"),
            CollabError::InvalidAction(e) => write!(f, "Invalid action: {e}"),
            CollabError::AlreadyReverted(id) => write!(f, "Action {id} already reverted"),
            CollabError::ApprovalNotRequired(id) => {
                write!(f, "Action {id} does not require approval")
            }
            CollabError::LeaderConflict { session_id, leader } => {
                write!(f, "Session {session_id} already led by {leader}")
            }
            CollabError::NotYourTurn { user_id, holder } => match holder {
                Some(h) => write!(f, "User {user_id} cannot act: turn held by {h}"),
                None => write!(f, "User {user_id} cannot act: no turn holder"),
            },
            CollabError::GroupNotFound(id) => write!(f, "Breakout group not found: {id}"),
        }
    }
}

impl std::error::Error for CollabError {}
