//! Events fanned out by a session hub.
//!
//! ```text
//!             durable (at-least-once, ordered)      ephemeral (at-most-once)
//!  ┌───────────────────────────────────────┐   ┌──────────────────────────┐
//!  │ action_received   member_joined       │   │ cursor_moved             │
//!  │ action_updated    member_left         │   │ tool_changed             │
//!  │ member_updated    presence_sync       │   │ voice_note_added         │
//!  │ session_updated   breakout_updated    │   │ annotation_added         │
//!  └───────────────────────────────────────┘   └──────────────────────────┘
//! ```
//!
//! Ephemeral events never enter the action log and carry no vector clock.

use serde::{Deserialize, Serialize};

use labsync_core::{CollaborativeAction, CursorPosition, Member, Session, UserId};

use crate::breakout::BreakoutGroup;

/// Identifies one subscription (one client connection) within a hub.
pub type ConnectionId = u64;

/// Why a member left the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Left,
    Kicked,
}

/// Live signals a member may broadcast without touching the action log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum EphemeralSignal {
    Cursor { position: CursorPosition },
    Tool { tool: Option<String> },
    /// Audio already uploaded to the blob store.
    VoiceNote { url: String, duration_ms: u64 },
    /// Annotation geometry already uploaded to the blob store.
    Annotation { shape: String, geometry_url: String },
}

/// Everything a subscriber can receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    ActionReceived { action: CollaborativeAction },
    /// `approved_by` or `reverted_at` was set on an earlier action.
    ActionUpdated { action: CollaborativeAction },
    MemberJoined { member: Member },
    MemberLeft { user_id: UserId, reason: LeaveReason },
    /// Role change, promotion or an online/offline flip.
    MemberUpdated { member: Member },
    /// Full state for a new or recovering subscriber.
    PresenceSync {
        session: Session,
        members: Vec<Member>,
        groups: Vec<BreakoutGroup>,
        last_sequence: u64,
    },
    SessionUpdated { session: Session },
    BreakoutUpdated { groups: Vec<BreakoutGroup> },
    CursorMoved { user_id: UserId, cursor: CursorPosition },
    ToolChanged { user_id: UserId, tool: Option<String> },
    VoiceNoteAdded { user_id: UserId, url: String, duration_ms: u64 },
    AnnotationAdded { user_id: UserId, shape: String, geometry_url: String },
}

impl HubEvent {
    pub fn from_signal(user_id: UserId, signal: EphemeralSignal) -> Self {
        match signal {
            EphemeralSignal::Cursor { position } => HubEvent::CursorMoved { user_id, cursor: position },
            EphemeralSignal::Tool { tool } => HubEvent::ToolChanged { user_id, tool },
            EphemeralSignal::VoiceNote { url, duration_ms } => {
                HubEvent::VoiceNoteAdded { user_id, url, duration_ms }
            }
            EphemeralSignal::Annotation { shape, geometry_url } => {
                HubEvent::AnnotationAdded { user_id, shape, geometry_url }
            }
        }
    }

    pub fn is_durable(&self) -> bool {
        !matches!(
            self,
            HubEvent::CursorMoved { .. }
                | HubEvent::ToolChanged { .. }
                | HubEvent::VoiceNoteAdded { .. }
                | HubEvent::AnnotationAdded { .. }
        )
    }

    /// Sequence number for new-action events, used for client dedup.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            HubEvent::ActionReceived { action } => Some(action.sequence),
            _ => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            HubEvent::ActionReceived { .. } => "action_received",
            HubEvent::ActionUpdated { .. } => "action_updated",
            HubEvent::MemberJoined { .. } => "member_joined",
            HubEvent::MemberLeft { .. } => "member_left",
            HubEvent::MemberUpdated { .. } => "member_updated",
            HubEvent::PresenceSync { .. } => "presence_sync",
            HubEvent::SessionUpdated { .. } => "session_updated",
            HubEvent::BreakoutUpdated { .. } => "breakout_updated",
            HubEvent::CursorMoved { .. } => "cursor_moved",
            HubEvent::ToolChanged { .. } => "tool_changed",
            HubEvent::VoiceNoteAdded { .. } => "voice_note_added",
            HubEvent::AnnotationAdded { .. } => "annotation_added",
        }
    }
}

/// What actually travels over a hub's broadcast channels.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    /// Connection that caused the event; it is not echoed back there.
    pub origin: Option<ConnectionId>,
    pub event: HubEvent,
}
