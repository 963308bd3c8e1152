//! Binary framing for the WebSocket transport.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬──────────┬────────────┬──────────┬──────────┐
//! │ msg_type │ session_id │ user_id  │ request_id │ sequence │ payload  │
//! │ 1 byte   │ 16 bytes   │ 16 bytes │ varint     │ varint   │ JSON     │
//! └──────────┴────────────┴──────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! The header is bincode for compactness; the payload is JSON so that
//! free-form `action_data` and session data round-trip without a schema.
//! `request_id` correlates a `Command` with its `Reply`; `sequence` carries
//! the action sequence on `Event` frames so clients can dedup without
//! parsing the payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use labsync_core::{
    ActionId, ActionKind, CollabError, GroupId, Role, SessionId, SessionSettings, UserId,
    VectorClock,
};

use crate::event::{EphemeralSignal, HubEvent};

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Join or resume a session
    Hello = 1,
    /// Client request
    Command = 2,
    /// Response to a Hello or Command
    Reply = 3,
    /// Hub event pushed to the client
    Event = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
}

/// First frame on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub role: Role,
    /// Resume as an existing member, replaying actions after this sequence.
    #[serde(default)]
    pub resume_after: Option<u64>,
}

/// Client requests after `Hello`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Execute { action: ActionKind },
    Undo { action_id: ActionId },
    Approve { action_id: ActionId },
    Touch,
    Signal { signal: EphemeralSignal },
    VoiceNote { audio: Vec<u8>, duration_ms: u64 },
    Annotation { shape: String, geometry: serde_json::Value },
    ChangeRole { user_id: UserId, role: Role },
    Kick { user_id: UserId },
    CreateGroup { name: String, members: Vec<UserId> },
    JoinGroup { user_id: UserId, group_id: GroupId },
    LeaveGroup { user_id: UserId },
    MoveToGroup { user_id: UserId, group_id: GroupId },
    CloseGroup { group_id: GroupId },
    CloseAllGroups,
    AutoAssign { group_size: usize },
    PassTurn { user_id: UserId },
    Pause,
    Resume,
    Close,
    UpdateSettings { settings: SessionSettings },
    FetchSince { after: u64 },
    ObserveClock { clock: VectorClock },
    Snapshot,
    Leave,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Execute { .. } => "execute",
            Command::Undo { .. } => "undo",
            Command::Approve { .. } => "approve",
            Command::Touch => "touch",
            Command::Signal { .. } => "signal",
            Command::VoiceNote { .. } => "voice_note",
            Command::Annotation { .. } => "annotation",
            Command::ChangeRole { .. } => "change_role",
            Command::Kick { .. } => "kick",
            Command::CreateGroup { .. } => "create_group",
            Command::JoinGroup { .. } => "join_group",
            Command::LeaveGroup { .. } => "leave_group",
            Command::MoveToGroup { .. } => "move_to_group",
            Command::CloseGroup { .. } => "close_group",
            Command::CloseAllGroups => "close_all_groups",
            Command::AutoAssign { .. } => "auto_assign",
            Command::PassTurn { .. } => "pass_turn",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Close => "close",
            Command::UpdateSettings { .. } => "update_settings",
            Command::FetchSince { .. } => "fetch_since",
            Command::ObserveClock { .. } => "observe_clock",
            Command::Snapshot => "snapshot",
            Command::Leave => "leave",
        }
    }
}

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok {
        #[serde(default)]
        body: serde_json::Value,
    },
    Error {
        /// Stable `CollabError::kind()` tag
        kind: String,
        message: String,
    },
}

impl Reply {
    pub fn ok<T: Serialize>(body: &T) -> Result<Self, ProtocolError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Reply::Ok { body })
    }

    pub fn error(err: &CollabError) -> Self {
        Reply::Error { kind: err.kind().to_string(), message: err.to_string() }
    }

    pub fn from_result<T: Serialize>(result: Result<T, CollabError>) -> Self {
        match result {
            Ok(body) => Reply::ok(&body).unwrap_or_else(|e| Reply::Error {
                kind: "invalid_action".into(),
                message: e.to_string(),
            }),
            Err(e) => Reply::error(&e),
        }
    }

    /// Body on success, `Remote` on a server-side error.
    pub fn into_body(self) -> Result<serde_json::Value, ProtocolError> {
        match self {
            Reply::Ok { body } => Ok(body),
            Reply::Error { kind, message } => Err(ProtocolError::Remote { kind, message }),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok { .. })
    }
}

/// One WebSocket binary message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub msg_type: MessageType,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub request_id: u64,
    /// Action sequence for `Event` frames carrying one, else 0
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Leading fields of a [`Frame`], readable without decoding the payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FrameHeader {
    pub msg_type: MessageType,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub request_id: u64,
}

fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

impl Frame {
    fn new(
        msg_type: MessageType,
        session_id: SessionId,
        user_id: UserId,
        request_id: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self { msg_type, session_id, user_id, request_id, sequence: 0, payload }
    }

    pub fn hello(
        session_id: SessionId,
        user_id: UserId,
        request_id: u64,
        hello: &Hello,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Hello, session_id, user_id, request_id, to_payload(hello)?))
    }

    pub fn command(
        session_id: SessionId,
        user_id: UserId,
        request_id: u64,
        command: &Command,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Command, session_id, user_id, request_id, to_payload(command)?))
    }

    pub fn reply(
        session_id: SessionId,
        user_id: UserId,
        request_id: u64,
        reply: &Reply,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Reply, session_id, user_id, request_id, to_payload(reply)?))
    }

    pub fn event(
        session_id: SessionId,
        user_id: UserId,
        event: &HubEvent,
    ) -> Result<Self, ProtocolError> {
        let mut frame = Self::new(MessageType::Event, session_id, user_id, 0, to_payload(event)?);
        frame.sequence = event.sequence().unwrap_or(0);
        Ok(frame)
    }

    pub fn ping(session_id: SessionId, user_id: UserId) -> Self {
        Self::new(MessageType::Ping, session_id, user_id, 0, Vec::new())
    }

    pub fn pong(session_id: SessionId, user_id: UserId) -> Self {
        Self::new(MessageType::Pong, session_id, user_id, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// `decode` with a size guard.
    pub fn decode_bounded(bytes: &[u8], limit: usize) -> Result<Self, ProtocolError> {
        if bytes.len() > limit {
            return Err(ProtocolError::FrameTooLarge { size: bytes.len(), limit });
        }
        Self::decode(bytes)
    }

    /// Decode only the header prefix. Works on frames `decode_bounded`
    /// refuses, as long as the prefix is intact.
    pub fn peek_header(bytes: &[u8]) -> Result<FrameHeader, ProtocolError> {
        let (header, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(header)
    }

    fn parse<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn hello_payload(&self) -> Result<Hello, ProtocolError> {
        self.parse(MessageType::Hello)
    }

    pub fn command_payload(&self) -> Result<Command, ProtocolError> {
        self.parse(MessageType::Command)
    }

    pub fn reply_payload(&self) -> Result<Reply, ProtocolError> {
        self.parse(MessageType::Reply)
    }

    pub fn event_payload(&self) -> Result<HubEvent, ProtocolError> {
        self.parse(MessageType::Event)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    FrameTooLarge { size: usize, limit: usize },
    /// Server rejected the request
    Remote { kind: String, message: String },
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::FrameTooLarge { size, limit } => {
                write!(f, "Frame of {size} bytes exceeds limit of {limit}")
            }
            Self::Remote { kind, message } => write!(f, "Server error ({kind}): {message}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed | ProtocolError::Timeout => {
                CollabError::TransportUnavailable(e.to_string())
            }
            other => CollabError::InvalidAction(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labsync_core::CursorPosition;

    #[test]
    fn test_command_frame_keeps_free_form_data() {
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let command = Command::Execute {
            action: ActionKind::Custom {
                tag: "spectrometer_scan".into(),
                data: serde_json::json!({"range": [400, 700], "nested": {"ok": true}}),
            },
        };
        let bytes = Frame::command(session, user, 7, &command).unwrap().encode().unwrap();
        let frame = Frame::decode(&bytes).unwrap();

        assert_eq!(frame.msg_type, MessageType::Command);
        assert_eq!((frame.session_id, frame.user_id, frame.request_id), (session, user, 7));
        assert_eq!(frame.command_payload().unwrap(), command);
    }

    #[test]
    fn test_event_frame_carries_sequence() {
        let event = HubEvent::CursorMoved { user_id: Uuid::new_v4(), cursor: CursorPosition::new(1.0, 2.0) };
        let frame = Frame::event(Uuid::new_v4(), Uuid::nil(), &event).unwrap();
        assert_eq!(frame.sequence, 0);
        assert_eq!(frame.event_payload().unwrap(), event);
    }

    #[test]
    fn test_wrong_payload_accessor() {
        let frame = Frame::ping(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(frame.command_payload().unwrap_err(), ProtocolError::InvalidMessageType);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_reply_error_carries_kind() {
        let err = CollabError::SessionFull { session_id: Uuid::new_v4(), max_participants: 4 };
        let reply = Reply::from_result::<()>(Err(err));
        match reply.clone().into_body() {
            Err(ProtocolError::Remote { kind, .. }) => assert_eq!(kind, "session_full"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!reply.is_ok());
    }

    #[test]
    fn test_command_json_shape() {
        let json = serde_json::to_value(Command::AutoAssign { group_size: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({"command": "auto_assign", "group_size": 3}));
        let json = serde_json::to_value(Command::Touch).unwrap();
        assert_eq!(json, serde_json::json!({"command": "touch"}));
    }

    #[test]
    fn test_hello_defaults_resume() {
        let hello: Hello = serde_json::from_str(r#"{"role":"observer"}"#).unwrap();
        assert_eq!(hello, Hello { role: Role::Observer, resume_after: None });
    }

    #[test]
    fn test_bounded_decode() {
        let bytes = Frame::pong(Uuid::new_v4(), Uuid::new_v4()).encode().unwrap();
        assert!(Frame::decode_bounded(&bytes, 1024).is_ok());
        assert!(matches!(
            Frame::decode_bounded(&bytes, 4),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
        assert!(Frame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_peek_header_of_oversized_frame() {
        let (session, user) = (Uuid::new_v4(), Uuid::new_v4());
        let command = Command::VoiceNote { audio: vec![7; 4096], duration_ms: 1_500 };
        let bytes = Frame::command(session, user, 42, &command).unwrap().encode().unwrap();
        assert!(Frame::decode_bounded(&bytes, 1024).is_err());

        let header = Frame::peek_header(&bytes).unwrap();
        assert_eq!(header.msg_type, MessageType::Command);
        assert_eq!((header.session_id, header.user_id, header.request_id), (session, user, 42));
        assert!(Frame::peek_header(&bytes[..3]).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Hello as u8, 1);
        assert_eq!(MessageType::Event as u8, 4);
        assert_eq!(MessageType::Pong as u8, 6);
    }
}
