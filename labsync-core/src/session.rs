//! Session and member records.

use serde::{Deserialize, Serialize};

use crate::error::CollabError;
use crate::permissions::{Permissions, Role};
use crate::{ExperimentId, SessionId, Timestamp, UserId};

/// Lifecycle status. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Paused,
    Completed,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Pending, Completed)
                | (Active, Completed)
                | (Paused, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
        }
    }
}

/// How durable actions are gated beyond plain capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationMode {
    #[default]
    Free,
    TurnBased,
    LeaderControlled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub voice_chat_enabled: bool,
    pub screen_share_enabled: bool,
    /// Force `requires_approval` on every action executed by a non-manager.
    pub require_approval: bool,
    /// Users allowed to approve in addition to managers.
    pub approvers: Vec<UserId>,
    pub autosave_interval_secs: u64,
    pub collaboration_mode: CollaborationMode,
    /// In-memory action window per session.
    pub action_log_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            voice_chat_enabled: true,
            screen_share_enabled: true,
            require_approval: false,
            approvers: Vec::new(),
            autosave_interval_secs: 30,
            collaboration_mode: CollaborationMode::Free,
            action_log_capacity: 1000,
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> Result<(), CollabError> {
        if self.autosave_interval_secs == 0 {
            return Err(CollabError::InvalidConfig(
                "autosave_interval_secs must be > 0".into(),
            ));
        }
        if self.action_log_capacity == 0 {
            return Err(CollabError::InvalidConfig(
                "action_log_capacity must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn is_designated_approver(&self, user: &UserId) -> bool {
        self.approvers.contains(user)
    }
}

/// Creation request for a new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub experiment_id: ExperimentId,
    pub name: String,
    pub max_participants: u32,
    #[serde(default)]
    pub session_data: serde_json::Value,
    #[serde(default)]
    pub settings: SessionSettings,
}

impl SessionConfig {
    pub fn new(experiment_id: ExperimentId, name: impl Into<String>, max_participants: u32) -> Self {
        Self {
            experiment_id,
            name: name.into(),
            max_participants,
            session_data: serde_json::Value::Object(Default::default()),
            settings: SessionSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn validate(&self) -> Result<(), CollabError> {
        if self.max_participants < 1 {
            return Err(CollabError::InvalidConfig("max_participants must be >= 1".into()));
        }
        if self.name.trim().is_empty() {
            return Err(CollabError::InvalidConfig("session name must not be empty".into()));
        }
        if !(self.session_data.is_object() || self.session_data.is_null()) {
            return Err(CollabError::InvalidConfig("session_data must be a JSON object".into()));
        }
        self.settings.validate()
    }
}

/// A collaborative session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub experiment_id: ExperimentId,
    pub name: String,
    pub status: SessionStatus,
    pub max_participants: u32,
    pub current_participants: u32,
    pub created_by: UserId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub session_data: serde_json::Value,
    pub settings: SessionSettings,
    /// Only meaningful in turn-based mode.
    #[serde(default)]
    pub turn_holder: Option<UserId>,
}

impl Session {
    /// Build a session from a validated config. The creator is counted.
    pub fn from_config(
        id: SessionId,
        config: SessionConfig,
        created_by: UserId,
        now: Timestamp,
    ) -> Result<Self, CollabError> {
        config.validate()?;
        let session_data = if config.session_data.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            config.session_data
        };
        let turn_holder = match config.settings.collaboration_mode {
            CollaborationMode::TurnBased => Some(created_by),
            _ => None,
        };
        Ok(Self {
            id,
            experiment_id: config.experiment_id,
            name: config.name,
            status: SessionStatus::Pending,
            max_participants: config.max_participants,
            current_participants: 1,
            created_by,
            created_at: now,
            updated_at: now,
            session_data,
            settings: config.settings,
            turn_holder,
        })
    }

    pub fn is_full(&self) -> bool {
        self.current_participants >= self.max_participants
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn transition(&mut self, next: SessionStatus, now: Timestamp) -> Result<(), CollabError> {
        if self.status == next {
            return Ok(());
        }
        if self.is_completed() {
            return Err(CollabError::SessionClosed(self.id));
        }
        if !self.status.can_transition_to(next) {
            return Err(CollabError::InvalidConfig(format!(
                "cannot move session from {} to {}",
                self.status.as_str(),
                next.as_str()
            )));
        }
        log::debug!(
            "Session {} status {} -> {}",
            self.id,
            self.status.as_str(),
            next.as_str()
        );
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Write `value` under `key` in the free-form session data blob.
    pub fn set_data(&mut self, key: &str, value: serde_json::Value, now: Timestamp) {
        if !self.session_data.is_object() {
            self.session_data = serde_json::Value::Object(Default::default());
        }
        if let Some(map) = self.session_data.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self.updated_at = now;
    }
}

/// Display metadata, owned by the identity provider and cached here.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DisplayProfile {
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl DisplayProfile {
    pub fn named(name: impl Into<String>) -> Self {
        Self { display_name: name.into(), avatar_url: None }
    }
}

/// Cursor location inside the shared lab view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
    /// Element under the cursor, if the client reports one.
    #[serde(default)]
    pub target: Option<String>,
}

impl CursorPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, target: None }
    }
}

/// Session member. `is_online` is a view of presence, not stored state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub role: Role,
    pub profile: DisplayProfile,
    pub is_online: bool,
    pub joined_at: Timestamp,
    pub last_active: Timestamp,
    #[serde(default)]
    pub current_tool: Option<String>,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
}

impl Member {
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
        role: Role,
        profile: DisplayProfile,
        now: Timestamp,
    ) -> Self {
        Self {
            session_id,
            user_id,
            role,
            profile,
            is_online: true,
            joined_at: now,
            last_active: now,
            current_tool: None,
            cursor: None,
        }
    }

    pub fn permissions(&self) -> Permissions {
        self.role.permissions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn config() -> SessionConfig {
        SessionConfig::new(Uuid::new_v4(), "Titration lab", 4)
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());

        let mut zero = config();
        zero.max_participants = 0;
        assert!(matches!(zero.validate(), Err(CollabError::InvalidConfig(_))));

        let mut unnamed = config();
        unnamed.name = "  ".into();
        assert!(matches!(unnamed.validate(), Err(CollabError::InvalidConfig(_))));

        let mut bad_data = config();
        bad_data.session_data = serde_json::json!([1, 2]);
        assert!(matches!(bad_data.validate(), Err(CollabError::InvalidConfig(_))));

        let mut bad_settings = config();
        bad_settings.settings.autosave_interval_secs = 0;
        assert!(matches!(bad_settings.validate(), Err(CollabError::InvalidConfig(_))));
    }

    #[test]
    fn test_new_session_counts_creator() {
        let creator = Uuid::new_v4();
        let s = Session::from_config(Uuid::new_v4(), config(), creator, 10).unwrap();
        assert_eq!(s.status, SessionStatus::Pending);
        assert_eq!(s.current_participants, 1);
        assert_eq!(s.created_by, creator);
        assert!(s.session_data.is_object());
        assert!(s.turn_holder.is_none());
    }

    #[test]
    fn test_turn_based_starts_with_creator() {
        let creator = Uuid::new_v4();
        let mut cfg = config();
        cfg.settings.collaboration_mode = CollaborationMode::TurnBased;
        let s = Session::from_config(Uuid::new_v4(), cfg, creator, 0).unwrap();
        assert_eq!(s.turn_holder, Some(creator));
    }

    #[test]
    fn test_status_transitions() {
        let mut s = Session::from_config(Uuid::new_v4(), config(), Uuid::new_v4(), 0).unwrap();
        assert!(s.transition(SessionStatus::Paused, 1).is_err());
        s.transition(SessionStatus::Active, 2).unwrap();
        s.transition(SessionStatus::Paused, 3).unwrap();
        s.transition(SessionStatus::Active, 4).unwrap();
        s.transition(SessionStatus::Completed, 5).unwrap();
        assert_eq!(s.updated_at, 5);
        assert_eq!(
            s.transition(SessionStatus::Active, 6),
            Err(CollabError::SessionClosed(s.id))
        );
    }

    #[test]
    fn test_set_data() {
        let mut s = Session::from_config(Uuid::new_v4(), config(), Uuid::new_v4(), 0).unwrap();
        s.set_data("ph", serde_json::json!(7.2), 9);
        assert_eq!(s.session_data["ph"], serde_json::json!(7.2));
        assert_eq!(s.updated_at, 9);
    }

    #[test]
    fn test_settings_defaults_fill_missing_fields() {
        let settings: SessionSettings =
            serde_json::from_str(r#"{"collaboration_mode":"leader_controlled"}"#).unwrap();
        assert_eq!(settings.collaboration_mode, CollaborationMode::LeaderControlled);
        assert_eq!(settings.action_log_capacity, 1000);
        assert!(settings.voice_chat_enabled);
    }
}
