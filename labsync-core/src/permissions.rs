//! Role → capability mapping.
//!
//! Pure and stateless. Permissions are always recomputed from the role so a
//! member's capability set can never drift from its role.

use serde::{Deserialize, Serialize};

use crate::error::CollabError;
use crate::UserId;

/// Member role within a session. Mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    Member,
    Observer,
}

impl Role {
    pub fn permissions(self) -> Permissions {
        Permissions::for_role(self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Member => "member",
            Role::Observer => "observer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single guarded capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ControlExperiment,
    EditNotebook,
    ManageMembers,
    RecordMeasurements,
    UseVoiceChat,
    ShareScreen,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::ControlExperiment,
        Capability::EditNotebook,
        Capability::ManageMembers,
        Capability::RecordMeasurements,
        Capability::UseVoiceChat,
        Capability::ShareScreen,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::ControlExperiment => "can_control_experiment",
            Capability::EditNotebook => "can_edit_notebook",
            Capability::ManageMembers => "can_manage_members",
            Capability::RecordMeasurements => "can_record_measurements",
            Capability::UseVoiceChat => "can_use_voice_chat",
            Capability::ShareScreen => "can_share_screen",
        }
    }
}

/// Capability set derived from a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub can_control_experiment: bool,
    pub can_edit_notebook: bool,
    pub can_manage_members: bool,
    pub can_record_measurements: bool,
    pub can_use_voice_chat: bool,
    pub can_share_screen: bool,
}

impl Permissions {
    pub const fn for_role(role: Role) -> Self {
        match role {
            Role::Leader => Self {
                can_control_experiment: true,
                can_edit_notebook: true,
                can_manage_members: true,
                can_record_measurements: true,
                can_use_voice_chat: true,
                can_share_screen: true,
            },
            Role::Member => Self {
                can_control_experiment: true,
                can_edit_notebook: true,
                can_manage_members: false,
                can_record_measurements: true,
                can_use_voice_chat: true,
                can_share_screen: false,
            },
            Role::Observer => Self {
                can_control_experiment: false,
                can_edit_notebook: false,
                can_manage_members: false,
                can_record_measurements: false,
                can_use_voice_chat: true,
                can_share_screen: false,
            },
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::ControlExperiment => self.can_control_experiment,
            Capability::EditNotebook => self.can_edit_notebook,
            Capability::ManageMembers => self.can_manage_members,
            Capability::RecordMeasurements => self.can_record_measurements,
            Capability::UseVoiceChat => self.can_use_voice_chat,
            Capability::ShareScreen => self.can_share_screen,
        }
    }

    /// Guard used before every mutating operation.
    pub fn require(&self, user_id: UserId, capability: Capability) -> Result<(), CollabError> {
        if self.allows(capability) {
            Ok(())
        } else {
            Err(CollabError::missing_capability(user_id, capability))
        }
    }

    /// Capabilities granted, in declaration order.
    pub fn granted(&self) -> Vec<Capability> {
        Capability::ALL.iter().copied().filter(|c| self.allows(*c)).collect()
    }
}
