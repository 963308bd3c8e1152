//! Durable collaborative actions.
//!
//! Every action kind is a typed variant with its own payload schema,
//! validated before it reaches the log. On the persistence boundary the
//! variant is flattened into the `action_type` / `action_data` pair that the
//! durable store expects.

use serde::{Deserialize, Serialize};

use crate::error::CollabError;
use crate::permissions::Capability;
use crate::vector_clock::VectorClock;
use crate::{ActionId, SessionId, Timestamp, UserId};

/// Typed action payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "action_data", rename_all = "snake_case")]
pub enum ActionKind {
    /// Drive the shared instrument / simulation.
    ExperimentControl {
        command: String,
        #[serde(default)]
        parameters: serde_json::Value,
    },
    /// Replace the content of one notebook cell.
    NotebookEdit { cell_id: String, content: String },
    /// Record an instrument reading.
    Measurement {
        instrument: String,
        value: f64,
        unit: String,
    },
    /// Write one key of the shared session data blob.
    SessionData { key: String, value: serde_json::Value },
    /// Revert of an earlier action. Appended by the log, never executed directly.
    Undo { target: ActionId },
    /// Extension point for action types the engine does not model.
    Custom {
        tag: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl ActionKind {
    pub fn action_type(&self) -> &str {
        match self {
            ActionKind::ExperimentControl { .. } => "experiment_control",
            ActionKind::NotebookEdit { .. } => "notebook_edit",
            ActionKind::Measurement { .. } => "measurement",
            ActionKind::SessionData { .. } => "session_data",
            ActionKind::Undo { .. } => "undo",
            ActionKind::Custom { tag, .. } => tag,
        }
    }

    /// Capability an actor needs to execute this kind. `None` for `Undo`,
    /// which is gated on authorship instead.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            ActionKind::ExperimentControl { .. }
            | ActionKind::SessionData { .. }
            | ActionKind::Custom { .. } => Some(Capability::ControlExperiment),
            ActionKind::NotebookEdit { .. } => Some(Capability::EditNotebook),
            ActionKind::Measurement { .. } => Some(Capability::RecordMeasurements),
            ActionKind::Undo { .. } => None,
        }
    }

    /// Kinds that only managers may issue in leader-controlled sessions.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            ActionKind::ExperimentControl { .. }
                | ActionKind::SessionData { .. }
                | ActionKind::Custom { .. }
        )
    }

    /// Boundary validation of the payload schema.
    pub fn validate(&self) -> Result<(), CollabError> {
        let invalid = |msg: &str| Err(CollabError::InvalidAction(msg.to_string()));
        match self {
            ActionKind::ExperimentControl { command, parameters } => {
                if command.trim().is_empty() {
                    return invalid("experiment_control.command must not be empty");
                }
                if !(parameters.is_object() || parameters.is_null()) {
                    return invalid("experiment_control.parameters must be an object");
                }
            }
            ActionKind::NotebookEdit { cell_id, .. } => {
                if cell_id.trim().is_empty() {
                    return invalid("notebook_edit.cell_id must not be empty");
                }
            }
            ActionKind::Measurement { instrument, value, unit } => {
                if instrument.trim().is_empty() {
                    return invalid("measurement.instrument must not be empty");
                }
                if !value.is_finite() {
                    return invalid("measurement.value must be finite");
                }
                if unit.trim().is_empty() {
                    return invalid("measurement.unit must not be empty");
                }
            }
            ActionKind::SessionData { key, .. } => {
                if key.trim().is_empty() {
                    return invalid("session_data.key must not be empty");
                }
            }
            ActionKind::Undo { .. } => {
                return invalid("undo actions are created by reverting, not executed");
            }
            ActionKind::Custom { tag, .. } => {
                if tag.trim().is_empty() {
                    return invalid("custom.tag must not be empty");
                }
                if KNOWN_TYPES.contains(&tag.as_str()) {
                    return invalid("custom.tag shadows a built-in action type");
                }
            }
        }
        Ok(())
    }

    /// Split into the persisted `(action_type, action_data)` pair.
    pub fn to_parts(&self) -> Result<(String, serde_json::Value), CollabError> {
        if let ActionKind::Custom { tag, data } = self {
            return Ok((tag.clone(), data.clone()));
        }
        let mut value = serde_json::to_value(self)
            .map_err(|e| CollabError::InvalidAction(e.to_string()))?;
        let data = value
            .get_mut("action_data")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok((self.action_type().to_string(), data))
    }

    /// Rebuild from the persisted pair. Unknown types become `Custom`.
    pub fn from_parts(action_type: &str, action_data: serde_json::Value) -> Result<Self, CollabError> {
        if !KNOWN_TYPES.contains(&action_type) {
            return Ok(ActionKind::Custom { tag: action_type.to_string(), data: action_data });
        }
        let tagged = serde_json::json!({
            "action_type": action_type,
            "action_data": action_data,
        });
        serde_json::from_value(tagged).map_err(|e| CollabError::InvalidAction(e.to_string()))
    }
}

const KNOWN_TYPES: [&str; 5] = [
    "experiment_control",
    "notebook_edit",
    "measurement",
    "session_data",
    "undo",
];

/// An entry of the causal action log.
///
/// Immutable after creation except `approved_by` and `reverted_at`, each of
/// which may be set exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "ActionRecord", try_from = "ActionRecord")]
pub struct CollaborativeAction {
    pub id: ActionId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub kind: ActionKind,
    pub requires_approval: bool,
    pub approved_by: Option<UserId>,
    pub reverted_at: Option<Timestamp>,
    pub vector_clock: VectorClock,
}

impl CollaborativeAction {
    pub fn is_approved(&self) -> bool {
        self.approved_by.is_some()
    }

    pub fn is_reverted(&self) -> bool {
        self.reverted_at.is_some()
    }

    /// Needs approval, has none, and was not reverted in the meantime.
    pub fn awaiting_approval(&self) -> bool {
        self.requires_approval && self.approved_by.is_none() && self.reverted_at.is_none()
    }

    pub fn to_record(&self) -> ActionRecord {
        ActionRecord::from(self.clone())
    }
}

/// Flat persisted shape of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: ActionId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub sequence: u64,
    pub action_type: String,
    pub action_data: serde_json::Value,
    pub timestamp: Timestamp,
    pub requires_approval: bool,
    pub approved_by: Option<UserId>,
    pub reverted_at: Option<Timestamp>,
    pub vector_clock: VectorClock,
}

impl From<CollaborativeAction> for ActionRecord {
    fn from(action: CollaborativeAction) -> Self {
        let (action_type, action_data) = action
            .kind
            .to_parts()
            .unwrap_or_else(|_| (action.kind.action_type().to_string(), serde_json::Value::Null));
        Self {
            id: action.id,
            session_id: action.session_id,
            user_id: action.user_id,
            sequence: action.sequence,
            action_type,
            action_data,
            timestamp: action.timestamp,
            requires_approval: action.requires_approval,
            approved_by: action.approved_by,
            reverted_at: action.reverted_at,
            vector_clock: action.vector_clock,
        }
    }
}

impl TryFrom<ActionRecord> for CollaborativeAction {
    type Error = CollabError;

    fn try_from(record: ActionRecord) -> Result<Self, Self::Error> {
        let kind = ActionKind::from_parts(&record.action_type, record.action_data)?;
        Ok(Self {
            id: record.id,
            session_id: record.session_id,
            user_id: record.user_id,
            sequence: record.sequence,
            timestamp: record.timestamp,
            kind,
            requires_approval: record.requires_approval,
            approved_by: record.approved_by,
            reverted_at: record.reverted_at,
            vector_clock: record.vector_clock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn action(kind: ActionKind) -> CollaborativeAction {
        let user = Uuid::new_v4();
        let mut clock = VectorClock::new();
        clock.increment(user);
        CollaborativeAction {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            user_id: user,
            sequence: 7,
            timestamp: 1_700_000_000_000,
            kind,
            requires_approval: true,
            approved_by: None,
            reverted_at: None,
            vector_clock: clock,
        }
    }

    #[test]
    fn test_required_capabilities() {
        let control = ActionKind::ExperimentControl { command: "start".into(), parameters: json!({}) };
        assert_eq!(control.required_capability(), Some(Capability::ControlExperiment));
        let edit = ActionKind::NotebookEdit { cell_id: "c1".into(), content: "x".into() };
        assert_eq!(edit.required_capability(), Some(Capability::EditNotebook));
        let m = ActionKind::Measurement { instrument: "ph".into(), value: 7.0, unit: "pH".into() };
        assert_eq!(m.required_capability(), Some(Capability::RecordMeasurements));
        assert_eq!(ActionKind::Undo { target: Uuid::new_v4() }.required_capability(), None);
    }

    #[test]
    fn test_validate_rejects_bad_payloads() {
        let cases = vec![
            ActionKind::ExperimentControl { command: "".into(), parameters: json!({}) },
            ActionKind::ExperimentControl { command: "run".into(), parameters: json!(3) },
            ActionKind::NotebookEdit { cell_id: " ".into(), content: "".into() },
            ActionKind::Measurement { instrument: "t".into(), value: f64::NAN, unit: "C".into() },
            ActionKind::Measurement { instrument: "t".into(), value: 1.0, unit: "".into() },
            ActionKind::SessionData { key: "".into(), value: json!(1) },
            ActionKind::Undo { target: Uuid::new_v4() },
            ActionKind::Custom { tag: "".into(), data: json!(null) },
            ActionKind::Custom { tag: "undo".into(), data: json!(null) },
        ];
        for kind in cases {
            assert!(
                matches!(kind.validate(), Err(CollabError::InvalidAction(_))),
                "{kind:?} should be rejected"
            );
        }
        let ok = ActionKind::Custom { tag: "annotate_graph".into(), data: json!({"p": 1}) };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_persisted_shape() {
        let a = action(ActionKind::Measurement {
            instrument: "thermometer".into(),
            value: 21.5,
            unit: "C".into(),
        });
        let value = serde_json::to_value(&a).unwrap();
        assert_eq!(value["action_type"], "measurement");
        assert_eq!(value["action_data"]["instrument"], "thermometer");
        assert_eq!(value["action_data"]["value"], 21.5);
        assert_eq!(value["sequence"], 7);
        assert!(value["approved_by"].is_null());
        assert_eq!(value["vector_clock"][a.user_id.to_string()], 1);

        let back: CollaborativeAction = serde_json::from_value(value).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_custom_uses_tag_as_action_type() {
        let a = action(ActionKind::Custom { tag: "graph_zoom".into(), data: json!({"level": 2}) });
        let record = a.to_record();
        assert_eq!(record.action_type, "graph_zoom");
        assert_eq!(record.action_data, json!({"level": 2}));
        let back = CollaborativeAction::try_from(record).unwrap();
        assert_eq!(back.kind, a.kind);
    }

    #[test]
    fn test_from_parts_rejects_malformed_known_type() {
        let err = ActionKind::from_parts("measurement", json!({"instrument": 3})).unwrap_err();
        assert!(matches!(err, CollabError::InvalidAction(_)));
    }

    #[test]
    fn test_awaiting_approval() {
        let mut a = action(ActionKind::NotebookEdit { cell_id: "c".into(), content: "v".into() });
        assert!(a.awaiting_approval());
        a.approved_by = Some(Uuid::new_v4());
        assert!(!a.awaiting_approval());
        assert!(a.is_approved());
        assert!(!a.is_reverted());

        a.approved_by = None;
        a.reverted_at = Some(5);
        assert!(!a.awaiting_approval());
    }
}
