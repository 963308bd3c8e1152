//! Durable storage for sessions, members and the action log.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  write first   ┌──────────────┐
//! │ SessionHub  │ ─────────────► │ SessionStore │
//! │ (in-memory) │                │ (trait)      │
//! └──────┬──────┘                └──────┬───────┘
//!        │                              │
//!        │ rehydrate on miss            ├── MemoryStore (tests, embedding)
//!        ▼                              └── RocksStore  (feature "persistence")
//! ┌─────────────┐     ┌───────────────────────────────────────┐
//! │ Registry    │     │ CF "sessions" - session rows          │
//! │ recover()   │     │ CF "members"  - session:user → member │
//! └─────────────┘     │ CF "actions"  - session:seq → action  │
//!                     └───────────────────────────────────────┘
//! ```
//!
//! Values are LZ4-compressed JSON. Session data and action payloads are
//! free-form `serde_json::Value`.
//!
//! Every method is synchronous. A hub calls its store while holding the
//! session lock, so each write is ordered with the in-memory commit.

pub mod blob;
pub mod memory;
#[cfg(feature = "persistence")]
pub mod rocks;

pub use blob::{BlobError, BlobStore, DirBlobStore, MemoryBlobStore};
pub use memory::MemoryStore;
#[cfg(feature = "persistence")]
pub use rocks::{RocksConfig, RocksStore};

use serde::de::DeserializeOwned;
use serde::Serialize;

use labsync_core::{
    ActionId, CollabError, CollaborativeAction, Member, Session, SessionId, UserId,
};

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend internal error
    DatabaseError(String),
    /// Backend switched off or unreachable
    Unavailable(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// I/O error
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        log::error!("Store failure: {e}");
        CollabError::TransportUnavailable(e.to_string())
    }
}

/// Durable store consumed by hubs and the registry.
pub trait SessionStore: Send + Sync {
    fn save_session(&self, session: &Session) -> Result<(), StoreError>;

    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError>;

    fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    fn upsert_member(&self, member: &Member) -> Result<(), StoreError>;

    fn remove_member(&self, session_id: SessionId, user_id: UserId) -> Result<(), StoreError>;

    fn load_members(&self, session_id: SessionId) -> Result<Vec<Member>, StoreError>;

    fn insert_action(&self, action: &CollaborativeAction) -> Result<(), StoreError>;

    /// Overwrite an existing action (approval or revert).
    fn update_action(&self, action: &CollaborativeAction) -> Result<(), StoreError>;

    /// Actions with `sequence > after_seq`, ascending, at most `limit`.
    fn load_actions_since(
        &self,
        session_id: SessionId,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<CollaborativeAction>, StoreError>;

    fn load_action(
        &self,
        session_id: SessionId,
        action_id: ActionId,
    ) -> Result<Option<CollaborativeAction>, StoreError>;

    /// Highest persisted sequence for a session, 0 when none.
    fn last_sequence(&self, session_id: SessionId) -> Result<u64, StoreError>;

    /// Several member rows at once (leadership transfer).
    fn upsert_members(&self, members: &[Member]) -> Result<(), StoreError> {
        for member in members {
            self.upsert_member(member)?;
        }
        Ok(())
    }

    /// Session row plus a new or changed member, as one write where the
    /// backend supports it.
    fn record_join(&self, session: &Session, member: &Member) -> Result<(), StoreError> {
        self.upsert_member(member)?;
        self.save_session(session)
    }

    /// Session row minus a departed member, plus any members updated as a
    /// consequence (leader promotion).
    fn record_leave(
        &self,
        session: &Session,
        user_id: UserId,
        updated: &[Member],
    ) -> Result<(), StoreError> {
        self.remove_member(session.id, user_id)?;
        for member in updated {
            self.upsert_member(member)?;
        }
        self.save_session(session)
    }

    /// Reverted target plus the undo action that reverts it.
    fn record_undo(
        &self,
        reverted: &CollaborativeAction,
        undo: &CollaborativeAction,
    ) -> Result<(), StoreError> {
        self.update_action(reverted)?;
        self.insert_action(undo)
    }
}

// ─── Value codec ──────────────────────────────────────────────────────

/// JSON + LZ4 (size-prepended).
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let json =
        serde_json::to_vec(value).map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
}
