//! # labsync-collab - Session engine for shared lab experiments
//!
//! Runs live lab sessions: membership and roles, presence, a causally
//! ordered action log with undo and approval, breakout groups, and fan-out
//! of everything to connected members.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ CollabServer │
//! │ (per user)  │   bincode + JSON    │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                    ┌───────┴─────────┐
//!                                    │ SessionRegistry │
//!                                    └───────┬─────────┘
//!                                            │ one per session
//!                                    ┌───────┴─────────┐
//!                                    │ SessionHub      │──► SessionStore
//!                                    │ roster, log,    │──► BlobStore
//!                                    │ presence, groups│
//!                                    └───────┬─────────┘
//!                                  durable   │   ephemeral
//!                                    ┌───────┴─────────┐
//!                                    │ Subscription ×N │
//!                                    └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`action_log`]: Sequenced, vector-clocked action history
//! - [`breakout`]: Breakout group planning
//! - [`config`]: Hub, presence and server settings
//! - [`event`]: Event taxonomy pushed to subscribers
//! - [`hub`]: Per-session state and fan-out
//! - [`identity`]: Display profile lookup
//! - [`presence`]: Heartbeat tracking
//! - [`protocol`]: Binary wire protocol
//! - [`registry`]: Session directory and rehydration
//! - [`roster`]: Member table and leader policy
//! - [`server`] / [`client`]: WebSocket transport
//! - [`storage`]: Durable store and blob store

pub mod action_log;
pub mod breakout;
pub mod client;
pub mod config;
pub mod event;
pub mod hub;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod roster;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use action_log::{CausalActionLog, HistoryTrimmed, DEFAULT_LOG_CAPACITY};
pub use breakout::{balanced_sizes, BreakoutCoordinator, BreakoutGroup};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::{HubConfig, PresenceConfig, ServerConfig};
pub use event::{ConnectionId, EphemeralSignal, HubEvent, LeaveReason};
pub use hub::{Caller, HubServices, SessionHub, SessionSnapshot, Subscription};
pub use identity::{resolve_profile, IdentityProvider, StaticIdentity};
pub use presence::{PresenceRecord, PresenceTracker, PresenceTransition};
pub use protocol::{Command, Frame, FrameHeader, Hello, MessageType, ProtocolError, Reply};
pub use registry::SessionRegistry;
pub use roster::{JoinPlan, LeavePlan, Roster};
pub use server::{CollabServer, ServerStats};
pub use storage::{
    BlobError, BlobStore, DirBlobStore, MemoryBlobStore, MemoryStore, SessionStore, StoreError,
};
#[cfg(feature = "persistence")]
pub use storage::{RocksConfig, RocksStore};
