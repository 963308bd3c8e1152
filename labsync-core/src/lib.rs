//! # labsync-core - Shared data model for lab-session collaboration
//!
//! Pure types with no I/O: roles and capabilities, vector clocks, session and
//! member records, typed collaborative actions and the error surface.
//!
//! ## Modules
//!
//! - [`permissions`]: Role → capability mapping
//! - [`vector_clock`]: Per-actor causal counters
//! - [`session`]: Session, settings and member records
//! - [`action`]: Typed durable actions and their persisted shape
//! - [`time`]: Injectable wall clock
//! - [`error`]: `CollabError`

pub mod action;
pub mod error;
pub mod permissions;
pub mod session;
pub mod time;
pub mod vector_clock;

use uuid::Uuid;

pub type SessionId = Uuid;
pub type UserId = Uuid;
pub type ActionId = Uuid;
pub type GroupId = Uuid;
pub type ExperimentId = Uuid;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

pub use action::{ActionKind, ActionRecord, CollaborativeAction};
pub use error::CollabError;
pub use permissions::{Capability, Permissions, Role};
pub use session::{
    CollaborationMode, CursorPosition, DisplayProfile, Member, Session, SessionConfig,
    SessionSettings, SessionStatus,
};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use vector_clock::{CausalOrder, VectorClock};
