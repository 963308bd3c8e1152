//! Per-session hub: durable state, fan-out and subscriptions.
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────────────────── SessionHub ───────────────────────────┐
//!  execute/undo/...   │  tokio::Mutex<SessionState>          std::RwLock<LiveState>       │
//!  ─────────────────► │  session, roster, action log,        role cache, cursor, tool     │
//!                     │  presence, breakouts, closers        feature flags                │
//!                     │         │ store write first                    │                  │
//!                     │         ▼                                      ▼                  │
//!                     │  durable broadcast::Sender         ephemeral broadcast::Sender    │
//!                     └─────────┬──────────────────────────────────────┬──────────────────┘
//!                               │                                      │
//!                      ┌────────┴────────┐                    ┌────────┴────────┐
//!                      │ Subscription A  │        ...         │ Subscription N  │
//!                      │ lag → refill    │                    │ lag → drop      │
//!                      └─────────────────┘                    └─────────────────┘
//! ```
//!
//! Every durable mutation follows the same order: validate, write to the
//! store, commit in memory, enqueue the broadcast. A failed store write
//! returns `TransportUnavailable` with nothing applied.
//!
//! Lock order is `state` then `live`. The ephemeral path takes only `live`,
//! so cursor traffic never waits on an action being persisted.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use labsync_core::{
    ActionId, ActionKind, Capability, CollabError, CollaborationMode, CollaborativeAction,
    CursorPosition, GroupId, Member, Permissions, Role, Session, SessionId, SessionSettings,
    SessionStatus, SystemTimeSource, TimeSource, Timestamp, UserId, VectorClock,
};

use crate::action_log::CausalActionLog;
use crate::breakout::{BreakoutCoordinator, BreakoutGroup};
use crate::config::HubConfig;
use crate::event::{ConnectionId, EphemeralSignal, Envelope, HubEvent, LeaveReason};
use crate::identity::{resolve_profile, IdentityProvider, StaticIdentity};
use crate::presence::PresenceTracker;
use crate::roster::{JoinPlan, Roster};
use crate::storage::{BlobStore, MemoryBlobStore, MemoryStore, SessionStore};

// ───────────────────────────────────────────────────────────────────
// Collaborators
// ───────────────────────────────────────────────────────────────────

/// External collaborators injected into every hub.
#[derive(Clone)]
pub struct HubServices {
    pub store: Arc<dyn SessionStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub time: Arc<dyn TimeSource>,
}

impl HubServices {
    /// Memory-backed store and blobs, no known profiles, wall clock.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            identity: Arc::new(StaticIdentity::new()),
            time: Arc::new(SystemTimeSource),
        }
    }
}

/// Who is calling, and from which connection.
///
/// Events caused by a call are not echoed to `connection`. A caller without
/// a connection (direct API use) receives its own events on every
/// subscription it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub connection: Option<ConnectionId>,
}

impl From<UserId> for Caller {
    fn from(user_id: UserId) -> Self {
        Self { user_id, connection: None }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub members: Vec<Member>,
    pub groups: Vec<BreakoutGroup>,
    pub last_sequence: u64,
}

// ───────────────────────────────────────────────────────────────────
// State
// ───────────────────────────────────────────────────────────────────

struct SessionState {
    session: Session,
    roster: Roster,
    log: CausalActionLog,
    presence: PresenceTracker,
    breakout: BreakoutCoordinator,
    /// One close signal per user, shared by all of that user's subscriptions.
    closers: HashMap<UserId, watch::Sender<bool>>,
    /// Most recent connection per user.
    latest: HashMap<UserId, ConnectionId>,
    /// `session_data` changed since the last save.
    dirty: bool,
}

struct LiveMember {
    role: Role,
    cursor: Option<CursorPosition>,
    tool: Option<String>,
}

impl LiveMember {
    fn new(role: Role) -> Self {
        Self { role, cursor: None, tool: None }
    }
}

#[derive(Default)]
struct LiveState {
    members: HashMap<UserId, LiveMember>,
    voice_chat_enabled: bool,
    screen_share_enabled: bool,
    closed: bool,
}

impl LiveState {
    fn apply_settings(&mut self, settings: &SessionSettings) {
        self.voice_chat_enabled = settings.voice_chat_enabled;
        self.screen_share_enabled = settings.screen_share_enabled;
    }

    fn set_role(&mut self, user: UserId, role: Role) {
        self.members
            .entry(user)
            .and_modify(|m| m.role = role)
            .or_insert_with(|| LiveMember::new(role));
    }

    /// Member check plus capability and session feature flag.
    fn authorize_feature(&self, user: UserId, capability: Capability) -> Result<(), CollabError> {
        let member = self.members.get(&user).ok_or_else(|| CollabError::PermissionDenied {
            user_id: user,
            reason: "not a member of this session".into(),
        })?;
        member.role.permissions().require(user, capability)?;
        let (enabled, feature) = match capability {
            Capability::UseVoiceChat => (self.voice_chat_enabled, "voice chat"),
            Capability::ShareScreen => (self.screen_share_enabled, "screen sharing"),
            _ => (true, ""),
        };
        if !enabled {
            return Err(CollabError::PermissionDenied {
                user_id: user,
                reason: format!("{feature} is disabled in this session"),
            });
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Hub
// ───────────────────────────────────────────────────────────────────

pub struct SessionHub {
    session_id: SessionId,
    config: HubConfig,
    services: HubServices,
    state: Mutex<SessionState>,
    live: RwLock<LiveState>,
    durable_tx: broadcast::Sender<Envelope>,
    ephemeral_tx: broadcast::Sender<Envelope>,
    next_connection: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl SessionHub {
    /// Build a hub over an existing session, its member rows and the tail of
    /// its action history.
    pub fn new(
        session: Session,
        members: Vec<Member>,
        history: Vec<CollaborativeAction>,
        services: HubServices,
        config: HubConfig,
    ) -> Arc<Self> {
        let session_id = session.id;
        let roster = Roster::restore(session_id, members);
        let log = CausalActionLog::restore(
            session_id,
            session.settings.action_log_capacity,
            history,
            &roster.user_ids(),
        );

        let mut live = LiveState::default();
        live.apply_settings(&session.settings);
        live.closed = session.is_completed();
        for m in roster.members() {
            live.members.insert(m.user_id, LiveMember::new(m.role));
        }

        let (durable_tx, _) = broadcast::channel(config.durable_capacity.max(1));
        let (ephemeral_tx, _) = broadcast::channel(config.ephemeral_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            session_id,
            state: Mutex::new(SessionState {
                presence: PresenceTracker::new(&config.presence),
                breakout: BreakoutCoordinator::new(session_id),
                session,
                roster,
                log,
                closers: HashMap::new(),
                latest: HashMap::new(),
                dirty: false,
            }),
            live: RwLock::new(live),
            durable_tx,
            ephemeral_tx,
            next_connection: AtomicU64::new(1),
            shutdown,
            services,
            config,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn now(&self) -> Timestamp {
        self.services.time.now()
    }

    fn live_read(&self) -> RwLockReadGuard<'_, LiveState> {
        self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_write(&self) -> RwLockWriteGuard<'_, LiveState> {
        self.live.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, origin: Option<ConnectionId>, event: HubEvent) {
        let tx = if event.is_durable() { &self.durable_tx } else { &self.ephemeral_tx };
        log::trace!("Hub {}: emit {}", self.session_id, event.event_type());
        // No receivers is fine: nobody is listening right now.
        let _ = tx.send(Envelope { origin, event });
    }

    fn ensure_open(state: &SessionState) -> Result<(), CollabError> {
        if state.session.is_completed() {
            return Err(CollabError::SessionClosed(state.session.id));
        }
        Ok(())
    }

    fn ensure_active(state: &SessionState) -> Result<(), CollabError> {
        match CollabError::session_inactive(state.session.id, state.session.status) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn require_manager(state: &SessionState, user: UserId) -> Result<Permissions, CollabError> {
        let perms = state.roster.permissions_of(user)?;
        perms.require(user, Capability::ManageMembers)?;
        Ok(perms)
    }

    // ─── Views ───────────────────────────────────────────────────────

    /// Member row with presence and live cursor/tool folded in.
    fn view_of(&self, state: &SessionState, user: &UserId) -> Option<Member> {
        let mut member = state.roster.get(user)?.clone();
        member.is_online = state.presence.is_online(user);
        if let Some(live) = self.live_read().members.get(user) {
            member.cursor = live.cursor.clone();
            member.current_tool = live.tool.clone();
        }
        Some(member)
    }

    fn snapshot_of(&self, state: &SessionState) -> SessionSnapshot {
        let live = self.live_read();
        let members = state
            .roster
            .members()
            .iter()
            .map(|m| {
                let mut m = m.clone();
                m.is_online = state.presence.is_online(&m.user_id);
                if let Some(l) = live.members.get(&m.user_id) {
                    m.cursor = l.cursor.clone();
                    m.current_tool = l.tool.clone();
                }
                m
            })
            .collect();
        SessionSnapshot {
            session: state.session.clone(),
            members,
            groups: state.breakout.groups().to_vec(),
            last_sequence: state.log.last_sequence(),
        }
    }

    fn presence_sync(&self, state: &SessionState) -> HubEvent {
        let snapshot = self.snapshot_of(state);
        HubEvent::PresenceSync {
            session: snapshot.session,
            members: snapshot.members,
            groups: snapshot.groups,
            last_sequence: snapshot.last_sequence,
        }
    }

    fn emit_member(&self, state: &SessionState, origin: Option<ConnectionId>, user: &UserId) {
        if let Some(member) = self.view_of(state, user) {
            self.emit(origin, HubEvent::MemberUpdated { member });
        }
    }

    fn emit_groups(&self, state: &SessionState, origin: Option<ConnectionId>) {
        self.emit(origin, HubEvent::BreakoutUpdated { groups: state.breakout.groups().to_vec() });
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        self.snapshot_of(&state)
    }

    pub async fn session(&self) -> Session {
        self.state.lock().await.session.clone()
    }

    pub async fn member(&self, user: UserId) -> Option<Member> {
        let state = self.state.lock().await;
        self.view_of(&state, &user)
    }

    pub async fn is_online(&self, user: UserId) -> bool {
        self.state.lock().await.presence.is_online(&user)
    }

    pub async fn last_sequence(&self) -> u64 {
        self.state.lock().await.log.last_sequence()
    }

    pub async fn pending_approvals(&self) -> Vec<CollaborativeAction> {
        let state = self.state.lock().await;
        state.log.pending_approvals().into_iter().cloned().collect()
    }

    pub async fn clock_of(&self, user: UserId) -> VectorClock {
        self.state.lock().await.log.clock_of(&user)
    }

    pub fn is_closed(&self) -> bool {
        self.live_read().closed
    }

    // ─── Membership ──────────────────────────────────────────────────

    /// Join as `role`, or re-subscribe if already a member.
    pub async fn join(self: &Arc<Self>, user: UserId, role: Role) -> Result<Subscription, CollabError> {
        let profile = resolve_profile(self.services.identity.as_ref(), user);
        let mut state = self.state.lock().await;
        let now = self.now();

        let admitted = match state.roster.plan_join(&state.session, user, role, profile, now)? {
            JoinPlan::Rejoin => {
                log::debug!("User {user} rejoined session {}", self.session_id);
                false
            }
            JoinPlan::Admit { session, member } => {
                self.services.store.record_join(&session, &member)?;
                let activated = session.status != state.session.status;
                state.session = session;
                state.log.register_member(user);
                self.live_write().set_role(user, member.role);
                state.roster.apply(member);
                log::info!("User {user} joined session {} as {role}", self.session_id);
                if activated {
                    self.emit(None, HubEvent::SessionUpdated { session: state.session.clone() });
                }
                true
            }
        };
        self.attach(&mut state, user, None, admitted)
    }

    /// Reconnect an existing member, replaying every durable action with
    /// sequence greater than `resume_after`.
    pub async fn subscribe(
        self: &Arc<Self>,
        user: UserId,
        resume_after: Option<u64>,
    ) -> Result<Subscription, CollabError> {
        let mut state = self.state.lock().await;
        Self::ensure_open(&state)?;
        state.roster.require(user)?;
        self.attach(&mut state, user, resume_after, false)
    }

    fn attach(
        self: &Arc<Self>,
        state: &mut SessionState,
        user: UserId,
        resume_after: Option<u64>,
        admitted: bool,
    ) -> Result<Subscription, CollabError> {
        // Fetch first so a store failure leaves presence untouched.
        let replay = match resume_after {
            Some(after) => self.collect_since(state, after)?,
            None => Vec::new(),
        };

        let now = self.now();
        let came_online = state.presence.track(user, now).is_some();
        if let Some(member) = state.roster.get_mut(&user) {
            member.last_active = now;
        }

        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        state.latest.insert(user, connection_id);
        let close_rx = state
            .closers
            .entry(user)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe();
        let mut sub = Subscription {
            connection_id,
            user_id: user,
            hub: Arc::clone(self),
            durable_rx: self.durable_tx.subscribe(),
            ephemeral_rx: self.ephemeral_tx.subscribe(),
            close_rx,
            pending: VecDeque::new(),
            last_sequence: resume_after.unwrap_or_else(|| state.log.last_sequence()),
            needs_refill: false,
            closed: false,
        };

        let origin = Some(connection_id);
        if admitted {
            if let Some(member) = self.view_of(state, &user) {
                self.emit(origin, HubEvent::MemberJoined { member });
            }
        } else if came_online {
            self.emit_member(state, origin, &user);
        }

        sub.pending
            .extend(replay.into_iter().map(|action| HubEvent::ActionReceived { action }));
        sub.pending.push_back(self.presence_sync(state));
        log::debug!(
            "Hub {}: connection {connection_id} subscribed for {user} (resume_after={resume_after:?})",
            self.session_id
        );
        Ok(sub)
    }

    /// Leave the session. Leaving twice is a no-op.
    pub async fn leave(&self, user: UserId) -> Result<(), CollabError> {
        let mut state = self.state.lock().await;
        self.remove_member(&mut state, None, user, LeaveReason::Left)?;
        Ok(())
    }

    pub async fn kick_user(
        &self,
        caller: impl Into<Caller>,
        target: UserId,
    ) -> Result<(), CollabError> {
        let caller = caller.into();
        let mut state = self.state.lock().await;
        Self::ensure_open(&state)?;
        Self::require_manager(&state, caller.user_id)?;
        state.roster.require(target)?;
        self.remove_member(&mut state, caller.connection, target, LeaveReason::Kicked)?;
        Ok(())
    }

    fn remove_member(
        &self,
        state: &mut SessionState,
        origin: Option<ConnectionId>,
        user: UserId,
        reason: LeaveReason,
    ) -> Result<bool, CollabError> {
        if state.session.is_completed() {
            return Ok(false);
        }
        let now = self.now();
        let Some(plan) = state.roster.plan_leave(&state.session, user, now) else {
            return Ok(false);
        };
        let promoted: Vec<Member> = plan.promoted.iter().cloned().collect();
        self.services.store.record_leave(&plan.session, user, &promoted)?;

        let turn_changed = plan.session.turn_holder != state.session.turn_holder;
        state.session = plan.session;
        state.roster.remove(&user);
        state.presence.untrack(&user);
        state.latest.remove(&user);
        let group_changed = state.breakout.remove_member(&user).is_some();
        Self::close_connections(state, &user);
        {
            let mut live = self.live_write();
            live.members.remove(&user);
            for member in &promoted {
                live.set_role(member.user_id, member.role);
            }
        }
        for member in promoted.iter().cloned() {
            state.roster.apply(member);
        }

        log::info!(
            "User {user} left session {} ({reason:?}), {} participants",
            self.session_id,
            state.session.current_participants
        );
        self.emit(origin, HubEvent::MemberLeft { user_id: user, reason });
        for member in &promoted {
            log::info!("User {} promoted to leader of {}", member.user_id, self.session_id);
            self.emit_member(state, origin, &member.user_id);
        }
        if turn_changed {
            self.emit(origin, HubEvent::SessionUpdated { session: state.session.clone() });
        }
        if group_changed {
            self.emit_groups(state, origin);
        }
        Ok(true)
    }

    /// Transport drop: close subscriptions and stop heartbeat tracking but
    /// keep membership so the user can resume.
    pub async fn disconnect(&self, user: UserId) {
        let mut state = self.state.lock().await;
        self.drop_transport(&mut state, user);
    }

    /// Like `disconnect`, but a no-op once `user` has attached a newer
    /// connection than `connection`.
    pub async fn drop_connection(&self, user: UserId, connection: ConnectionId) {
        let mut state = self.state.lock().await;
        if state.latest.get(&user).is_some_and(|latest| *latest != connection) {
            log::debug!("Connection {connection} of {user} superseded, keeping presence");
            return;
        }
        self.drop_transport(&mut state, user);
    }

    fn drop_transport(&self, state: &mut SessionState, user: UserId) {
        if !state.roster.contains(&user) {
            return;
        }
        state.latest.remove(&user);
        Self::close_connections(state, &user);
        let was_online = state.presence.untrack(&user).is_some_and(|r| r.online);
        if was_online {
            self.emit_member(state, None, &user);
        }
        log::debug!("User {user} disconnected from {}", self.session_id);
    }

    fn close_connections(state: &mut SessionState, user: &UserId) {
        if let Some(tx) = state.closers.remove(user) {
            let _ = tx.send(true);
        }
    }

    // ─── Presence ────────────────────────────────────────────────────

    /// Heartbeat.
    pub async fn touch(&self, user: UserId) -> Result<(), CollabError> {
        let mut state = self.state.lock().await;
        let now = self.now();
        let member = state.roster.get_mut(&user).ok_or(CollabError::MemberNotFound {
            session_id: self.session_id,
            user_id: user,
        })?;
        member.last_active = now;
        if state.presence.touch(user, now).is_some() {
            self.emit_member(&state, None, &user);
        }
        Ok(())
    }

    /// Mark silent members offline. Returns how many flipped.
    pub async fn sweep_presence(&self) -> usize {
        let mut state = self.state.lock().await;
        let transitions = state.presence.sweep(self.now());
        for t in &transitions {
            self.emit_member(&state, None, &t.user_id);
        }
        transitions.len()
    }

    // ─── Actions ─────────────────────────────────────────────────────

    fn check_mode(
        session: &Session,
        user: UserId,
        perms: &Permissions,
        kind: &ActionKind,
    ) -> Result<(), CollabError> {
        if perms.can_manage_members {
            return Ok(());
        }
        match session.settings.collaboration_mode {
            CollaborationMode::Free => Ok(()),
            CollaborationMode::LeaderControlled if kind.is_control() => {
                Err(CollabError::PermissionDenied {
                    user_id: user,
                    reason: format!("{} is leader-controlled in this session", kind.action_type()),
                })
            }
            CollaborationMode::LeaderControlled => Ok(()),
            CollaborationMode::TurnBased if session.turn_holder == Some(user) => Ok(()),
            CollaborationMode::TurnBased => {
                Err(CollabError::NotYourTurn { user_id: user, holder: session.turn_holder })
            }
        }
    }

    /// Validate, persist and broadcast a new durable action.
    pub async fn execute(
        &self,
        caller: impl Into<Caller>,
        kind: ActionKind,
    ) -> Result<CollaborativeAction, CollabError> {
        let caller = caller.into();
        let user = caller.user_id;
        let mut state = self.state.lock().await;
        Self::ensure_active(&state)?;
        let perms = state.roster.permissions_of(user)?;
        kind.validate()?;
        if let Some(capability) = kind.required_capability() {
            perms.require(user, capability)?;
        }
        Self::check_mode(&state.session, user, &perms, &kind)?;

        let requires_approval = state.session.settings.require_approval && !perms.can_manage_members;
        let now = self.now();
        let action = state.log.prepare_execute(user, kind, requires_approval, now);
        self.services.store.insert_action(&action)?;
        state.log.commit(action.clone())?;

        if let ActionKind::SessionData { key, value } = &action.kind {
            state.session.set_data(key, value.clone(), now);
            state.dirty = true;
        }
        if let Some(member) = state.roster.get_mut(&user) {
            member.last_active = now;
        }
        self.emit(caller.connection, HubEvent::ActionReceived { action: action.clone() });
        Ok(action)
    }

    /// Window first, then the store for trimmed entries.
    fn find_action(
        &self,
        state: &SessionState,
        action_id: ActionId,
    ) -> Result<CollaborativeAction, CollabError> {
        if let Some(action) = state.log.get(&action_id) {
            return Ok(action.clone());
        }
        self.services
            .store
            .load_action(self.session_id, action_id)?
            .ok_or(CollabError::ActionNotFound(action_id))
    }

    /// Revert one of the caller's own actions. Returns the new `undo` action.
    pub async fn undo(
        &self,
        caller: impl Into<Caller>,
        action_id: ActionId,
    ) -> Result<CollaborativeAction, CollabError> {
        let caller = caller.into();
        let user = caller.user_id;
        let mut state = self.state.lock().await;
        Self::ensure_active(&state)?;
        state.roster.require(user)?;
        let target = self.find_action(&state, action_id)?;
        let (reverted, undo) = state.log.prepare_undo(&target, user, self.now())?;
        self.services.store.record_undo(&reverted, &undo)?;
        state.log.commit_undo(reverted.clone(), undo.clone())?;

        self.emit(caller.connection, HubEvent::ActionUpdated { action: reverted });
        self.emit(caller.connection, HubEvent::ActionReceived { action: undo.clone() });
        Ok(undo)
    }

    pub async fn approve(
        &self,
        caller: impl Into<Caller>,
        action_id: ActionId,
    ) -> Result<CollaborativeAction, CollabError> {
        let caller = caller.into();
        let user = caller.user_id;
        let mut state = self.state.lock().await;
        Self::ensure_open(&state)?;
        let perms = state.roster.permissions_of(user)?;
        let qualified =
            perms.can_manage_members || state.session.settings.is_designated_approver(&user);
        let target = self.find_action(&state, action_id)?;
        let approved = CausalActionLog::prepare_approve(&target, user, qualified)?;
        self.services.store.update_action(&approved)?;
        state.log.replace(approved.clone());

        log::debug!("Action {action_id} approved by {user}");
        self.emit(caller.connection, HubEvent::ActionUpdated { action: approved.clone() });
        Ok(approved)
    }

    /// Merge a client-reported clock into the server's view of `user`.
    pub async fn observe_clock(&self, user: UserId, clock: &VectorClock) -> Result<(), CollabError> {
        let mut state = self.state.lock().await;
        state.roster.require(user)?;
        state.log.observe(user, clock);
        Ok(())
    }

    /// One page of actions with sequence > `after`.
    pub async fn actions_since(&self, after: u64) -> Result<Vec<CollaborativeAction>, CollabError> {
        let state = self.state.lock().await;
        self.page_since(&state, after)
    }

    fn page_since(
        &self,
        state: &SessionState,
        after: u64,
    ) -> Result<Vec<CollaborativeAction>, CollabError> {
        match state.log.since(after) {
            Ok(actions) => Ok(actions),
            Err(trimmed) => {
                log::debug!(
                    "Hub {}: seq {after} trimmed (oldest {}), refetching from store",
                    self.session_id,
                    trimmed.oldest_retained
                );
                let mut actions = self.services.store.load_actions_since(
                    self.session_id,
                    after,
                    self.config.refetch_batch,
                )?;
                let reached = actions.last().map_or(after, |a| a.sequence);
                if reached + 1 >= trimmed.oldest_retained {
                    if let Ok(rest) = state.log.since(reached) {
                        actions.extend(rest);
                    }
                }
                Ok(actions)
            }
        }
    }

    /// Every action with sequence > `after`.
    fn collect_since(
        &self,
        state: &SessionState,
        after: u64,
    ) -> Result<Vec<CollaborativeAction>, CollabError> {
        let target = state.log.last_sequence();
        let mut out = Vec::new();
        let mut cursor = after;
        while cursor < target {
            let page = self.page_since(state, cursor)?;
            let Some(last) = page.last() else { break };
            cursor = last.sequence;
            out.extend(page);
        }
        Ok(out)
    }

    /// Events that bring a lagged subscriber at `after` back in sync.
    async fn recovery_events(&self, after: u64) -> Result<Vec<HubEvent>, CollabError> {
        let state = self.state.lock().await;
        let mut events: Vec<HubEvent> = state
            .log
            .iter()
            .filter(|a| a.sequence <= after && (a.is_approved() || a.is_reverted()))
            .cloned()
            .map(|action| HubEvent::ActionUpdated { action })
            .collect();
        events.extend(
            self.collect_since(&state, after)?
                .into_iter()
                .map(|action| HubEvent::ActionReceived { action }),
        );
        events.push(self.presence_sync(&state));
        Ok(events)
    }

    // ─── Members & lifecycle ─────────────────────────────────────────

    pub async fn change_user_role(
        &self,
        caller: impl Into<Caller>,
        target: UserId,
        role: Role,
    ) -> Result<Member, CollabError> {
        let caller = caller.into();
        let mut state = self.state.lock().await;
        Self::ensure_open(&state)?;
        let changed = state.roster.plan_role_change(caller.user_id, target, role)?;
        if !changed.is_empty() {
            self.services.store.upsert_members(&changed)?;
            {
                let mut live = self.live_write();
                for member in &changed {
                    live.set_role(member.user_id, member.role);
                }
            }
            for member in &changed {
                state.roster.apply(member.clone());
            }
            for member in &changed {
                self.emit_member(&state, caller.connection, &member.user_id);
            }
            log::info!("User {target} is now {role} in {}", self.session_id);
        }
        self.view_of(&state, &target).ok_or(CollabError::MemberNotFound {
            session_id: self.session_id,
            user_id: target,
        })
    }

    async fn set_status(&self, caller: Caller, next: SessionStatus) -> Result<Session, CollabError> {
        let mut state = self.state.lock().await;
        Self::require_manager(&state, caller.user_id)?;
        let mut session = state.session.clone();
        session.transition(next, self.now())?;
        if session.status == state.session.status {
            return Ok(session);
        }
        self.services.store.save_session(&session)?;
        state.session = session;
        state.dirty = false;
        log::info!("Session {} is now {}", self.session_id, next.as_str());

        if next == SessionStatus::Completed {
            let users: Vec<UserId> = state.closers.keys().copied().collect();
            for user in users {
                Self::close_connections(&mut state, &user);
            }
            state.presence.clear();
            state.latest.clear();
            self.live_write().closed = true;
            let _ = self.shutdown.send(true);
        }
        self.emit(caller.connection, HubEvent::SessionUpdated { session: state.session.clone() });
        Ok(state.session.clone())
    }

    pub async fn pause(&self, caller: impl Into<Caller>) -> Result<Session, CollabError> {
        self.set_status(caller.into(), SessionStatus::Paused).await
    }

    pub async fn resume(&self, caller: impl Into<Caller>) -> Result<Session, CollabError> {
        self.set_status(caller.into(), SessionStatus::Active).await
    }

    /// Complete the session: persists it, closes every subscription and
    /// stops maintenance. A completed session is never reopened.
    pub async fn close(&self, caller: impl Into<Caller>) -> Result<Session, CollabError> {
        self.set_status(caller.into(), SessionStatus::Completed).await
    }

    pub async fn update_settings(
        &self,
        caller: impl Into<Caller>,
        settings: SessionSettings,
    ) -> Result<Session, CollabError> {
        let caller = caller.into();
        let mut state = self.state.lock().await;
        Self::ensure_open(&state)?;
        Self::require_manager(&state, caller.user_id)?;
        settings.validate()?;

        let mut session = state.session.clone();
        session.turn_holder = match settings.collaboration_mode {
            CollaborationMode::TurnBased => session
                .turn_holder
                .filter(|holder| state.roster.contains(holder))
                .or_else(|| state.roster.leader().map(|l| l.user_id))
                .or(Some(caller.user_id)),
            _ => None,
        };
        session.settings = settings;
        session.updated_at = self.now();
        self.services.store.save_session(&session)?;

        state.log.set_capacity(session.settings.action_log_capacity);
        self.live_write().apply_settings(&session.settings);
        state.session = session;
        self.emit(caller.connection, HubEvent::SessionUpdated { session: state.session.clone() });
        Ok(state.session.clone())
    }

    /// Hand the turn to `next` in a turn-based session.
    pub async fn pass_turn(
        &self,
        caller: impl Into<Caller>,
        next: UserId,
    ) -> Result<Session, CollabError> {
        let caller = caller.into();
        let user = caller.user_id;
        let mut state = self.state.lock().await;
        Self::ensure_open(&state)?;
        if state.session.settings.collaboration_mode != CollaborationMode::TurnBased {
            return Err(CollabError::InvalidAction("session is not turn-based".into()));
        }
        let perms = state.roster.permissions_of(user)?;
        if state.session.turn_holder != Some(user) && !perms.can_manage_members {
            return Err(CollabError::NotYourTurn { user_id: user, holder: state.session.turn_holder });
        }
        state.roster.require(next)?;

        let mut session = state.session.clone();
        session.turn_holder = Some(next);
        session.updated_at = self.now();
        self.services.store.save_session(&session)?;
        state.session = session;
        log::debug!("Turn in {} passed to {next}", self.session_id);
        self.emit(caller.connection, HubEvent::SessionUpdated { session: state.session.clone() });
        Ok(state.session.clone())
    }

    // ─── Breakout groups ─────────────────────────────────────────────

    /// Run a breakout operation with the caller's permissions, then broadcast
    /// the new group layout.
    async fn with_breakout<T>(
        &self,
        caller: Caller,
        targets: &[UserId],
        op: impl FnOnce(&mut BreakoutCoordinator, &Permissions, &[UserId], Timestamp) -> Result<T, CollabError>,
    ) -> Result<T, CollabError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        Self::ensure_open(state)?;
        let perms = state.roster.permissions_of(caller.user_id)?;
        for target in targets {
            state.roster.require(*target)?;
        }
        let online: Vec<UserId> = state
            .roster
            .members()
            .iter()
            .map(|m| m.user_id)
            .filter(|u| state.presence.is_online(u))
            .collect();
        let out = op(&mut state.breakout, &perms, &online, self.now())?;
        self.emit_groups(state, caller.connection);
        Ok(out)
    }

    pub async fn create_group(
        &self,
        caller: impl Into<Caller>,
        name: impl Into<String>,
        members: Vec<UserId>,
    ) -> Result<BreakoutGroup, CollabError> {
        let caller = caller.into();
        let name = name.into();
        self.with_breakout(caller, &members, |b, perms, _, now| {
            b.create_group(caller.user_id, perms, name, &members, now)
        })
        .await
    }

    pub async fn join_group(
        &self,
        caller: impl Into<Caller>,
        target: UserId,
        group_id: GroupId,
    ) -> Result<(), CollabError> {
        let caller = caller.into();
        self.with_breakout(caller, &[target], |b, perms, _, _| {
            b.join_group(caller.user_id, perms, target, group_id)
        })
        .await
    }

    pub async fn leave_group(
        &self,
        caller: impl Into<Caller>,
        target: UserId,
    ) -> Result<Option<GroupId>, CollabError> {
        let caller = caller.into();
        self.with_breakout(caller, &[target], |b, perms, _, _| {
            b.leave_group(caller.user_id, perms, target)
        })
        .await
    }

    pub async fn move_user_to_group(
        &self,
        caller: impl Into<Caller>,
        target: UserId,
        group_id: GroupId,
    ) -> Result<(), CollabError> {
        let caller = caller.into();
        self.with_breakout(caller, &[target], |b, perms, _, _| {
            b.move_user_to_group(caller.user_id, perms, target, group_id)
        })
        .await
    }

    pub async fn close_group(
        &self,
        caller: impl Into<Caller>,
        group_id: GroupId,
    ) -> Result<BreakoutGroup, CollabError> {
        let caller = caller.into();
        self.with_breakout(caller, &[], |b, perms, _, _| b.close_group(caller.user_id, perms, group_id))
            .await
    }

    pub async fn close_all_groups(&self, caller: impl Into<Caller>) -> Result<usize, CollabError> {
        let caller = caller.into();
        self.with_breakout(caller, &[], |b, perms, _, _| b.close_all_groups(caller.user_id, perms))
            .await
    }

    /// Split the online members, in join order, into balanced groups.
    pub async fn auto_assign_groups(
        &self,
        caller: impl Into<Caller>,
        group_size: usize,
    ) -> Result<Vec<BreakoutGroup>, CollabError> {
        let caller = caller.into();
        self.with_breakout(caller, &[], |b, perms, online, now| {
            b.auto_assign(caller.user_id, perms, group_size, online, now)
        })
        .await
    }

    pub async fn groups(&self) -> Vec<BreakoutGroup> {
        self.state.lock().await.breakout.groups().to_vec()
    }

    // ─── Ephemeral ───────────────────────────────────────────────────

    /// Fire-and-forget signal. Takes only the ephemeral lock.
    pub fn broadcast_ephemeral(
        &self,
        caller: impl Into<Caller>,
        signal: EphemeralSignal,
    ) -> Result<(), CollabError> {
        let caller = caller.into();
        let user = caller.user_id;
        {
            let mut live = self.live_write();
            if live.closed {
                return Err(CollabError::SessionClosed(self.session_id));
            }
            match &signal {
                EphemeralSignal::VoiceNote { .. } => {
                    live.authorize_feature(user, Capability::UseVoiceChat)?
                }
                EphemeralSignal::Annotation { .. } => {
                    live.authorize_feature(user, Capability::ShareScreen)?
                }
                EphemeralSignal::Cursor { .. } | EphemeralSignal::Tool { .. } => {}
            }
            let member = live.members.get_mut(&user).ok_or(CollabError::MemberNotFound {
                session_id: self.session_id,
                user_id: user,
            })?;
            match &signal {
                EphemeralSignal::Cursor { position } => member.cursor = Some(position.clone()),
                EphemeralSignal::Tool { tool } => member.tool = tool.clone(),
                _ => {}
            }
        }
        self.emit(caller.connection, HubEvent::from_signal(user, signal));
        Ok(())
    }

    async fn upload(
        &self,
        key: String,
        bytes: Vec<u8>,
        content_type: &'static str,
    ) -> Result<String, CollabError> {
        let blobs = Arc::clone(&self.services.blobs);
        let url = tokio::task::spawn_blocking(move || blobs.put(&key, &bytes, content_type))
            .await
            .map_err(|e| CollabError::TransportUnavailable(format!("blob upload task failed: {e}")))??;
        Ok(url)
    }

    fn precheck_feature(&self, user: UserId, capability: Capability) -> Result<(), CollabError> {
        let live = self.live_read();
        if live.closed {
            return Err(CollabError::SessionClosed(self.session_id));
        }
        live.authorize_feature(user, capability)
    }

    /// Upload audio and broadcast its URL. Returns the URL.
    pub async fn share_voice_note(
        &self,
        caller: impl Into<Caller>,
        audio: Vec<u8>,
        duration: Duration,
    ) -> Result<String, CollabError> {
        let caller = caller.into();
        self.precheck_feature(caller.user_id, Capability::UseVoiceChat)?;
        let key = format!("{}/voice/{}.webm", self.session_id, Uuid::new_v4());
        let url = self.upload(key, audio, "audio/webm").await?;
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.broadcast_ephemeral(caller, EphemeralSignal::VoiceNote { url: url.clone(), duration_ms })?;
        Ok(url)
    }

    /// Upload annotation geometry and broadcast its URL. Returns the URL.
    pub async fn share_annotation(
        &self,
        caller: impl Into<Caller>,
        shape: impl Into<String>,
        geometry: &serde_json::Value,
    ) -> Result<String, CollabError> {
        let caller = caller.into();
        self.precheck_feature(caller.user_id, Capability::ShareScreen)?;
        let bytes =
            serde_json::to_vec(geometry).map_err(|e| CollabError::InvalidAction(e.to_string()))?;
        let key = format!("{}/annotations/{}.json", self.session_id, Uuid::new_v4());
        let url = self.upload(key, bytes, "application/json").await?;
        self.broadcast_ephemeral(
            caller,
            EphemeralSignal::Annotation { shape: shape.into(), geometry_url: url.clone() },
        )?;
        Ok(url)
    }

    // ─── Maintenance ─────────────────────────────────────────────────

    /// Persist `session_data` if it changed since the last save.
    pub async fn autosave(&self) -> Result<bool, CollabError> {
        let mut state = self.state.lock().await;
        if !state.dirty || state.session.is_completed() {
            return Ok(false);
        }
        self.services.store.save_session(&state.session)?;
        state.dirty = false;
        log::debug!("Autosaved session {}", self.session_id);
        Ok(true)
    }

    async fn autosave_interval(&self) -> Duration {
        let secs = self.state.lock().await.session.settings.autosave_interval_secs;
        Duration::from_secs(secs)
    }

    /// Background presence sweep and autosave. Stops when the session is
    /// completed or the hub is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let session_id = self.session_id;
        let mut tick = tokio::time::interval(self.config.presence.sweep_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            let mut last_save = Instant::now();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        let Some(hub) = hub.upgrade() else { break };
                        hub.sweep_presence().await;
                        if last_save.elapsed() >= hub.autosave_interval().await {
                            if let Err(e) = hub.autosave().await {
                                log::warn!("Autosave of {session_id} failed: {e}");
                            }
                            last_save = Instant::now();
                        }
                    }
                }
            }
            log::debug!("Maintenance for {session_id} stopped");
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Subscription
// ───────────────────────────────────────────────────────────────────

/// One connection's view of a hub.
///
/// Durable events arrive in order, at least once: a lagging receiver is
/// forward-filled from the log (or the store) and then sent a fresh
/// `presence_sync`. Duplicate `action_received` events are dropped by
/// sequence. Ephemeral events are dropped on lag.
pub struct Subscription {
    connection_id: ConnectionId,
    user_id: UserId,
    hub: Arc<SessionHub>,
    durable_rx: broadcast::Receiver<Envelope>,
    ephemeral_rx: broadcast::Receiver<Envelope>,
    close_rx: watch::Receiver<bool>,
    pending: VecDeque<HubEvent>,
    /// Highest action sequence delivered.
    last_sequence: u64,
    /// Set on durable lag, cleared once the forward-fill is queued. Survives
    /// a cancelled `recv`.
    needs_refill: bool,
    closed: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("last_sequence", &self.last_sequence)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Caller identity for hub calls made on behalf of this connection.
    pub fn caller(&self) -> Caller {
        Caller { user_id: self.user_id, connection: Some(self.connection_id) }
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn is_closed(&self) -> bool {
        self.closed || *self.close_rx.borrow()
    }

    /// Drop duplicate action events, advancing the sequence high-water mark.
    fn accept(&mut self, event: &HubEvent) -> bool {
        if let HubEvent::ActionReceived { action } = event {
            if action.sequence <= self.last_sequence {
                return false;
            }
            self.last_sequence = action.sequence;
        }
        true
    }

    async fn refill(&mut self) {
        match self.hub.recovery_events(self.last_sequence).await {
            Ok(events) => self.pending.extend(events),
            Err(e) => log::warn!("Connection {} could not forward-fill: {e}", self.connection_id),
        }
        self.needs_refill = false;
    }

    /// Next event, or `None` once the subscription is closed (leave, kick,
    /// disconnect or session completion).
    ///
    /// Cancel-safe: a forward-fill interrupted mid-await is redone on the
    /// next call.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if self.accept(&event) {
                    return Some(event);
                }
                continue;
            }
            if self.is_closed() {
                self.closed = true;
                return None;
            }
            if self.needs_refill {
                self.refill().await;
                continue;
            }
            tokio::select! {
                biased;
                _ = self.close_rx.changed() => {
                    // Only ever flipped to true, or dropped on close.
                    self.closed = true;
                    return None;
                }
                received = self.durable_rx.recv() => match received {
                    Ok(envelope) => {
                        if envelope.origin != Some(self.connection_id) && self.accept(&envelope.event) {
                            return Some(envelope.event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!(
                            "Connection {} lagged by {skipped} durable events, forward-filling",
                            self.connection_id
                        );
                        self.needs_refill = true;
                    }
                    Err(RecvError::Closed) => {
                        self.closed = true;
                        return None;
                    }
                },
                received = self.ephemeral_rx.recv() => match received {
                    Ok(envelope) => {
                        if envelope.origin != Some(self.connection_id) {
                            return Some(envelope.event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::trace!(
                            "Connection {} dropped {skipped} ephemeral events",
                            self.connection_id
                        );
                    }
                    Err(RecvError::Closed) => {
                        self.closed = true;
                        return None;
                    }
                },
            }
        }
    }
}
