//! Session directory: creates hubs, finds them, rehydrates them from the
//! store after a restart.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use labsync_core::{CollabError, Member, Role, Session, SessionConfig, SessionId, UserId};

use crate::config::HubConfig;
use crate::hub::{Caller, HubServices, SessionHub, Subscription};
use crate::identity::resolve_profile;

pub struct SessionRegistry {
    services: HubServices,
    config: HubConfig,
    hubs: RwLock<HashMap<SessionId, Arc<SessionHub>>>,
}

impl SessionRegistry {
    pub fn new(services: HubServices, config: HubConfig) -> Result<Self, CollabError> {
        config.validate()?;
        Ok(Self { services, config, hubs: RwLock::new(HashMap::new()) })
    }

    pub fn services(&self) -> &HubServices {
        &self.services
    }

    fn start(&self, hub: &Arc<SessionHub>) {
        if self.config.spawn_maintenance {
            hub.spawn_maintenance();
        }
    }

    /// Create a session; the creator becomes its leader and is subscribed.
    pub async fn create_session(
        &self,
        creator: UserId,
        config: SessionConfig,
    ) -> Result<(Arc<SessionHub>, Subscription), CollabError> {
        let now = self.services.time.now();
        let session = Session::from_config(Uuid::new_v4(), config, creator, now)?;
        let profile = resolve_profile(self.services.identity.as_ref(), creator);
        let leader = Member::new(session.id, creator, Role::Leader, profile, now);
        self.services.store.record_join(&session, &leader)?;

        let session_id = session.id;
        let hub = SessionHub::new(
            session,
            vec![leader],
            Vec::new(),
            self.services.clone(),
            self.config.clone(),
        );
        self.hubs.write().await.insert(session_id, Arc::clone(&hub));
        self.start(&hub);
        log::info!("Created session {session_id} for {creator}");

        let subscription = hub.subscribe(creator, None).await?;
        Ok((hub, subscription))
    }

    /// Live hub for `session_id`, loading it from the store if needed.
    pub async fn hub(&self, session_id: SessionId) -> Result<Arc<SessionHub>, CollabError> {
        if let Some(hub) = self.hubs.read().await.get(&session_id) {
            return Ok(Arc::clone(hub));
        }

        let mut hubs = self.hubs.write().await;
        if let Some(hub) = hubs.get(&session_id) {
            return Ok(Arc::clone(hub));
        }
        let hub = self.load(session_id)?;
        hubs.insert(session_id, Arc::clone(&hub));
        drop(hubs);
        self.start(&hub);
        Ok(hub)
    }

    fn load(&self, session_id: SessionId) -> Result<Arc<SessionHub>, CollabError> {
        let store = &self.services.store;
        let session = store
            .load_session(session_id)?
            .ok_or(CollabError::SessionNotFound(session_id))?;
        if session.is_completed() {
            return Err(CollabError::SessionClosed(session_id));
        }
        let members = store.load_members(session_id)?;
        let last = store.last_sequence(session_id)?;
        let capacity = session.settings.action_log_capacity as u64;
        let history = store.load_actions_since(
            session_id,
            last.saturating_sub(capacity),
            session.settings.action_log_capacity,
        )?;
        log::info!(
            "Rehydrated session {session_id}: {} members, {} actions in window (last seq {last})",
            members.len(),
            history.len()
        );
        Ok(SessionHub::new(session, members, history, self.services.clone(), self.config.clone()))
    }

    pub async fn join_session(
        &self,
        session_id: SessionId,
        user: UserId,
        role: Role,
    ) -> Result<Subscription, CollabError> {
        self.hub(session_id).await?.join(user, role).await
    }

    pub async fn leave_session(&self, session_id: SessionId, user: UserId) -> Result<(), CollabError> {
        self.hub(session_id).await?.leave(user).await
    }

    /// Complete a session and drop its hub.
    pub async fn close_session(
        &self,
        caller: impl Into<Caller>,
        session_id: SessionId,
    ) -> Result<Session, CollabError> {
        let hub = self.hub(session_id).await?;
        let session = hub.close(caller).await?;
        self.hubs.write().await.remove(&session_id);
        Ok(session)
    }

    /// Load every unfinished session from the store. Returns how many hubs
    /// are live afterwards.
    pub async fn recover(&self) -> Result<usize, CollabError> {
        let sessions = self.services.store.list_sessions()?;
        for session in sessions.iter().filter(|s| !s.is_completed()) {
            if let Err(e) = self.hub(session.id).await {
                log::warn!("Could not recover session {}: {e}", session.id);
            }
        }
        Ok(self.hubs.read().await.len())
    }

    pub async fn sessions(&self) -> Vec<SessionId> {
        self.hubs.read().await.keys().copied().collect()
    }

    pub async fn is_loaded(&self, session_id: SessionId) -> bool {
        self.hubs.read().await.contains_key(&session_id)
    }
}
