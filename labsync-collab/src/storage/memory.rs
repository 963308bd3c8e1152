//! In-process `SessionStore`.
//!
//! Keeps clones of every record behind one mutex. A failure switch makes
//! every call return `StoreError::Unavailable`, which is how tests exercise
//! the store-write-first rollback paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use labsync_core::{ActionId, CollaborativeAction, Member, Session, SessionId, UserId};

use super::{SessionStore, StoreError};

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, Session>,
    /// Members in insertion order.
    members: HashMap<SessionId, Vec<Member>>,
    actions: HashMap<SessionId, BTreeMap<u64, CollaborativeAction>>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful write calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn action_count(&self, session_id: SessionId) -> usize {
        self.tables
            .lock()
            .map(|t| t.actions.get(&session_id).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        self.tables
            .lock()
            .map_err(|_| StoreError::DatabaseError("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        let guard = self.tables()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(guard)
    }
}

impl SessionStore for MemoryStore {
    fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        self.write()?.sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.tables()?.sessions.get(&session_id).cloned())
    }

    fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self.tables()?.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    fn upsert_member(&self, member: &Member) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let rows = tables.members.entry(member.session_id).or_default();
        match rows.iter_mut().find(|m| m.user_id == member.user_id) {
            Some(row) => *row = member.clone(),
            None => rows.push(member.clone()),
        }
        Ok(())
    }

    fn remove_member(&self, session_id: SessionId, user_id: UserId) -> Result<(), StoreError> {
        if let Some(rows) = self.write()?.members.get_mut(&session_id) {
            rows.retain(|m| m.user_id != user_id);
        }
        Ok(())
    }

    fn load_members(&self, session_id: SessionId) -> Result<Vec<Member>, StoreError> {
        Ok(self.tables()?.members.get(&session_id).cloned().unwrap_or_default())
    }

    fn insert_action(&self, action: &CollaborativeAction) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let log = tables.actions.entry(action.session_id).or_default();
        if log.contains_key(&action.sequence) {
            return Err(StoreError::DatabaseError(format!(
                "duplicate sequence {} in session {}",
                action.sequence, action.session_id
            )));
        }
        log.insert(action.sequence, action.clone());
        Ok(())
    }

    fn update_action(&self, action: &CollaborativeAction) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let slot = tables
            .actions
            .get_mut(&action.session_id)
            .and_then(|log| log.get_mut(&action.sequence))
            .ok_or_else(|| {
                StoreError::DatabaseError(format!("no action at sequence {}", action.sequence))
            })?;
        *slot = action.clone();
        Ok(())
    }

    fn load_actions_since(
        &self,
        session_id: SessionId,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<CollaborativeAction>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .actions
            .get(&session_id)
            .map(|log| {
                log.range(after_seq.saturating_add(1)..)
                    .take(limit)
                    .map(|(_, a)| a.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn load_action(
        &self,
        session_id: SessionId,
        action_id: ActionId,
    ) -> Result<Option<CollaborativeAction>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .actions
            .get(&session_id)
            .and_then(|log| log.values().find(|a| a.id == action_id).cloned()))
    }

    fn last_sequence(&self, session_id: SessionId) -> Result<u64, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .actions
            .get(&session_id)
            .and_then(|log| log.keys().next_back().copied())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labsync_core::{ActionKind, DisplayProfile, Role, SessionConfig, VectorClock};
    use uuid::Uuid;

    fn session() -> Session {
        Session::from_config(
            Uuid::new_v4(),
            SessionConfig::new(Uuid::new_v4(), "Optics", 4),
            Uuid::new_v4(),
            0,
        )
        .unwrap()
    }

    fn action(session_id: SessionId, sequence: u64) -> CollaborativeAction {
        CollaborativeAction {
            id: Uuid::new_v4(),
            session_id,
            user_id: Uuid::new_v4(),
            sequence,
            timestamp: sequence * 10,
            kind: ActionKind::NotebookEdit { cell_id: "c".into(), content: sequence.to_string() },
            requires_approval: false,
            approved_by: None,
            reverted_at: None,
            vector_clock: VectorClock::new(),
        }
    }

    #[test]
    fn test_session_roundtrip_and_list() {
        let store = MemoryStore::new();
        let s = session();
        store.save_session(&s).unwrap();
        assert_eq!(store.load_session(s.id).unwrap(), Some(s.clone()));
        assert_eq!(store.list_sessions().unwrap().len(), 1);
        assert_eq!(store.load_session(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_members_keep_insertion_order() {
        let store = MemoryStore::new();
        let s = session();
        let users: Vec<UserId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, u) in users.iter().enumerate() {
            let m = Member::new(s.id, *u, Role::Member, DisplayProfile::named("x"), i as u64);
            store.upsert_member(&m).unwrap();
        }
        let mut changed = store.load_members(s.id).unwrap()[1].clone();
        changed.role = Role::Observer;
        store.upsert_member(&changed).unwrap();
        store.remove_member(s.id, users[0]).unwrap();

        let loaded = store.load_members(s.id).unwrap();
        assert_eq!(loaded.iter().map(|m| m.user_id).collect::<Vec<_>>(), users[1..].to_vec());
        assert_eq!(loaded[0].role, Role::Observer);
    }

    #[test]
    fn test_actions_since_with_limit() {
        let store = MemoryStore::new();
        let sid = Uuid::new_v4();
        for seq in 1..=10 {
            store.insert_action(&action(sid, seq)).unwrap();
        }
        let page = store.load_actions_since(sid, 3, 4).unwrap();
        assert_eq!(page.iter().map(|a| a.sequence).collect::<Vec<_>>(), vec![4, 5, 6, 7]);
        assert_eq!(store.last_sequence(sid).unwrap(), 10);
        assert!(store.insert_action(&action(sid, 5)).is_err());
    }

    #[test]
    fn test_update_and_lookup_action() {
        let store = MemoryStore::new();
        let sid = Uuid::new_v4();
        let mut a = action(sid, 1);
        store.insert_action(&a).unwrap();
        a.reverted_at = Some(99);
        store.update_action(&a).unwrap();
        assert_eq!(store.load_action(sid, a.id).unwrap().unwrap().reverted_at, Some(99));
        assert!(store.update_action(&action(sid, 2)).is_err());
    }

    #[test]
    fn test_failure_switch() {
        let store = MemoryStore::new();
        let s = session();
        store.set_failing(true);
        assert!(matches!(store.save_session(&s), Err(StoreError::Unavailable(_))));
        assert!(store.load_session(s.id).is_err());
        assert_eq!(store.write_count(), 0);

        store.set_failing(false);
        store.save_session(&s).unwrap();
        assert_eq!(store.write_count(), 1);
    }
}
