//! Append-only causal action log for one session.
//!
//! ```text
//!   execute(A)                      commit
//!   ┌──────────────┐   persist   ┌───────────────────────────────┐
//!   │ prepare:     │ ──────────► │ append, seq = last + 1        │
//!   │  clock[A]+1  │  (store)    │ clock[A] := snapshot          │
//!   │  snapshot    │             │ clock[others] ∪= snapshot     │
//!   └──────────────┘             │ trim oldest beyond capacity   │
//!                                └───────────────────────────────┘
//! ```
//!
//! Mutations are split into a pure `prepare_*` step and a `commit_*` step so
//! the hub can write to the durable store in between: a failed write leaves
//! sequence numbers and clocks untouched.
//!
//! The sequence number is the sole ordering authority. Vector clocks are
//! advisory metadata for action-specific merge logic layered on top.

use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use labsync_core::{
    ActionId, ActionKind, CollabError, CollaborativeAction, SessionId, Timestamp, UserId,
    VectorClock,
};

/// Default in-memory window.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// A forward-fill asked for entries that have been trimmed from memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryTrimmed {
    pub oldest_retained: u64,
}

/// Bounded, sequence-ordered log plus per-member vector clocks.
pub struct CausalActionLog {
    session_id: SessionId,
    capacity: usize,
    entries: VecDeque<CollaborativeAction>,
    last_sequence: u64,
    clocks: HashMap<UserId, VectorClock>,
}

impl CausalActionLog {
    pub fn new(session_id: SessionId, capacity: usize) -> Self {
        Self {
            session_id,
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.clamp(1, 1024)),
            last_sequence: 0,
            clocks: HashMap::new(),
        }
    }

    /// Rebuild from persisted history.
    ///
    /// Every listed member is assumed to have observed the whole history, so
    /// each starts from the merged frontier.
    pub fn restore(
        session_id: SessionId,
        capacity: usize,
        mut history: Vec<CollaborativeAction>,
        members: &[UserId],
    ) -> Self {
        history.sort_by_key(|a| a.sequence);
        let mut log = Self::new(session_id, capacity);
        let mut frontier = VectorClock::new();
        for action in &history {
            frontier.merge(&action.vector_clock);
            log.last_sequence = log.last_sequence.max(action.sequence);
        }
        for user in members {
            log.clocks.insert(*user, frontier.clone());
        }
        let skip = history.len().saturating_sub(log.capacity);
        log.entries.extend(history.into_iter().skip(skip));
        log
    }

    // ─── Members & clocks ────────────────────────────────────────────

    /// Ensure `user` has a clock. Existing clocks are kept (monotonic).
    pub fn register_member(&mut self, user: UserId) {
        self.clocks.entry(user).or_default();
    }

    /// Merge a client-reported clock into the server's view of `user`.
    pub fn observe(&mut self, user: UserId, incoming: &VectorClock) {
        self.clocks.entry(user).or_default().merge(incoming);
    }

    pub fn clock_of(&self, user: &UserId) -> VectorClock {
        self.clocks.get(user).cloned().unwrap_or_default()
    }

    // ─── Execute ─────────────────────────────────────────────────────

    /// Build the next action without mutating the log.
    pub fn prepare_execute(
        &self,
        actor: UserId,
        kind: ActionKind,
        requires_approval: bool,
        now: Timestamp,
    ) -> CollaborativeAction {
        let mut snapshot = self.clock_of(&actor);
        snapshot.increment(actor);
        CollaborativeAction {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            user_id: actor,
            sequence: self.last_sequence + 1,
            timestamp: now,
            kind,
            requires_approval,
            approved_by: None,
            reverted_at: None,
            vector_clock: snapshot,
        }
    }

    /// Append a prepared action. Its sequence must be the next one.
    pub fn commit(&mut self, action: CollaborativeAction) -> Result<(), CollabError> {
        if action.sequence != self.last_sequence + 1 {
            return Err(CollabError::InvalidAction(format!(
                "out-of-order commit: expected sequence {}, got {}",
                self.last_sequence + 1,
                action.sequence
            )));
        }
        let actor = action.user_id;
        self.clocks.entry(actor).or_default().merge(&action.vector_clock);
        // Fan-out delivers the action to every member, so each observes it.
        for (user, clock) in self.clocks.iter_mut() {
            if *user != actor {
                clock.merge(&action.vector_clock);
            }
        }
        self.last_sequence = action.sequence;
        log::debug!(
            "Log {}: seq {} {} by {}",
            self.session_id,
            action.sequence,
            action.kind.action_type(),
            actor
        );
        self.entries.push_back(action);
        self.trim();
        Ok(())
    }

    /// `prepare_execute` + `commit` for callers without a durable store.
    pub fn execute(
        &mut self,
        actor: UserId,
        kind: ActionKind,
        requires_approval: bool,
        now: Timestamp,
    ) -> Result<CollaborativeAction, CollabError> {
        kind.validate()?;
        let action = self.prepare_execute(actor, kind, requires_approval, now);
        self.commit(action.clone())?;
        Ok(action)
    }

    // ─── Undo ────────────────────────────────────────────────────────

    /// Validate an undo of `target` by `user` and build both records:
    /// the target with `reverted_at` set, and the new `undo` action.
    pub fn prepare_undo(
        &self,
        target: &CollaborativeAction,
        user: UserId,
        now: Timestamp,
    ) -> Result<(CollaborativeAction, CollaborativeAction), CollabError> {
        if target.user_id != user {
            return Err(CollabError::PermissionDenied {
                user_id: user,
                reason: format!("only the original actor may undo action {}", target.id),
            });
        }
        if matches!(target.kind, ActionKind::Undo { .. }) {
            return Err(CollabError::InvalidAction("an undo cannot itself be undone".into()));
        }
        if target.is_reverted() {
            return Err(CollabError::AlreadyReverted(target.id));
        }
        let mut reverted = target.clone();
        reverted.reverted_at = Some(now);
        let undo = self.prepare_execute(user, ActionKind::Undo { target: target.id }, false, now);
        Ok((reverted, undo))
    }

    pub fn commit_undo(
        &mut self,
        reverted: CollaborativeAction,
        undo: CollaborativeAction,
    ) -> Result<(), CollabError> {
        self.replace(reverted);
        self.commit(undo)
    }

    /// Convenience wrapper over the window only.
    pub fn undo(
        &mut self,
        action_id: ActionId,
        user: UserId,
        now: Timestamp,
    ) -> Result<(CollaborativeAction, CollaborativeAction), CollabError> {
        let target = self.get(&action_id).cloned().ok_or(CollabError::ActionNotFound(action_id))?;
        let (reverted, undo) = self.prepare_undo(&target, user, now)?;
        self.commit_undo(reverted.clone(), undo.clone())?;
        Ok((reverted, undo))
    }

    // ─── Approve ─────────────────────────────────────────────────────

    /// Validate an approval. `qualified` is whether the approver holds
    /// `can_manage_members` or is a designated approver.
    pub fn prepare_approve(
        target: &CollaborativeAction,
        approver: UserId,
        qualified: bool,
    ) -> Result<CollaborativeAction, CollabError> {
        if !qualified {
            return Err(CollabError::PermissionDenied {
                user_id: approver,
                reason: "approving requires can_manage_members or designated approver".into(),
            });
        }
        if !target.requires_approval {
            return Err(CollabError::ApprovalNotRequired(target.id));
        }
        if let Some(by) = target.approved_by {
            return Err(CollabError::AlreadyApproved { action_id: target.id, approved_by: by });
        }
        let mut approved = target.clone();
        approved.approved_by = Some(approver);
        Ok(approved)
    }

    pub fn approve(
        &mut self,
        action_id: ActionId,
        approver: UserId,
        qualified: bool,
    ) -> Result<CollaborativeAction, CollabError> {
        let target = self.get(&action_id).ok_or(CollabError::ActionNotFound(action_id))?;
        let approved = Self::prepare_approve(target, approver, qualified)?;
        self.replace(approved.clone());
        Ok(approved)
    }

    /// Overwrite an entry still in the window. Returns `false` if trimmed.
    pub fn replace(&mut self, updated: CollaborativeAction) -> bool {
        match self.entries.iter_mut().find(|a| a.id == updated.id) {
            Some(slot) => {
                *slot = updated;
                true
            }
            None => false,
        }
    }

    // ─── Queries ─────────────────────────────────────────────────────

    pub fn get(&self, action_id: &ActionId) -> Option<&CollaborativeAction> {
        self.entries.iter().find(|a| a.id == *action_id)
    }

    pub fn by_sequence(&self, sequence: u64) -> Option<&CollaborativeAction> {
        let first = self.entries.front()?.sequence;
        let idx = sequence.checked_sub(first)? as usize;
        self.entries.get(idx).filter(|a| a.sequence == sequence)
    }

    /// Every action with sequence > `after`, in order.
    pub fn since(&self, after: u64) -> Result<Vec<CollaborativeAction>, HistoryTrimmed> {
        if after >= self.last_sequence {
            return Ok(Vec::new());
        }
        let oldest = self.oldest_sequence().unwrap_or(self.last_sequence + 1);
        if after + 1 < oldest {
            return Err(HistoryTrimmed { oldest_retained: oldest });
        }
        Ok(self.entries.iter().filter(|a| a.sequence > after).cloned().collect())
    }

    pub fn pending_approvals(&self) -> Vec<&CollaborativeAction> {
        self.entries.iter().filter(|a| a.awaiting_approval()).collect()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn oldest_sequence(&self) -> Option<u64> {
        self.entries.front().map(|a| a.sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.trim();
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &CollaborativeAction> {
        self.entries.iter()
    }

    /// Drop only the oldest entries beyond the bound.
    fn trim(&mut self) {
        let excess = self.entries.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.entries.drain(..excess);
            log::trace!("Log {}: trimmed {excess} entries", self.session_id);
        }
    }
}
