//! Per-session member table and participant accounting.
//!
//! The roster plans every membership change as a set of updated rows
//! without mutating itself, so the hub can persist the plan first and apply
//! it only once the store has accepted it.
//!
//! Leader policy: at most one leader. Promoting someone to leader demotes
//! the current one to member; when the leader leaves, the longest-joined
//! remaining member is promoted.

use labsync_core::{
    Capability, CollabError, DisplayProfile, Member, Permissions, Role, Session, SessionId,
    SessionStatus, Timestamp, UserId,
};

/// Outcome of a join request.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinPlan {
    /// Already a member: re-subscribe, counts unchanged.
    Rejoin,
    /// New member plus the session row to persist with it.
    Admit { session: Session, member: Member },
}

/// Rows touched by a departure.
#[derive(Debug, Clone, PartialEq)]
pub struct LeavePlan {
    pub removed: Member,
    pub session: Session,
    /// Longest-joined remaining member, now leader.
    pub promoted: Option<Member>,
}

/// Members of one session in join order.
pub struct Roster {
    session_id: SessionId,
    members: Vec<Member>,
}

impl Roster {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id, members: Vec::new() }
    }

    /// Rebuild from persisted rows. Everyone starts offline.
    pub fn restore(session_id: SessionId, mut members: Vec<Member>) -> Self {
        members.retain(|m| m.session_id == session_id);
        members.sort_by_key(|m| m.joined_at);
        for m in &mut members {
            m.is_online = false;
        }
        Self { session_id, members }
    }

    pub fn get(&self, user_id: &UserId) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == *user_id)
    }

    pub fn get_mut(&mut self, user_id: &UserId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.user_id == *user_id)
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.get(user_id).is_some()
    }

    /// Member or `MemberNotFound`.
    pub fn require(&self, user_id: UserId) -> Result<&Member, CollabError> {
        self.get(&user_id).ok_or(CollabError::MemberNotFound {
            session_id: self.session_id,
            user_id,
        })
    }

    /// Capabilities of a member, `MemberNotFound` for strangers.
    pub fn permissions_of(&self, user_id: UserId) -> Result<Permissions, CollabError> {
        self.require(user_id).map(Member::permissions)
    }

    pub fn leader(&self) -> Option<&Member> {
        self.members.iter().find(|m| m.role == Role::Leader)
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.members.iter().map(|m| m.user_id).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    // ─── Planning ────────────────────────────────────────────────────

    pub fn plan_join(
        &self,
        session: &Session,
        user_id: UserId,
        role: Role,
        profile: DisplayProfile,
        now: Timestamp,
    ) -> Result<JoinPlan, CollabError> {
        if session.is_completed() {
            return Err(CollabError::SessionClosed(session.id));
        }
        if self.contains(&user_id) {
            return Ok(JoinPlan::Rejoin);
        }
        if session.is_full() {
            return Err(CollabError::SessionFull {
                session_id: session.id,
                max_participants: session.max_participants,
            });
        }
        if role == Role::Leader {
            if let Some(leader) = self.leader() {
                return Err(CollabError::LeaderConflict {
                    session_id: session.id,
                    leader: leader.user_id,
                });
            }
        }

        let mut next = session.clone();
        next.current_participants += 1;
        if next.status == SessionStatus::Pending {
            next.transition(SessionStatus::Active, now)?;
        }
        next.updated_at = now;
        Ok(JoinPlan::Admit {
            session: next,
            member: Member::new(session.id, user_id, role, profile, now),
        })
    }

    /// `None` when `user_id` is not a member (leave is idempotent).
    pub fn plan_leave(&self, session: &Session, user_id: UserId, now: Timestamp) -> Option<LeavePlan> {
        let removed = self.get(&user_id)?.clone();
        let mut next = session.clone();
        next.current_participants = next.current_participants.saturating_sub(1);
        next.updated_at = now;

        let promoted = if removed.role == Role::Leader {
            self.members.iter().find(|m| m.user_id != user_id).map(|m| {
                let mut m = m.clone();
                m.role = Role::Leader;
                m
            })
        } else {
            None
        };

        if next.turn_holder == Some(user_id) {
            next.turn_holder = promoted
                .as_ref()
                .map(|m| m.user_id)
                .or_else(|| self.leader().map(|l| l.user_id).filter(|l| *l != user_id));
        }

        Some(LeavePlan { removed, session: next, promoted })
    }

    /// Rows changed by giving `target` a new role. Empty when nothing changes.
    pub fn plan_role_change(
        &self,
        caller: UserId,
        target: UserId,
        role: Role,
    ) -> Result<Vec<Member>, CollabError> {
        self.permissions_of(caller)?.require(caller, Capability::ManageMembers)?;
        let current = self.require(target)?;
        if current.role == role {
            return Ok(Vec::new());
        }

        let mut changed = Vec::with_capacity(2);
        if role == Role::Leader {
            if let Some(leader) = self.leader() {
                let mut demoted = leader.clone();
                demoted.role = Role::Member;
                changed.push(demoted);
            }
        }
        let mut updated = current.clone();
        updated.role = role;
        changed.push(updated);
        Ok(changed)
    }

    // ─── Applying ────────────────────────────────────────────────────

    /// Insert or replace a member row.
    pub fn apply(&mut self, member: Member) {
        match self.get_mut(&member.user_id) {
            Some(row) => *row = member,
            None => self.members.push(member),
        }
    }

    pub fn remove(&mut self, user_id: &UserId) -> Option<Member> {
        let idx = self.members.iter().position(|m| m.user_id == *user_id)?;
        Some(self.members.remove(idx))
    }
}
